//! A simulated camera preview looking at the LED of the trigger box.

use std::time::Duration;

use machine_vision_formats::{owned::OImage, pixel_format::RGB8};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, trace};

use crate::config::SourceConfig;

/// How long the LED stays lit per flash.
pub const LED_ON_DURATION: Duration = Duration::from_secs(5);
/// Button presses closer together than this are contact bounce.
pub const LED_DEBOUNCE: Duration = Duration::from_millis(50);
/// Minimum dark time after a flash before the LED can flash again.
pub const LED_COOLDOWN: Duration = Duration::from_secs(1);

const BACKGROUND: u8 = 24;
const LED_COLOR: [u8; 3] = [255, 90, 60];

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("cannot create {width}x{height} frame")]
    FrameSize { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedTiming {
    pub on: Duration,
    pub debounce: Duration,
    pub cooldown: Duration,
}

impl Default for LedTiming {
    fn default() -> Self {
        Self {
            on: LED_ON_DURATION,
            debounce: LED_DEBOUNCE,
            cooldown: LED_COOLDOWN,
        }
    }
}

fn secs_or(value: f64, default: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(default)
}

impl LedTiming {
    pub fn from_config(cfg: &SourceConfig) -> Self {
        Self {
            on: secs_or(cfg.led_on_secs, LED_ON_DURATION),
            debounce: secs_or(cfg.debounce_secs, LED_DEBOUNCE),
            cooldown: secs_or(cfg.cooldown_secs, LED_COOLDOWN),
        }
    }
}

/// The LED of the trigger box. Times are on the caller's clock.
#[derive(Debug)]
pub struct TriggerLed {
    timing: LedTiming,
    last_press: Option<Duration>,
    lit_since: Option<Duration>,
}

impl TriggerLed {
    pub fn new(timing: LedTiming) -> Self {
        Self {
            timing,
            last_press: None,
            lit_since: None,
        }
    }

    /// Press the button. Returns whether this started a flash.
    pub fn press(&mut self, now: Duration) -> bool {
        if let Some(last) = self.last_press {
            if now.saturating_sub(last) < self.timing.debounce {
                trace!("debounced press at {now:?}");
                return false;
            }
        }
        self.last_press = Some(now);
        if let Some(since) = self.lit_since {
            let ready_at = since + self.timing.on + self.timing.cooldown;
            if now < ready_at {
                debug!("LED not ready until {ready_at:?}, ignoring press");
                return false;
            }
        }
        self.lit_since = Some(now);
        true
    }

    pub fn is_lit(&self, now: Duration) -> bool {
        self.lit_since
            .is_some_and(|since| now >= since && now - since < self.timing.on)
    }
}

/// Renders RGB8 preview frames: a dim noisy background, with a saturated red
/// disc in the middle while the LED is lit.
pub struct SyntheticLedSource {
    width: u32,
    height: u32,
    noise: u8,
    rng: StdRng,
    led: TriggerLed,
}

impl SyntheticLedSource {
    pub fn new(cfg: &SourceConfig) -> Self {
        let seed = cfg.seed.unwrap_or_else(|| rand::rng().random());
        debug!("synthetic source noise seed {seed}");
        Self {
            width: cfg.width,
            height: cfg.height,
            noise: cfg.noise,
            rng: StdRng::seed_from_u64(seed),
            led: TriggerLed::new(LedTiming::from_config(cfg)),
        }
    }

    pub fn led(&self) -> &TriggerLed {
        &self.led
    }

    pub fn press_button(&mut self, now: Duration) -> bool {
        self.led.press(now)
    }

    pub fn render(&mut self, now: Duration) -> Result<OImage<RGB8>, SourceError> {
        let (w, h) = (self.width as usize, self.height as usize);
        let stride = w * 3;
        let lit = self.led.is_lit(now);
        let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
        let radius = w.min(h) as f64 / 2.0;

        let mut buf = vec![0u8; stride * h];
        for (y, row) in buf.chunks_exact_mut(stride).enumerate() {
            let dy = y as f64 + 0.5 - cy;
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let dx = x as f64 + 0.5 - cx;
                if lit && dx * dx + dy * dy <= radius * radius {
                    px.copy_from_slice(&LED_COLOR);
                } else {
                    for c in px.iter_mut() {
                        *c = BACKGROUND.saturating_add(self.rng.random_range(0..=self.noise));
                    }
                }
            }
        }
        OImage::new(self.width, self.height, stride, buf).ok_or(SourceError::FrameSize {
            width: self.width,
            height: self.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drop_trigger::TriggerDetector;
    use drop_trigger_types::DetectorConfig;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn led_stays_lit_for_on_duration() {
        let mut led = TriggerLed::new(LedTiming::default());
        assert!(!led.is_lit(ms(0)));
        assert!(led.press(ms(1000)));
        assert!(led.is_lit(ms(1000)));
        assert!(led.is_lit(ms(5999)));
        assert!(!led.is_lit(ms(6000)));
    }

    #[test]
    fn bounce_is_ignored() {
        let mut led = TriggerLed::new(LedTiming::default());
        assert!(led.press(ms(0)));
        assert!(!led.press(ms(20)));
        assert_eq!(led.lit_since, Some(ms(0)));
    }

    #[test]
    fn cooldown_after_flash() {
        let mut led = TriggerLed::new(LedTiming::default());
        assert!(led.press(ms(0)));
        // still lit
        assert!(!led.press(ms(3000)));
        // dark, but cooling down
        assert!(!led.press(ms(5500)));
        assert!(led.press(ms(6000)));
        assert!(led.is_lit(ms(6100)));
    }

    #[test]
    fn rendered_frames_drive_the_detector() {
        let cfg = SourceConfig {
            width: 64,
            height: 48,
            seed: Some(1),
            ..Default::default()
        };
        let mut source = SyntheticLedSource::new(&cfg);
        let mut detector = TriggerDetector::new(DetectorConfig::default());
        detector.set_enabled(true);

        let dark = source.render(ms(0)).unwrap();
        assert!(!detector.detect(&dark, ms(0)).is_triggered());

        assert!(source.press_button(ms(10)));
        let lit = source.render(ms(40)).unwrap();
        assert!(detector.detect(&lit, ms(40)).is_triggered());
    }
}
