//! Classify per-frame color readings as trigger events.
//!
//! Three scalar comparisons per frame and one piece of state, the time of the
//! last trigger, which implements the cooldown. This runs for every preview
//! frame, so it must stay cheap.

use std::time::Duration;

use machine_vision_formats::{ImageStride, PixelFormat};
use tracing::{debug, trace};

use drop_trigger_types::{ColorReading, DetectionResult, DetectorConfig};

use crate::{
    Error, Result,
    sampler::{self, SampleError},
};

/// Why a frame was not evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Detection is switched off.
    Disabled,
    /// A trigger fired less than `cooldown` ago.
    CoolingDown,
    /// The frame could not be sampled.
    Unavailable(SampleError),
}

/// Outcome of [TriggerDetector::detect].
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Skipped(SkipReason),
    Evaluated(DetectionResult),
}

impl Detection {
    /// The result if the frame was evaluated.
    pub fn result(&self) -> Option<&DetectionResult> {
        match self {
            Detection::Evaluated(r) => Some(r),
            Detection::Skipped(_) => None,
        }
    }

    /// `true` only for an evaluated frame which met all criteria.
    pub fn is_triggered(&self) -> bool {
        self.result().is_some_and(|r| r.is_triggered)
    }
}

#[derive(Debug, Default)]
pub struct TriggerDetector {
    enabled: bool,
    last_trigger_time: Option<Duration>,
    config: DetectorConfig,
}

impl TriggerDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            enabled: false,
            last_trigger_time: None,
            config,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Replace the configuration. Refused while enabled so that one capture
    /// attempt is evaluated with one configuration throughout.
    pub fn set_config(&mut self, config: DetectorConfig) -> Result<()> {
        if self.enabled {
            return Err(Error::DetectorBusy);
        }
        self.config = config;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn last_trigger_time(&self) -> Option<Duration> {
        self.last_trigger_time
    }

    /// Forget the last trigger so that no cooldown is in effect.
    ///
    /// Must be called on every re-arm, otherwise a cooldown left over from
    /// the previous attempt can swallow the first real trigger.
    pub fn reset(&mut self) {
        self.last_trigger_time = None;
    }

    fn skip_reason(&self, now: Duration) -> Option<SkipReason> {
        if !self.enabled {
            return Some(SkipReason::Disabled);
        }
        if let Some(last) = self.last_trigger_time {
            // A timestamp from before the last trigger also counts as within
            // the cooldown.
            if now.checked_sub(last).is_none_or(|dt| dt < self.config.cooldown) {
                return Some(SkipReason::CoolingDown);
            }
        }
        None
    }

    /// Sample `frame` and evaluate it against the trigger criteria.
    ///
    /// Disabled and cooling-down frames are skipped before sampling.
    pub fn detect<IM, FMT>(&mut self, frame: &IM, now: Duration) -> Detection
    where
        IM: ImageStride<FMT>,
        FMT: PixelFormat + 'static,
    {
        if let Some(reason) = self.skip_reason(now) {
            return Detection::Skipped(reason);
        }
        match sampler::sample(frame) {
            Ok(reading) => Detection::Evaluated(self.evaluate(&reading, now)),
            Err(e) => {
                trace!("skipping frame at {now:?}: {e}");
                Detection::Skipped(SkipReason::Unavailable(e))
            }
        }
    }

    /// Like [Self::detect] for an already sampled reading.
    pub fn detect_reading(&mut self, reading: &ColorReading, now: Duration) -> Detection {
        if let Some(reason) = self.skip_reason(now) {
            return Detection::Skipped(reason);
        }
        Detection::Evaluated(self.evaluate(reading, now))
    }

    fn evaluate(&mut self, reading: &ColorReading, now: Duration) -> DetectionResult {
        let cfg = &self.config;
        let red = reading.red;
        let dominance = reading.red_dominance();
        let is_triggered = red > cfg.threshold
            && dominance > cfg.selectivity
            && reading.brightness > cfg.minimum_brightness;
        let confidence = ((red + dominance) / 2.0).clamp(0.0, 1.0);

        if is_triggered {
            debug!(
                "trigger at {:.3}s: red={red:.3} dominance={dominance:.3} brightness={:.3}",
                now.as_secs_f64(),
                reading.brightness
            );
            self.last_trigger_time = Some(now);
        }

        DetectionResult {
            is_triggered,
            confidence,
            timestamp: now,
            red_intensity: red,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::tests::frame_with_center;
    use approx::assert_relative_eq;
    use machine_vision_formats::{owned::OImage, pixel_format::BayerRG8};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn armed() -> TriggerDetector {
        let mut det = TriggerDetector::new(DetectorConfig::default());
        det.set_enabled(true);
        det
    }

    fn bright_red() -> ColorReading {
        ColorReading::from_rgb(0.95, 0.2, 0.15)
    }

    #[test]
    fn threshold_is_strict() {
        let mut det = armed();
        let at_threshold = ColorReading {
            red: 0.70,
            green: 0.3,
            blue: 0.3,
            brightness: 0.433,
        };
        let d = det.detect_reading(&at_threshold, ms(0));
        assert!(!d.is_triggered());
        assert!(d.result().is_some());

        let above = ColorReading {
            red: 0.71,
            ..at_threshold
        };
        assert!(det.detect_reading(&above, ms(0)).is_triggered());
    }

    #[test]
    fn red_must_dominate() {
        let mut det = armed();
        let reading = ColorReading::from_rgb(0.9, 0.65, 0.1);
        assert_relative_eq!(reading.red_dominance(), 0.25, epsilon = 1e-12);
        let d = det.detect_reading(&reading, ms(0));
        assert!(!d.is_triggered());
        assert_eq!(det.last_trigger_time(), None);
    }

    #[test]
    fn dim_frames_rejected() {
        let mut det = armed();
        // red passes threshold and selectivity but the frame is dark overall
        let reading = ColorReading {
            red: 0.75,
            green: 0.0,
            blue: 0.0,
            brightness: 0.25,
        };
        assert!(!det.detect_reading(&reading, ms(0)).is_triggered());
    }

    #[test]
    fn cooldown_suppresses_retrigger() {
        let mut det = armed();
        assert!(det.detect_reading(&bright_red(), ms(0)).is_triggered());
        assert_eq!(
            det.detect_reading(&bright_red(), ms(50)),
            Detection::Skipped(SkipReason::CoolingDown)
        );
        assert!(det.detect_reading(&bright_red(), ms(150)).is_triggered());
        assert_eq!(det.last_trigger_time(), Some(ms(150)));
    }

    #[test]
    fn negative_results_do_not_start_cooldown() {
        let mut det = armed();
        let dark = ColorReading::from_rgb(0.1, 0.1, 0.1);
        assert!(!det.detect_reading(&dark, ms(0)).is_triggered());
        assert!(det.detect_reading(&bright_red(), ms(10)).is_triggered());
    }

    #[test]
    fn disabled_skips() {
        let mut det = TriggerDetector::default();
        assert_eq!(
            det.detect_reading(&bright_red(), ms(0)),
            Detection::Skipped(SkipReason::Disabled)
        );
    }

    #[test]
    fn reset_is_idempotent() {
        let mut det = armed();
        assert!(det.detect_reading(&bright_red(), ms(500)).is_triggered());
        det.reset();
        assert_eq!(det.last_trigger_time(), None);
        det.reset();
        assert_eq!(det.last_trigger_time(), None);
        // no stale cooldown after reset
        assert!(det.detect_reading(&bright_red(), ms(510)).is_triggered());
    }

    #[test]
    fn confidence_is_bounded() {
        let mut det = armed();
        let d = det.detect_reading(&ColorReading::from_rgb(1.0, 0.0, 0.0), ms(0));
        assert_relative_eq!(d.result().unwrap().confidence, 1.0);

        let d = det.detect_reading(&ColorReading::from_rgb(0.0, 1.0, 1.0), ms(200));
        assert_relative_eq!(d.result().unwrap().confidence, 0.0);

        let d = det.detect_reading(&ColorReading::from_rgb(0.65, 0.4, 0.2), ms(400));
        assert_relative_eq!(d.result().unwrap().confidence, 0.45, epsilon = 1e-12);
        assert!(!d.is_triggered());
    }

    #[test]
    fn config_locked_while_enabled() {
        let mut det = armed();
        let cfg = DetectorConfig {
            threshold: 0.5,
            ..Default::default()
        };
        assert!(matches!(
            det.set_config(cfg.clone()),
            Err(Error::DetectorBusy)
        ));
        det.set_enabled(false);
        det.set_config(cfg).unwrap();
        assert_eq!(det.config().threshold, 0.5);
    }

    #[test]
    fn detect_from_frames() {
        let mut det = armed();
        let lit = frame_with_center(32, 32, [10, 10, 10], [250, 40, 30]);
        let unlit = frame_with_center(32, 32, [10, 10, 10], [60, 60, 60]);
        assert!(!det.detect(&unlit, ms(0)).is_triggered());
        assert!(det.detect(&lit, ms(33)).is_triggered());

        let bayer: OImage<BayerRG8> = OImage::new(4, 4, 4, vec![255; 16]).unwrap();
        assert!(matches!(
            det.detect(&bayer, ms(500)),
            Detection::Skipped(SkipReason::Unavailable(_))
        ));
    }
}
