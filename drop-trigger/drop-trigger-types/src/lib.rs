//! Data types shared by the drop-trigger capture core and its observers.
//!
//! Everything in this crate is plain data. The trigger detector and the
//! capture state machine live in the `drop-trigger` crate.

#![warn(missing_docs)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest drop height accepted from user preferences, in centimeters.
pub const MIN_DROP_HEIGHT_CM: f64 = 15.0;
/// Largest drop height accepted from user preferences, in centimeters.
pub const MAX_DROP_HEIGHT_CM: f64 = 50.0;
/// Shortest recording accepted from user preferences, in seconds.
pub const MIN_RECORDING_DURATION_SECS: f64 = 1.0;
/// Longest recording accepted from user preferences, in seconds.
pub const MAX_RECORDING_DURATION_SECS: f64 = 4.0;

/// Frame rate at which the live preview is analyzed for the trigger light.
pub const DETECTION_FRAME_RATE: f64 = 30.0;
/// Default frame rate of the high-speed recording.
pub const DEFAULT_CAPTURE_FRAME_RATE: f64 = 240.0;

/// Serialize a [Duration] as a floating point number of seconds.
///
/// Use with `#[serde(with = "drop_trigger_types::secs_f64")]`.
pub mod secs_f64 {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    /// Serialize `dur` as seconds.
    pub fn serialize<S: Serializer>(dur: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(dur.as_secs_f64())
    }

    /// Deserialize seconds into a [Duration].
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// detection

/// Average color of the region of interest of one frame.
///
/// All channels are normalized to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorReading {
    /// Mean red channel value.
    pub red: f64,
    /// Mean green channel value.
    pub green: f64,
    /// Mean blue channel value.
    pub blue: f64,
    /// Mean of the three channels.
    pub brightness: f64,
}

impl ColorReading {
    /// Create a reading from channel means, computing `brightness`.
    pub fn from_rgb(red: f64, green: f64, blue: f64) -> Self {
        Self {
            red,
            green,
            blue,
            brightness: (red + green + blue) / 3.0,
        }
    }

    /// How much red exceeds the stronger of green and blue.
    ///
    /// Negative when red is not the dominant channel.
    pub fn red_dominance(&self) -> f64 {
        self.red - self.green.max(self.blue)
    }
}

/// Outcome of evaluating one frame against the trigger criteria.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Whether all trigger criteria were met.
    pub is_triggered: bool,
    /// Strength of the red signal in `[0, 1]`, independent of the decision.
    pub confidence: f64,
    /// Timestamp of the evaluated frame on the session clock.
    pub timestamp: Duration,
    /// Mean red channel value of the evaluated frame.
    pub red_intensity: f64,
}

/// Default [DetectorConfig::threshold].
pub const DEFAULT_THRESHOLD: f64 = 0.7;
/// Default [DetectorConfig::selectivity].
pub const DEFAULT_SELECTIVITY: f64 = 0.3;
/// Default [DetectorConfig::minimum_brightness].
pub const DEFAULT_MINIMUM_BRIGHTNESS: f64 = 0.4;
/// Default [DetectorConfig::cooldown].
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(100);

/// Thresholds for recognizing the trigger light.
///
/// The defaults are tuned for the narrow-band red LED flashed by the trigger
/// box when it senses the drop leaving the nozzle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    /// Mean red value must be strictly above this.
    pub threshold: f64,
    /// Red must exceed both green and blue by strictly more than this.
    pub selectivity: f64,
    /// Mean brightness must be strictly above this.
    pub minimum_brightness: f64,
    /// Minimum time after a trigger before another trigger is recognized.
    #[serde(with = "secs_f64")]
    pub cooldown: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            selectivity: DEFAULT_SELECTIVITY,
            minimum_brightness: DEFAULT_MINIMUM_BRIGHTNESS,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

// ---------------------------------------------------------------------------
// settings

/// Reason a [CaptureSettings] value cannot be used.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidSettings {
    /// The drop height is outside of the supported range.
    #[error("drop height {0} m is outside of 0.15-0.50 m")]
    DropHeight(f64),
    /// A duration field is negative or not finite.
    #[error("{name} must be a finite, non-negative number of seconds (got {value})")]
    Duration {
        /// Name of the offending field.
        name: &'static str,
        /// Value found.
        value: f64,
    },
    /// The recording would have zero length.
    #[error("total recording duration must be positive")]
    EmptyRecording,
    /// The capture frame rate is not a positive, finite number.
    #[error("frame rate {0} is not positive")]
    FrameRate(f64),
}

/// Parameters of one capture attempt, fixed at arm time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Height between the nozzle and the impact surface.
    pub drop_height_meters: f64,
    /// Recording time kept before the predicted impact.
    pub pre_buffer_seconds: f64,
    /// Recording time kept after the predicted impact.
    pub post_buffer_seconds: f64,
    /// Frame rate of the high-speed recording.
    pub frame_rate: f64,
    /// Recording starts this long before the predicted impact.
    pub pre_impact_safety_margin_seconds: f64,
}

impl CaptureSettings {
    /// Total length of the recording.
    ///
    /// Call [Self::validate] first: this saturates to zero on bad input.
    pub fn total_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.pre_buffer_seconds + self.post_buffer_seconds)
            .unwrap_or(Duration::ZERO)
    }

    /// Check that the settings describe a possible capture.
    pub fn validate(&self) -> Result<(), InvalidSettings> {
        let h = self.drop_height_meters;
        if !h.is_finite()
            || h < MIN_DROP_HEIGHT_CM / 100.0 - 1e-9
            || h > MAX_DROP_HEIGHT_CM / 100.0 + 1e-9
        {
            return Err(InvalidSettings::DropHeight(h));
        }
        for (name, value) in [
            ("pre_buffer_seconds", self.pre_buffer_seconds),
            ("post_buffer_seconds", self.post_buffer_seconds),
            (
                "pre_impact_safety_margin_seconds",
                self.pre_impact_safety_margin_seconds,
            ),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(InvalidSettings::Duration { name, value });
            }
        }
        if self.pre_buffer_seconds + self.post_buffer_seconds <= 0.0 {
            return Err(InvalidSettings::EmptyRecording);
        }
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            return Err(InvalidSettings::FrameRate(self.frame_rate));
        }
        Ok(())
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CapturePreferences::default().to_capture_settings()
    }
}

/// User-facing capture preferences, in the units shown to the user.
///
/// Converted to [CaptureSettings] with [Self::to_capture_settings], which
/// clamps values into their supported ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapturePreferences {
    /// Drop height in centimeters, clamped to 15-50.
    pub drop_height_cm: f64,
    /// Recording length in seconds, clamped to 1-4.
    pub recording_duration_secs: f64,
    /// Frame rate of the high-speed recording.
    pub capture_frame_rate: f64,
    /// How long before the predicted impact recording should start.
    pub pre_impact_margin_secs: f64,
}

impl Default for CapturePreferences {
    fn default() -> Self {
        Self {
            drop_height_cm: 30.0,
            recording_duration_secs: 2.0,
            capture_frame_rate: DEFAULT_CAPTURE_FRAME_RATE,
            pre_impact_margin_secs: 0.5,
        }
    }
}

impl CapturePreferences {
    /// Convert to the settings of one capture attempt.
    ///
    /// The pre-buffer is the pre-impact margin (limited to the recording
    /// length) and the post-buffer is the remainder, so the recording lasts
    /// exactly `recording_duration_secs` after clamping.
    pub fn to_capture_settings(&self) -> CaptureSettings {
        let height_cm = clamp_or_min(
            self.drop_height_cm,
            MIN_DROP_HEIGHT_CM,
            MAX_DROP_HEIGHT_CM,
        );
        let duration = clamp_or_min(
            self.recording_duration_secs,
            MIN_RECORDING_DURATION_SECS,
            MAX_RECORDING_DURATION_SECS,
        );
        let margin = self.pre_impact_margin_secs;
        let pre_buffer = if margin.is_finite() {
            margin.clamp(0.0, duration)
        } else {
            0.0
        };
        CaptureSettings {
            drop_height_meters: height_cm / 100.0,
            pre_buffer_seconds: pre_buffer,
            post_buffer_seconds: duration - pre_buffer,
            frame_rate: self.capture_frame_rate,
            pre_impact_safety_margin_seconds: margin,
        }
    }
}

// NaN clamps to NaN, which would then fail validation far from its source.
fn clamp_or_min(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        min
    } else {
        value.clamp(min, max)
    }
}

// ---------------------------------------------------------------------------
// capture state

/// Reference to a finished recording, as reported by the recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef(pub String);

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum CaptureState {
    /// Not watching for a trigger.
    #[default]
    Idle,
    /// Watching the preview for the trigger light.
    Armed,
    /// The trigger fired; recording start is scheduled.
    Triggered {
        /// Session time of the frame which fired the trigger.
        trigger_time: Duration,
    },
    /// The recorder is running.
    Recording {
        /// Session time at which the recorder reported it started.
        start_time: Duration,
    },
    /// The recording finished and was handed over.
    Completed {
        /// Where the recording ended up.
        artifact: ArtifactRef,
    },
    /// The attempt failed.
    Error {
        /// Human-readable failure description.
        reason: String,
    },
}

impl CaptureState {
    /// Short, stable name of the state, without its payload.
    pub fn name(&self) -> &'static str {
        match self {
            CaptureState::Idle => "Idle",
            CaptureState::Armed => "Armed",
            CaptureState::Triggered { .. } => "Triggered",
            CaptureState::Recording { .. } => "Recording",
            CaptureState::Completed { .. } => "Completed",
            CaptureState::Error { .. } => "Error",
        }
    }

    /// `true` for states from which a new attempt may be armed.
    pub fn is_quiescent(&self) -> bool {
        matches!(
            self,
            CaptureState::Idle | CaptureState::Completed { .. } | CaptureState::Error { .. }
        )
    }

    /// `true` for `Completed` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaptureState::Completed { .. } | CaptureState::Error { .. }
        )
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureState::Triggered { trigger_time } => {
                write!(f, "Triggered (t={:.3}s)", trigger_time.as_secs_f64())
            }
            CaptureState::Recording { start_time } => {
                write!(f, "Recording (t={:.3}s)", start_time.as_secs_f64())
            }
            CaptureState::Completed { artifact } => write!(f, "Completed ({artifact})"),
            CaptureState::Error { reason } => write!(f, "Error: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Everything an observer (such as a UI) may display about a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CaptureStatus {
    /// Current lifecycle state.
    pub state: CaptureState,
    /// Confidence of the most recently evaluated frame.
    pub confidence: f64,
    /// Recording progress in `[0, 1]`.
    pub progress: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferences_are_clamped() {
        let prefs = CapturePreferences {
            drop_height_cm: 80.0,
            recording_duration_secs: 0.2,
            ..Default::default()
        };
        let settings = prefs.to_capture_settings();
        assert_eq!(settings.drop_height_meters, 0.5);
        assert_eq!(settings.total_duration(), Duration::from_secs(1));
        settings.validate().unwrap();

        let prefs = CapturePreferences {
            drop_height_cm: f64::NAN,
            recording_duration_secs: 10.0,
            ..Default::default()
        };
        let settings = prefs.to_capture_settings();
        assert_eq!(settings.drop_height_meters, 0.15);
        assert_eq!(settings.total_duration(), Duration::from_secs(4));
    }

    #[test]
    fn buffers_split_requested_duration() {
        let settings = CapturePreferences::default().to_capture_settings();
        assert_eq!(settings.pre_buffer_seconds, 0.5);
        assert_eq!(settings.post_buffer_seconds, 1.5);
        assert_eq!(settings.total_duration(), Duration::from_secs(2));
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let good = CaptureSettings::default();
        good.validate().unwrap();

        let bad = CaptureSettings {
            drop_height_meters: 1.2,
            ..good.clone()
        };
        assert_eq!(bad.validate(), Err(InvalidSettings::DropHeight(1.2)));

        let bad = CaptureSettings {
            frame_rate: 0.0,
            ..good.clone()
        };
        assert_eq!(bad.validate(), Err(InvalidSettings::FrameRate(0.0)));

        let bad = CaptureSettings {
            pre_buffer_seconds: 0.0,
            post_buffer_seconds: 0.0,
            ..good
        };
        assert_eq!(bad.validate(), Err(InvalidSettings::EmptyRecording));
    }

    #[test]
    fn detector_config_from_partial_toml() {
        let cfg: DetectorConfig = toml::from_str("threshold = 0.8\ncooldown = 0.25\n").unwrap();
        assert_eq!(cfg.threshold, 0.8);
        assert_eq!(cfg.selectivity, DEFAULT_SELECTIVITY);
        assert_eq!(cfg.cooldown, Duration::from_millis(250));
    }

    #[test]
    fn state_names() {
        assert!(CaptureState::Idle.is_quiescent());
        assert!(!CaptureState::Armed.is_quiescent());
        let done = CaptureState::Completed {
            artifact: ArtifactRef("a.mp4".into()),
        };
        assert!(done.is_terminal());
        assert_eq!(done.to_string(), "Completed (a.mp4)");
    }
}
