//! Free-fall timing of the drop.

use std::time::Duration;

use drop_trigger_types::CaptureSettings;

/// Standard gravity, m/s².
pub const GRAVITY: f64 = 9.81;

/// Time in seconds for a drop released at rest to fall `height_meters`.
///
/// Air resistance is ignored. Negative heights are treated as zero.
pub fn drop_time(height_meters: f64) -> f64 {
    (2.0 * height_meters.max(0.0) / GRAVITY).sqrt()
}

/// Seconds to wait after the trigger before recording starts, so that
/// recording begins `pre_impact_margin` seconds before impact. Never negative:
/// when the margin exceeds the drop time, recording starts immediately.
pub fn scheduling_delay(drop_time: f64, pre_impact_margin: f64) -> f64 {
    // f64::max also maps NaN to zero
    (drop_time - pre_impact_margin).max(0.0)
}

/// [scheduling_delay] for the drop described by `settings`.
pub fn recording_start_delay(settings: &CaptureSettings) -> Duration {
    let delay = scheduling_delay(
        drop_time(settings.drop_height_meters),
        settings.pre_impact_safety_margin_seconds,
    );
    Duration::try_from_secs_f64(delay).unwrap_or(Duration::ZERO)
}
