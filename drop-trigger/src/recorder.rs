//! The contract with whatever writes the high-speed recording.

use std::{path::Path, time::Duration};

use tracing::{debug, warn};

use drop_trigger_types::{ArtifactRef, CaptureSettings};

/// Failure reported by a [Recorder].
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("camera busy")]
    DeviceBusy,
    #[error("recorder not running")]
    NotRecording,
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// Starts and stops the high-speed recording.
///
/// Both calls return once the request has been accepted. Progress is reported
/// back asynchronously with [RecorderEvent]s (or by calling the matching
/// `CaptureController::on_*` methods directly). Implementations must not call
/// back into the controller from within these methods: `start_recording` runs
/// while the controller's session lock is held.
pub trait Recorder: Send + Sync {
    fn start_recording(&self, settings: &CaptureSettings) -> Result<(), RecorderError>;
    fn stop_recording(&self) -> Result<(), RecorderError>;
}

/// Asynchronous notifications from a [Recorder].
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Started,
    Completed(ArtifactRef),
    Failed(String),
}

/// Default number of attempts for [wait_for_artifact].
pub const ARTIFACT_POLL_ATTEMPTS: usize = 10;
/// Default interval between attempts for [wait_for_artifact].
pub const ARTIFACT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait for a finished recording to appear on disk.
///
/// Checks up to `attempts` times, `interval` apart, for a non-empty file at
/// `path`. Returns `false` if it never shows up. This is not an error: the
/// capture itself already succeeded and the file may still arrive later.
pub async fn wait_for_artifact(path: &Path, attempts: usize, interval: Duration) -> bool {
    for attempt in 1..=attempts {
        match tokio::fs::metadata(path).await {
            Ok(md) if md.is_file() && md.len() > 0 => {
                debug!("{} ready after {attempt} attempt(s)", path.display());
                return true;
            }
            _ => {}
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    warn!(
        "{} not ready after {attempts} attempts, giving up",
        path.display()
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_artifact_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.json");
        std::fs::write(&path, b"{}").unwrap();
        assert!(wait_for_artifact(&path, 3, Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.json");
        let start = tokio::time::Instant::now();
        assert!(!wait_for_artifact(&path, 4, Duration::from_millis(100)).await);
        // three sleeps between four attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn late_artifact_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.json");
        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            std::fs::write(&writer_path, b"{}").unwrap();
        });
        assert!(wait_for_artifact(&path, 10, Duration::from_millis(100)).await);
    }
}
