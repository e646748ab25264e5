//! A [Recorder] which writes a JSON description of each recording.
//!
//! Stands in for the high-speed camera. The file holds the capture settings
//! and wall-clock start and stop times, which is enough to check the timing
//! of a capture session end to end.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::{runtime::Handle, sync::mpsc};
use tracing::{debug, error, info};

use drop_trigger::{
    Recorder, RecorderError, RecorderEvent,
    recorder::{ARTIFACT_POLL_ATTEMPTS, ARTIFACT_POLL_INTERVAL, wait_for_artifact},
};
use drop_trigger_types::{ArtifactRef, CaptureSettings};

struct ActiveRecording {
    started: DateTime<Local>,
    settings: CaptureSettings,
}

#[derive(Debug, Serialize)]
struct RecordingInfo {
    started: DateTime<Local>,
    stopped: DateTime<Local>,
    settings: CaptureSettings,
    n_frames: u64,
}

pub struct FileRecorder {
    output_dir: PathBuf,
    events: mpsc::Sender<RecorderEvent>,
    runtime: Handle,
    active: Mutex<Option<ActiveRecording>>,
}

impl FileRecorder {
    pub fn new(output_dir: &Path, events: mpsc::Sender<RecorderEvent>, runtime: Handle) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            events,
            runtime,
            active: Mutex::new(None),
        }
    }

    fn send(&self, event: RecorderEvent) {
        let tx = self.events.clone();
        self.runtime.spawn(async move {
            if tx.send(event).await.is_err() {
                debug!("recorder event receiver dropped");
            }
        });
    }
}

impl Recorder for FileRecorder {
    fn start_recording(&self, settings: &CaptureSettings) -> Result<(), RecorderError> {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return Err(RecorderError::DeviceBusy);
        }
        let started = Local::now();
        info!(
            "recording {:.2} s at {} fps",
            settings.total_duration().as_secs_f64(),
            settings.frame_rate
        );
        *active = Some(ActiveRecording {
            started,
            settings: settings.clone(),
        });
        drop(active);
        self.send(RecorderEvent::Started);
        Ok(())
    }

    fn stop_recording(&self) -> Result<(), RecorderError> {
        let ActiveRecording { started, settings } = self
            .active
            .lock()
            .unwrap()
            .take()
            .ok_or(RecorderError::NotRecording)?;
        let stopped = Local::now();
        let elapsed = (stopped - started).to_std().unwrap_or_default();
        let info = RecordingInfo {
            started,
            stopped,
            n_frames: (elapsed.as_secs_f64() * settings.frame_rate).round() as u64,
            settings,
        };
        let path = self
            .output_dir
            .join(format!("drop_{}.json", started.format("%Y%m%d_%H%M%S%.3f")));
        let tx = self.events.clone();

        self.runtime.spawn(async move {
            let event = match write_recording(&path, &info).await {
                Ok(()) => {
                    wait_for_artifact(&path, ARTIFACT_POLL_ATTEMPTS, ARTIFACT_POLL_INTERVAL)
                        .await;
                    RecorderEvent::Completed(ArtifactRef(path.display().to_string()))
                }
                Err(e) => {
                    error!("writing {}: {e}", path.display());
                    RecorderEvent::Failed(e.to_string())
                }
            };
            if tx.send(event).await.is_err() {
                debug!("recorder event receiver dropped");
            }
        });
        Ok(())
    }
}

async fn write_recording(path: &Path, info: &RecordingInfo) -> Result<(), RecorderError> {
    let buf = serde_json::to_vec_pretty(info).map_err(|e| RecorderError::Other(e.to_string()))?;
    tokio::fs::write(path, buf).await?;
    Ok(())
}
