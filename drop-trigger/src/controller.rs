//! The capture state machine.
//!
//! ```text
//! Idle/Completed/Error --arm--> Armed --trigger--> Triggered --started--> Recording
//!                                                                            |
//!                               Completed <------------completed-------------+
//! ```
//!
//! `disarm` returns any active state to `Idle`, `on_error` moves any state to
//! `Error`. All state lives behind one mutex: frame analysis and user
//! commands arrive on different threads.

use std::{
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Duration,
};

use async_change_tracker::ChangeTracker;
use futures::stream::{Stream, StreamExt};
use machine_vision_formats::{ImageStride, PixelFormat};
use tokio::{runtime::Handle, task::JoinHandle, time::Instant};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, warn};

use drop_trigger_types::{
    ArtifactRef, CaptureSettings, CaptureState, CaptureStatus, ColorReading, DetectionResult,
    DetectorConfig,
};

use crate::{
    Error, Result,
    detector::{Detection, TriggerDetector},
    physics,
    recorder::{Recorder, RecorderEvent},
};

/// How often recording progress is updated.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

struct Session {
    state: CaptureState,
    detector: TriggerDetector,
    settings: Option<CaptureSettings>,
    /// Incremented whenever scheduled work must be invalidated.
    generation: u64,
    pending_start: Option<JoinHandle<()>>,
    progress_valve: Option<stream_cancel::Trigger>,
    /// `start_recording` was accepted for the current attempt.
    start_issued: bool,
    stop_requested: bool,
}

impl Session {
    /// Invalidate the scheduled recording start and the progress ticker.
    fn cancel_scheduled(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.pending_start.take() {
            handle.abort();
        }
        // dropping the trigger closes the ticker stream
        self.progress_valve = None;
        self.start_issued = false;
        self.stop_requested = false;
    }
}

struct Inner {
    session: Mutex<Session>,
    status: RwLock<ChangeTracker<CaptureStatus>>,
    recorder: Arc<dyn Recorder>,
    runtime: Handle,
    epoch: Instant,
}

/// Owns one capture session: detector, lifecycle state, and timers.
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct CaptureController {
    inner: Arc<Inner>,
}

impl CaptureController {
    /// Create a controller using the tokio runtime of the calling context.
    pub fn new(recorder: Arc<dyn Recorder>, detector_config: DetectorConfig) -> Result<Self> {
        let runtime = Handle::try_current()?;
        Ok(Self::with_runtime(recorder, detector_config, runtime))
    }

    /// Create a controller which schedules its timers on `runtime`.
    pub fn with_runtime(
        recorder: Arc<dyn Recorder>,
        detector_config: DetectorConfig,
        runtime: Handle,
    ) -> Self {
        let session = Session {
            state: CaptureState::Idle,
            detector: TriggerDetector::new(detector_config),
            settings: None,
            generation: 0,
            pending_start: None,
            progress_valve: None,
            start_issued: false,
            stop_requested: false,
        };
        let epoch = {
            // read the runtime's clock, which is paused in tests
            let _guard = runtime.enter();
            Instant::now()
        };
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(session),
                status: RwLock::new(ChangeTracker::new(CaptureStatus::default())),
                recorder,
                runtime,
                epoch,
            }),
        }
    }

    /// Time since this controller was created. Frames passed to
    /// [Self::process_frame] should be stamped on this clock.
    pub fn session_time(&self) -> Duration {
        let _guard = self.inner.runtime.enter();
        self.inner.epoch.elapsed()
    }

    pub fn state(&self) -> CaptureState {
        self.lock().state.clone()
    }

    /// Snapshot of everything published to observers.
    pub fn status(&self) -> CaptureStatus {
        self.inner.status.read().unwrap().as_ref().clone()
    }

    /// Stream of `(previous, current)` status pairs, one per change.
    pub fn subscribe(&self) -> impl Stream<Item = (CaptureStatus, CaptureStatus)> + use<> {
        self.inner.status.read().unwrap().get_changes(16)
    }

    /// Whether frames are currently evaluated for the trigger.
    pub fn is_detecting(&self) -> bool {
        self.lock().detector.is_enabled()
    }

    pub fn detector_config(&self) -> DetectorConfig {
        self.lock().detector.config().clone()
    }

    /// Replace the detector configuration. Only possible while detection is
    /// not enabled, that is, not between `arm` and the trigger.
    pub fn set_detector_config(&self, config: DetectorConfig) -> Result<()> {
        self.lock().detector.set_config(config)
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.session.lock().unwrap()
    }

    fn publish<F: FnOnce(&mut CaptureStatus)>(&self, f: F) {
        self.inner.status.write().unwrap().modify(f);
    }

    fn set_state(&self, session: &mut Session, state: CaptureState) {
        debug!("{} -> {}", session.state, state);
        session.state = state.clone();
        self.publish(|status| status.state = state);
    }

    fn invalid(session: &Session, event: &'static str) -> Error {
        let from = session.state.name();
        warn!("ignoring {event} while {from}");
        Error::InvalidTransition { from, event }
    }

    // ----- user commands ---------------------------------------------------

    /// Start watching for the trigger with `settings`.
    ///
    /// Only accepted from `Idle`, `Completed` and `Error`. Invalid settings
    /// move the controller to `Error`.
    pub fn arm(&self, settings: CaptureSettings) -> Result<CaptureState> {
        let mut session = self.lock();
        if !session.state.is_quiescent() {
            return Err(Self::invalid(&session, "arm"));
        }
        session.cancel_scheduled();
        if let Err(e) = settings.validate() {
            error!("cannot arm: {e}");
            session.detector.set_enabled(false);
            self.set_state(&mut session, CaptureState::Error { reason: e.to_string() });
            return Err(e.into());
        }
        session.detector.reset();
        session.detector.set_enabled(true);
        info!(
            "armed: drop height {:.2} m, recording {:.2} s",
            settings.drop_height_meters,
            settings.total_duration().as_secs_f64()
        );
        session.settings = Some(settings);
        self.publish(|status| {
            status.progress = 0.0;
            status.confidence = 0.0;
        });
        self.set_state(&mut session, CaptureState::Armed);
        Ok(CaptureState::Armed)
    }

    /// Cancel the current attempt and return to `Idle`.
    ///
    /// Idempotent. Cancels a pending recording start before it can fire and
    /// stops the recorder if it was started. Does nothing in `Completed` and
    /// `Error`; use [Self::reset] there.
    pub fn disarm(&self) -> CaptureState {
        let mut session = self.lock();
        if session.state.is_terminal() || session.state == CaptureState::Idle {
            return session.state.clone();
        }
        let stop = self.go_idle(&mut session);
        drop(session);

        info!("disarmed");
        self.stop_after_cancel(stop);
        CaptureState::Idle
    }

    /// Return to `Idle` from any state.
    pub fn reset(&self) -> CaptureState {
        let mut session = self.lock();
        if session.state.is_terminal() {
            debug!("clearing {}", session.state.name());
        }
        let stop = self.go_idle(&mut session);
        drop(session);

        self.stop_after_cancel(stop);
        CaptureState::Idle
    }

    /// Cancel everything scheduled and enter `Idle`. Returns whether the
    /// recorder must be stopped once the lock is released.
    fn go_idle(&self, session: &mut Session) -> bool {
        let running =
            session.start_issued || matches!(session.state, CaptureState::Recording { .. });
        let stop = running && !session.stop_requested;
        session.cancel_scheduled();
        session.detector.set_enabled(false);
        if session.state != CaptureState::Idle {
            self.set_state(session, CaptureState::Idle);
        }
        stop
    }

    fn stop_after_cancel(&self, stop: bool) {
        if stop {
            if let Err(e) = self.inner.recorder.stop_recording() {
                warn!("stopping recorder after cancel: {e}");
            }
        }
    }

    // ----- frame path ------------------------------------------------------

    /// Run trigger detection on one preview frame.
    ///
    /// `timestamp` is the frame time on the [Self::session_time] clock.
    pub fn process_frame<IM, FMT>(&self, frame: &IM, timestamp: Duration) -> Detection
    where
        IM: ImageStride<FMT>,
        FMT: PixelFormat + 'static,
    {
        let mut session = self.lock();
        let detection = session.detector.detect(frame, timestamp);
        self.handle_detection(&mut session, &detection);
        detection
    }

    /// Like [Self::process_frame] for an already sampled reading.
    pub fn process_reading(&self, reading: &ColorReading, timestamp: Duration) -> Detection {
        let mut session = self.lock();
        let detection = session.detector.detect_reading(reading, timestamp);
        self.handle_detection(&mut session, &detection);
        detection
    }

    fn handle_detection(&self, session: &mut Session, detection: &Detection) {
        let Some(result) = detection.result() else {
            return;
        };
        let confidence = result.confidence;
        if self.inner.status.read().unwrap().as_ref().confidence != confidence {
            self.publish(|status| status.confidence = confidence);
        }
        if result.is_triggered {
            self.handle_trigger(session, result);
        }
    }

    fn handle_trigger(&self, session: &mut Session, result: &DetectionResult) {
        // The detector is disabled when leaving Armed, but a frame may have
        // passed the enabled check before a concurrent disarm took the lock.
        if session.state != CaptureState::Armed {
            warn!("discarding trigger while {}", session.state.name());
            return;
        }
        session.detector.set_enabled(false);

        let Some(settings) = session.settings.as_ref() else {
            self.fail(session, "armed without capture settings".into());
            return;
        };
        let delay = physics::recording_start_delay(settings);
        info!(
            "trigger at {:.3}s (confidence {:.2}), recording starts in {:.3}s",
            result.timestamp.as_secs_f64(),
            result.confidence,
            delay.as_secs_f64()
        );
        self.set_state(
            session,
            CaptureState::Triggered {
                trigger_time: result.timestamp,
            },
        );

        let generation = session.generation;
        let this = self.clone();
        session.pending_start = Some(self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire_scheduled_start(generation);
        }));
    }

    fn fire_scheduled_start(&self, generation: u64) {
        // The lock is held across `start_recording` so that a concurrent
        // `disarm` either cancels this start or sees it issued and stops it.
        let mut session = self.lock();
        if session.generation != generation
            || !matches!(session.state, CaptureState::Triggered { .. })
        {
            debug!("scheduled recording start was cancelled");
            return;
        }
        session.pending_start = None;
        let Some(settings) = session.settings.clone() else {
            return;
        };
        debug!("starting recorder");
        match self.inner.recorder.start_recording(&settings) {
            Ok(()) => session.start_issued = true,
            Err(e) => {
                error!("recorder failed to start: {e}");
                self.fail(&mut session, e.to_string());
            }
        }
    }

    // ----- recorder callbacks ----------------------------------------------

    /// The recorder is running.
    pub fn on_recording_started(&self) -> Result<CaptureState> {
        let mut session = self.lock();
        if !matches!(session.state, CaptureState::Triggered { .. }) {
            let err = Self::invalid(&session, "recording started");
            drop(session);
            // nobody wants this recording anymore
            if let Err(e) = self.inner.recorder.stop_recording() {
                warn!("stopping unwanted recording: {e}");
            }
            return Err(err);
        }

        let state = CaptureState::Recording {
            start_time: self.session_time(),
        };
        self.publish(|status| status.progress = 0.0);
        self.set_state(&mut session, state.clone());

        let (trigger, valve) = stream_cancel::Valve::new();
        session.progress_valve = Some(trigger);
        let generation = session.generation;
        let this = self.clone();
        self.inner.runtime.spawn(async move {
            let mut ticks = std::pin::pin!(valve.wrap(IntervalStream::new(
                tokio::time::interval(PROGRESS_INTERVAL),
            )));
            while ticks.next().await.is_some() {
                if !this.progress_tick(generation) {
                    break;
                }
            }
        });
        Ok(state)
    }

    /// Update progress. Returns `false` once the ticker should stop.
    fn progress_tick(&self, generation: u64) -> bool {
        let mut session = self.lock();
        if session.generation != generation {
            return false;
        }
        let CaptureState::Recording { start_time } = session.state else {
            return false;
        };
        let total = session
            .settings
            .as_ref()
            .map(CaptureSettings::total_duration)
            .unwrap_or_default();
        let elapsed = self.session_time().saturating_sub(start_time);
        let progress = if total.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / total.as_secs_f64()).min(1.0)
        };
        self.publish(|status| status.progress = progress);
        if progress < 1.0 {
            return true;
        }

        session.progress_valve = None;
        if session.stop_requested {
            return false;
        }
        session.stop_requested = true;
        drop(session);

        debug!("recording duration reached, stopping recorder");
        if let Err(e) = self.inner.recorder.stop_recording() {
            error!("recorder failed to stop: {e}");
            let mut session = self.lock();
            if session.generation == generation {
                self.fail(&mut session, e.to_string());
            }
        }
        false
    }

    /// The recording is finished and available as `artifact`.
    pub fn on_recording_completed(&self, artifact: ArtifactRef) -> Result<CaptureState> {
        let mut session = self.lock();
        if !matches!(session.state, CaptureState::Recording { .. }) {
            return Err(Self::invalid(&session, "recording completed"));
        }
        session.cancel_scheduled();
        info!("capture completed: {artifact}");
        self.publish(|status| status.progress = 1.0);
        let state = CaptureState::Completed { artifact };
        self.set_state(&mut session, state.clone());
        Ok(state)
    }

    /// The recorder failed. Ends the current attempt; there is no retry.
    pub fn on_error(&self, reason: String) -> CaptureState {
        let mut session = self.lock();
        self.fail(&mut session, reason);
        session.state.clone()
    }

    fn fail(&self, session: &mut Session, reason: String) {
        error!("capture failed: {reason}");
        session.cancel_scheduled();
        session.detector.set_enabled(false);
        self.set_state(session, CaptureState::Error { reason });
    }

    /// Apply one recorder notification.
    pub fn handle_recorder_event(&self, event: RecorderEvent) -> Result<CaptureState> {
        match event {
            RecorderEvent::Started => self.on_recording_started(),
            RecorderEvent::Completed(artifact) => self.on_recording_completed(artifact),
            RecorderEvent::Failed(reason) => Ok(self.on_error(reason)),
        }
    }

    /// Apply recorder notifications until the sender is dropped.
    pub async fn forward_recorder_events(self, mut rx: tokio::sync::mpsc::Receiver<RecorderEvent>) {
        while let Some(event) = rx.recv().await {
            // invalid transitions are already logged
            let _ = self.handle_recorder_event(event);
        }
        debug!("recorder event channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RecorderError;

    struct NullRecorder;

    impl Recorder for NullRecorder {
        fn start_recording(&self, _: &CaptureSettings) -> std::result::Result<(), RecorderError> {
            Ok(())
        }
        fn stop_recording(&self) -> std::result::Result<(), RecorderError> {
            Ok(())
        }
    }

    fn controller() -> CaptureController {
        CaptureController::new(Arc::new(NullRecorder), DetectorConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn arm_and_disarm() {
        let ctl = controller();
        assert_eq!(ctl.state(), CaptureState::Idle);
        assert_eq!(ctl.arm(CaptureSettings::default()).unwrap(), CaptureState::Armed);
        assert!(matches!(
            ctl.arm(CaptureSettings::default()),
            Err(Error::InvalidTransition { from: "Armed", .. })
        ));
        assert_eq!(ctl.disarm(), CaptureState::Idle);
        assert_eq!(ctl.disarm(), CaptureState::Idle);
        assert_eq!(ctl.status().state, CaptureState::Idle);
    }

    #[tokio::test]
    async fn invalid_settings_are_an_error_state() {
        let ctl = controller();
        let settings = CaptureSettings {
            drop_height_meters: 3.0,
            ..Default::default()
        };
        assert!(matches!(ctl.arm(settings), Err(Error::InvalidSettings(_))));
        assert!(matches!(ctl.state(), CaptureState::Error { .. }));
        // retry from Error is allowed
        ctl.arm(CaptureSettings::default()).unwrap();
    }

    #[tokio::test]
    async fn config_locked_while_armed() {
        let ctl = controller();
        ctl.arm(CaptureSettings::default()).unwrap();
        let cfg = DetectorConfig {
            threshold: 0.9,
            ..Default::default()
        };
        assert!(matches!(
            ctl.set_detector_config(cfg.clone()),
            Err(Error::DetectorBusy)
        ));
        ctl.disarm();
        ctl.set_detector_config(cfg).unwrap();
        assert_eq!(ctl.detector_config().threshold, 0.9);
    }

    #[tokio::test]
    async fn callbacks_out_of_order_are_rejected() {
        let ctl = controller();
        assert!(ctl.on_recording_started().is_err());
        assert!(ctl.on_recording_completed(ArtifactRef("x".into())).is_err());
        assert_eq!(ctl.state(), CaptureState::Idle);
    }

    #[tokio::test]
    async fn reset_from_terminal_state() {
        let ctl = controller();
        ctl.on_error("camera busy".into());
        assert_eq!(ctl.disarm().name(), "Error");
        assert_eq!(ctl.reset(), CaptureState::Idle);
        assert_eq!(ctl.state(), CaptureState::Idle);
    }
}
