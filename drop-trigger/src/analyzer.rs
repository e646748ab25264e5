//! Run trigger detection on a dedicated thread.
//!
//! Frames are handed over through a single slot. If the worker is still busy
//! with the previous frame when a new one arrives, the older pending frame is
//! dropped: only the newest frame matters for detecting the trigger, and the
//! camera thread must never block on analysis.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use machine_vision_formats::{PixelFormat, owned::OImage};
use tracing::{debug, trace};

use crate::{CaptureController, Error, Result};

/// Counters of the frame analysis worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzerStats {
    /// Frames passed to the controller.
    pub analyzed: u64,
    /// Frames replaced by a newer frame before they were analyzed.
    pub dropped: u64,
}

struct Slot<FMT: PixelFormat> {
    pending: Option<(OImage<FMT>, Duration)>,
    closed: bool,
    stats: AnalyzerStats,
}

struct Mailbox<FMT: PixelFormat> {
    slot: Mutex<Slot<FMT>>,
    ready: Condvar,
}

/// Feeds frames to [CaptureController::process_frame] on a worker thread.
///
/// [Self::submit] never blocks on analysis. The thread is stopped by
/// [Self::close] or when this is dropped.
pub struct FrameAnalyzer<FMT: PixelFormat> {
    mailbox: Arc<Mailbox<FMT>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl<FMT> FrameAnalyzer<FMT>
where
    FMT: PixelFormat + Send + 'static,
{
    /// This spawns the worker thread.
    pub fn spawn(controller: CaptureController) -> Result<Self> {
        let mailbox = Arc::new(Mailbox {
            slot: Mutex::new(Slot {
                pending: None,
                closed: false,
                stats: AnalyzerStats::default(),
            }),
            ready: Condvar::new(),
        });
        let worker_mailbox = mailbox.clone();
        let worker = std::thread::Builder::new()
            .name("frame-analysis".into())
            .spawn(move || analysis_loop(controller, worker_mailbox))?;
        Ok(Self {
            mailbox,
            worker: Some(worker),
        })
    }

    /// Queue `frame` for analysis, replacing any frame still waiting.
    ///
    /// Fails with [Error::WorkerDisconnected] once the worker thread has died.
    pub fn submit(&self, frame: OImage<FMT>, timestamp: Duration) -> Result<()> {
        let mut slot = self.mailbox.slot.lock().unwrap();
        if slot.closed {
            return Err(Error::AlreadyClosed);
        }
        // The worker only exits on its own by panicking.
        if self.worker.as_ref().is_some_and(|w| w.is_finished()) {
            return Err(Error::WorkerDisconnected);
        }
        if let Some((_, stale)) = slot.pending.replace((frame, timestamp)) {
            slot.stats.dropped += 1;
            trace!("dropping frame at {stale:?}, analysis is behind");
        }
        drop(slot);
        self.mailbox.ready.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> AnalyzerStats {
        self.mailbox.slot.lock().unwrap().stats
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// A frame still waiting in the slot is discarded and counted as dropped.
    /// Later calls to [Self::submit] fail.
    pub fn close(&mut self) -> Result<AnalyzerStats> {
        self.mailbox.slot.lock().unwrap().closed = true;
        self.mailbox.ready.notify_all();
        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| Error::WorkerDisconnected)?;
        }
        let mut slot = self.mailbox.slot.lock().unwrap();
        if slot.pending.take().is_some() {
            slot.stats.dropped += 1;
        }
        Ok(slot.stats)
    }
}

impl<FMT: PixelFormat> Drop for FrameAnalyzer<FMT> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.mailbox.slot.lock() {
            slot.closed = true;
        }
        self.mailbox.ready.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn analysis_loop<FMT>(controller: CaptureController, mailbox: Arc<Mailbox<FMT>>)
where
    FMT: PixelFormat + 'static,
{
    loop {
        let (frame, timestamp) = {
            let mut slot = mailbox.slot.lock().unwrap();
            loop {
                if slot.closed {
                    debug!("frame analysis finished: {:?}", slot.stats);
                    return;
                }
                if let Some(next) = slot.pending.take() {
                    break next;
                }
                slot = mailbox.ready.wait(slot).unwrap();
            }
        };
        controller.process_frame(&frame, timestamp);
        mailbox.slot.lock().unwrap().stats.analyzed += 1;
    }
}
