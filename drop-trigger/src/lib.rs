//! Optical trigger and capture orchestration for high-speed drop photography.
//!
//! A trigger box flashes a red LED when a water drop is released. This crate
//! watches the camera preview for that flash ([detector]), computes when the
//! drop will hit ([physics]) and drives a [Recorder] so that recording starts
//! shortly before impact ([controller]).

pub mod analyzer;
pub mod controller;
pub mod detector;
mod error;
pub mod physics;
pub mod recorder;
pub mod sampler;

pub use drop_trigger_types as types;

pub use analyzer::{AnalyzerStats, FrameAnalyzer};
pub use controller::CaptureController;
pub use detector::{Detection, SkipReason, TriggerDetector};
pub use error::{Error, Result};
pub use recorder::{Recorder, RecorderError, RecorderEvent};
