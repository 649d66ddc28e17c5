//! TabTrace recorder API
//!
//! Public entry points for hosts embedding the capture engine.

pub mod recorder_api;

pub use recorder_api::{
    get_version, init_core, Recorder, RecorderConfig, RecorderError, RecordingOutcome,
};
