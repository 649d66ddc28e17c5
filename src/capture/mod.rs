//! Capture pipeline
//!
//! Turns the instrumentation feed of an attached tab into a recording
//! session: classify, record, enrich, then drain outstanding work on stop.

pub mod classifier;
pub mod events;
pub mod masking;
pub mod pending;
pub mod processor;
pub mod state;

pub use classifier::{classify, retain, Classification, RequestRecord};
pub use events::{CdpEvent, InboundMessage};
pub use masking::{PassthroughMasker, RequestMasker};
pub use pending::{DrainReport, PendingBodyTracker, DEFAULT_DRAIN_TIMEOUT};
pub use processor::EventProcessor;
pub use state::SessionState;
