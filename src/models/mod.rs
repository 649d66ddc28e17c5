//! Data models for the capture pipeline
//!
//! These models are handed to the persistence layer once a session stops.

pub mod request;
pub mod session;
pub mod websocket;

pub use request::*;
pub use session::*;
pub use websocket::*;
