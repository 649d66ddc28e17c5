//! # TabTrace Core
//!
//! Records the API traffic of browser tabs through the browser's debugging
//! protocol and turns each recording into a deduplicated HAR archive.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          Host (extension bridge / DevTools client)      │
//! ├─────────────────────────────────────────────────────────┤
//! │                 DebuggerBackend (trait)                 │
//! ├─────────────────────────────────────────────────────────┤
//! │                    TabTrace Core (Rust)                 │
//! │  ┌──────────┐  ┌──────────┐  ┌─────────┐  ┌─────────┐   │
//! │  │ Attach   │  │ Capture  │  │ Pending │  │   HAR   │   │
//! │  │ Manager  │──│ Pipeline │──│ Bodies  │──│ Storage │   │
//! │  └──────────┘  └──────────┘  └─────────┘  └─────────┘   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod capture;
pub mod debugger;
pub mod models;
pub mod storage;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
