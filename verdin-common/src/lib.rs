//! # Verdin Common
//!
//! Shared utilities for the Verdin components.
//!
//! ## Logging
//!
//! ```rust
//! verdin_common::init_logging("info").unwrap();
//! ```

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, LogFormat};
