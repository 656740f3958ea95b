//! EPMS Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the EPMS workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`EpmsError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables
//!
//! # Example
//!
//! ```no_run
//! use epms_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> epms_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("Application started");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{EpmsError, Result};
