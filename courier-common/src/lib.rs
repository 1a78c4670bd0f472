//! Shared building blocks for the courier notification dispatcher.
//!
//! - [`config`]: relay, sender and timeout configuration
//! - [`audit`]: structured dispatch lifecycle events with PII redaction
//! - [`logging`]: subscriber initialisation and the `internal!` family of macros
//! - [`error`]: configuration errors

pub mod audit;
pub mod config;
pub mod error;
pub mod logging;

pub use tracing;
