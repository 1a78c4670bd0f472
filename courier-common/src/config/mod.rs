//! Configuration types shared by the courier crates.
//!
//! - [`smtp`]: relay address, TLS mode, credentials and sender identity
//! - [`timeouts`]: connection, greeting and socket timeouts

pub mod smtp;
pub mod timeouts;

pub use smtp::{Credentials, IMPLICIT_TLS_PORT, SenderIdentity, SmtpConfig};
pub use timeouts::ClientTimeouts;
