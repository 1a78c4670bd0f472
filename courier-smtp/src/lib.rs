//! SMTP submission client used by courier.
//!
//! - [`client`]: protocol-level client, reply parsing and message rendering
//! - [`session`]: connection setup (TLS, AUTH) and mail transactions

pub mod client;
pub mod session;

pub use client::{ClientError, Message, MessageBuilder, Response};
pub use session::{SmtpSession, Submission};
