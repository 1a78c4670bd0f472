//! Test support for the courier crates
//!
//! Only ever a dev-dependency. [`MockSmtpServer`] is a scriptable relay that
//! the session, dispatch and facade suites all run against.

pub mod mock_server;

pub use mock_server::{MockSmtpServer, MockSmtpServerBuilder, SmtpCommand};
