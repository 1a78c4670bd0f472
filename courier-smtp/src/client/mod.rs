//! Low-level SMTP client.
//!
//! [`SmtpClient`] speaks the protocol one command at a time over plain TCP,
//! implicit TLS, or a STARTTLS-upgraded stream. [`MessageBuilder`] renders
//! the RFC 5322 content handed to `DATA`. Higher level session handling lives
//! in [`crate::session`].
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use courier_smtp::client::{MessageBuilder, SmtpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect(
//!     "relay.example.com:587",
//!     "relay.example.com".to_string(),
//!     Duration::from_secs(60),
//! )
//! .await?;
//!
//! client.read_greeting(Duration::from_secs(30)).await?;
//! client.ehlo("client.example.com").await?;
//! client.mail_from("sender@example.com", None).await?;
//! client.rcpt_to("recipient@example.com").await?;
//! client.data().await?;
//!
//! let message = MessageBuilder::new()
//!     .from("sender@example.com")
//!     .to("recipient@example.com")
//!     .subject("Hello")
//!     .text("Hello World")
//!     .build()?;
//! let response = client.send_data(&message.content).await?;
//! assert!(response.is_success());
//! # Ok(())
//! # }
//! ```

mod capabilities;
#[allow(clippy::module_inception)]
mod client;
mod error;
mod message;
mod response;

pub use capabilities::{AuthMechanism, Capabilities};
pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use message::{Message, MessageBuilder, is_valid_address};
pub use response::{Response, ResponseLine};
