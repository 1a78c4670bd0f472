//! The seam between the pool and the wire.
//!
//! [`Connector`] opens connections and [`Connection`] submits messages over
//! one. The SMTP implementations wrap [`SmtpSession`]; tests substitute their
//! own.

use async_trait::async_trait;
use courier_common::{config::SmtpConfig, tracing};
use courier_smtp::{Message, SmtpSession, Submission};

use crate::error::TransportError;

/// Envelope sender and recipients for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub recipients: Vec<String>,
}

/// Opens ready-to-use connections to the relay.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and completes any handshake (greeting, TLS, AUTH).
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// One open relay connection.
#[async_trait]
pub trait Connection: Send {
    /// Runs one mail transaction.
    async fn send(
        &mut self,
        envelope: &Envelope,
        message: &Message,
    ) -> Result<Submission, TransportError>;

    /// Confirms a parked connection is still usable before it is reused.
    async fn check(&mut self) -> Result<(), TransportError>;

    /// Closes the connection politely.
    async fn close(self: Box<Self>);
}

/// Connects to the relay described by an [`SmtpConfig`].
#[derive(Debug, Clone)]
pub struct SmtpConnector {
    config: SmtpConfig,
}

impl SmtpConnector {
    #[must_use]
    pub const fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SmtpConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let session = SmtpSession::open(&self.config).await?;
        tracing::debug!(
            relay = %session.relay(),
            tls = session.is_tls(),
            "Opened relay connection"
        );
        Ok(Box::new(SmtpConnection { session }))
    }
}

struct SmtpConnection {
    session: SmtpSession,
}

#[async_trait]
impl Connection for SmtpConnection {
    async fn send(
        &mut self,
        envelope: &Envelope,
        message: &Message,
    ) -> Result<Submission, TransportError> {
        Ok(self
            .session
            .submit(&envelope.from, &envelope.recipients, message)
            .await?)
    }

    async fn check(&mut self) -> Result<(), TransportError> {
        Ok(self.session.noop().await?)
    }

    async fn close(self: Box<Self>) {
        self.session.quit().await;
    }
}
