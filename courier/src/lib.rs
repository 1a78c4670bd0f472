//! Courier: resilient notification dispatch over a pooled SMTP relay
//!
//! [`Courier`] wires a validated [`CourierConfig`] into a shared
//! [`ConnectionPool`] and a [`Dispatcher`]. Applications hold one `Courier`
//! for the life of the process and call [`Courier::close`] on shutdown.

pub mod config;

use std::sync::Arc;

use courier_common::{audit, error::ConfigError, internal};
use courier_dispatch::{
    ConnectionPool, Dispatcher, SendOutcome, SendRequest, SmtpConnector, TransportError,
};
use tokio::task::JoinHandle;

pub use config::{CourierConfig, find_config_file};

/// A ready-to-use dispatcher and the pool behind it.
#[derive(Debug, Clone)]
pub struct Courier {
    relay: String,
    dispatcher: Arc<Dispatcher>,
}

impl Courier {
    /// Validates `config`, installs its audit settings and builds the pool and
    /// dispatcher. No connection is opened yet.
    ///
    /// Audit settings are process-wide; the first `Courier` built wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: CourierConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        audit::init(config.audit.clone());

        let sender = config.sender()?;
        let relay = config.smtp.address();
        let connector = Arc::new(SmtpConnector::new(config.smtp));
        let pool = Arc::new(ConnectionPool::new(config.pool, connector));
        let dispatcher = Arc::new(Dispatcher::new(pool, config.dispatch, sender));

        internal!(level = INFO, "Courier ready for relay {relay}");

        Ok(Self { relay, dispatcher })
    }

    /// `host:port` of the relay.
    #[must_use]
    pub fn relay(&self) -> &str {
        &self.relay
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.dispatcher.pool()
    }

    /// # Errors
    ///
    /// Returns the connection error if the relay cannot be reached or
    /// refuses the configured credentials.
    pub async fn verify(&self) -> Result<(), TransportError> {
        self.pool().verify().await
    }

    /// Checks the relay in the background; the result is only logged.
    pub fn spawn_verify(&self) -> JoinHandle<()> {
        self.pool().spawn_verify()
    }

    pub async fn send(&self, request: &SendRequest) -> SendOutcome {
        self.dispatcher.send(request).await
    }

    pub async fn send_with_retries(&self, request: &SendRequest, max_retries: u32) -> SendOutcome {
        self.dispatcher.send_with_retries(request, max_retries).await
    }

    /// Fire-and-forget send; failures are logged.
    pub fn send_detached(&self, request: SendRequest) -> JoinHandle<SendOutcome> {
        self.dispatcher.send_detached(request)
    }

    pub async fn close(&self) {
        self.pool().close().await;
    }
}
