//! Authenticated submission sessions
//!
//! A session is one relay connection that has completed the greeting, EHLO,
//! optional STARTTLS and optional AUTH, and can then carry any number of
//! mail transactions. Each transaction is:
//! - MAIL FROM (with SIZE when the relay advertises it)
//! - RCPT TO for every recipient, collecting rejections
//! - DATA and the message content
//!
//! A transaction succeeds when the relay accepts the content for at least one
//! recipient.

use courier_common::{config::SmtpConfig, tracing};

use crate::client::{Capabilities, ClientError, Message, Response, Result, SmtpClient};

/// Result of a transaction the relay accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    /// The relay's reply to the end of `DATA`.
    pub response: Response,
}

/// A ready-to-use relay connection.
pub struct SmtpSession {
    client: SmtpClient,
    capabilities: Capabilities,
    relay: String,
}

impl SmtpSession {
    /// Connects to the relay and brings the session up to the point where
    /// mail can be submitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be made, the relay refuses
    /// the greeting or EHLO, the TLS upgrade fails, or authentication is
    /// rejected or impossible.
    #[tracing::instrument(level = "debug", skip_all, fields(relay = %config.address()))]
    pub async fn open(config: &SmtpConfig) -> Result<Self> {
        let relay = config.address();
        let timeouts = &config.timeouts;

        if config.accept_invalid_certs {
            tracing::warn!(
                relay = %relay,
                "SECURITY WARNING: TLS certificate validation is disabled for this connection"
            );
        }

        let client = if config.is_secure() {
            SmtpClient::connect_tls(
                &relay,
                config.host.clone(),
                timeouts.connect(),
                config.accept_invalid_certs,
            )
            .await?
        } else {
            SmtpClient::connect(&relay, config.host.clone(), timeouts.connect())
                .await?
                .accept_invalid_certs(config.accept_invalid_certs)
        };

        let mut session = Self {
            client: client.socket_timeout(timeouts.socket()),
            capabilities: Capabilities::default(),
            relay,
        };

        let greeting = session.client.read_greeting(timeouts.greeting()).await?;
        if !greeting.is_success() {
            return Err(greeting.into_error());
        }

        session.hello(&config.helo_name).await?;

        if !session.client.is_tls() && session.capabilities.starttls {
            let response = session.client.starttls().await?;
            if response.is_success() {
                tracing::debug!(relay = %session.relay, "TLS negotiated via STARTTLS");
                session.hello(&config.helo_name).await?;
            } else {
                tracing::warn!(
                    relay = %session.relay,
                    response = %response,
                    "Relay refused STARTTLS, continuing without TLS"
                );
            }
        }

        if let Some(credentials) = &config.auth {
            let mechanism = session.capabilities.preferred_auth().ok_or_else(|| {
                ClientError::AuthUnsupported(session.capabilities.auth.join(" "))
            })?;

            let response = session
                .client
                .auth(mechanism, &credentials.username, &credentials.password)
                .await?;
            if response.code != 235 {
                return Err(response.into_error());
            }

            tracing::debug!(
                relay = %session.relay,
                mechanism = mechanism.as_str(),
                "Authenticated"
            );
        }

        Ok(session)
    }

    /// EHLO, falling back to HELO for relays that do not speak ESMTP.
    async fn hello(&mut self, helo_name: &str) -> Result<()> {
        let response = self.client.ehlo(helo_name).await?;
        if response.is_success() {
            self.capabilities = Capabilities::from_ehlo(&response);
            return Ok(());
        }

        let response = self.client.helo(helo_name).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        self.capabilities = Capabilities::default();
        Ok(())
    }

    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.client.is_tls()
    }

    /// The `host:port` this session is connected to.
    #[must_use]
    pub fn relay(&self) -> &str {
        &self.relay
    }

    /// Runs one mail transaction.
    ///
    /// # Errors
    ///
    /// Returns the relay's error reply if it refuses the sender, every
    /// recipient, `DATA`, or the content. The error carries the last SMTP
    /// reply code seen.
    pub async fn submit(
        &mut self,
        from: &str,
        recipients: &[String],
        message: &Message,
    ) -> Result<Submission> {
        if recipients.is_empty() {
            return Err(ClientError::BuilderError("No recipients".to_string()));
        }

        let size = self.capabilities.size.map(|_| message.content.len());
        let response = self.client.mail_from(from, size).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }

        let mut accepted = Vec::with_capacity(recipients.len());
        let mut rejected = Vec::new();
        let mut last_rejection = None;

        for recipient in recipients {
            let response = self.client.rcpt_to(recipient).await?;
            if response.is_success() {
                accepted.push(recipient.clone());
            } else {
                tracing::debug!(
                    relay = %self.relay,
                    recipient = %recipient,
                    response = %response,
                    "Recipient rejected"
                );
                rejected.push(recipient.clone());
                last_rejection = Some(response);
            }
        }

        if accepted.is_empty() {
            return Err(last_rejection.map_or_else(
                || ClientError::BuilderError("No recipients".to_string()),
                Response::into_error,
            ));
        }

        let response = self.client.data().await?;
        if !response.is_intermediate() {
            return Err(response.into_error());
        }

        let response = self.client.send_data(&message.content).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }

        Ok(Submission {
            accepted,
            rejected,
            response,
        })
    }

    /// Checks the connection is still alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay does not answer `NOOP` positively.
    pub async fn noop(&mut self) -> Result<()> {
        let response = self.client.noop().await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(response.into_error())
        }
    }

    /// Says goodbye and closes the socket. Failures are logged, not returned,
    /// since there is nothing left to recover.
    pub async fn quit(mut self) {
        if let Err(e) = self.client.quit().await {
            tracing::debug!(relay = %self.relay, error = %e, "QUIT failed");
        }
        self.client.close().await;
    }
}
