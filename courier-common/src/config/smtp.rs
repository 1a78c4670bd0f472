//! Relay connection settings.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::timeouts::ClientTimeouts;
use crate::error::ConfigError;

/// Port on which relays expect TLS from the first byte (RFC 8314).
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Username/password pair used for SMTP AUTH.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Connection settings for the outbound mail relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Relay hostname (also used for TLS SNI and certificate validation).
    pub host: String,

    /// Relay port.
    ///
    /// Default: 587
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Whether to speak TLS from the first byte.
    ///
    /// When unset this is derived from the port: only 465 uses implicit TLS,
    /// every other port starts in plaintext and upgrades with STARTTLS when
    /// the relay advertises it.
    #[serde(default)]
    pub secure: Option<bool>,

    /// Credentials for SMTP AUTH. No authentication is attempted when unset.
    #[serde(default)]
    pub auth: Option<Credentials>,

    /// Name announced in EHLO.
    ///
    /// Default: `localhost`
    #[serde(default = "defaults::helo_name")]
    pub helo_name: String,

    /// Accept invalid TLS certificates (testing only).
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub timeouts: ClientTimeouts,
}

impl SmtpConfig {
    /// Creates a configuration for `host:port` with every other field defaulted.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: None,
            auth: None,
            helo_name: defaults::helo_name(),
            accept_invalid_certs: false,
            timeouts: ClientTimeouts::default(),
        }
    }

    /// Whether the connection uses implicit TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure.unwrap_or(self.port == IMPLICIT_TLS_PORT)
    }

    /// The `host:port` address to connect to.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The authenticated username, if any.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.auth.as_ref().map(|c| c.username.as_str())
    }

    /// Checks that the relay settings are usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is empty, the port is zero, or a timeout
    /// is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingField("smtp.host"));
        }

        if self.port == 0 {
            return Err(ConfigError::invalid("smtp.port", "must be between 1-65535"));
        }

        if let Some(auth) = &self.auth
            && auth.username.is_empty()
        {
            return Err(ConfigError::MissingField("smtp.auth.username"));
        }

        for (field, value) in [
            ("smtp.timeouts.connect_secs", self.timeouts.connect_secs),
            ("smtp.timeouts.greeting_secs", self.timeouts.greeting_secs),
            ("smtp.timeouts.socket_secs", self.timeouts.socket_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1 second"));
            }
        }

        Ok(())
    }
}

/// The identity messages are sent as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    /// Display name used in the `From` header.
    #[serde(default)]
    pub name: Option<String>,

    /// Envelope and header sender address. Falls back to the SMTP username.
    #[serde(default)]
    pub address: Option<String>,
}

impl SenderIdentity {
    /// Resolves the sender address, falling back to the relay username.
    #[must_use]
    pub fn resolve_address<'a>(&'a self, smtp: &'a SmtpConfig) -> Option<&'a str> {
        self.address.as_deref().or_else(|| smtp.username())
    }
}

mod defaults {
    pub const fn port() -> u16 {
        587
    }

    pub fn helo_name() -> String {
        String::from("localhost")
    }
}
