//! Top-level configuration file
//!
//! ```ron
//! (
//!     smtp: (
//!         host: "smtp.example.com",
//!         port: 587,
//!         auth: Some((username: "notifications@clinic.example", password: "")),
//!     ),
//!     sender: (name: Some("Clinic")),
//!     pool: (max_connections: 5),
//!     dispatch: (max_retries: 3),
//!     audit: (redact_recipients: true),
//! )
//! ```
//!
//! Everything but `smtp` may be omitted.

use std::path::{Path, PathBuf};

use courier_common::{
    audit::AuditConfig,
    config::{SenderIdentity, SmtpConfig},
    error::ConfigError,
    tracing,
};
use courier_dispatch::{DispatchConfig, PoolConfig, Sender};
use courier_smtp::client::is_valid_address;
use serde::Deserialize;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

/// Environment variable overriding `smtp.auth.password`.
pub const PASSWORD_ENV: &str = "COURIER_SMTP_PASSWORD";

/// Searched, in order, when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] =
    ["./courier.config.ron", "/etc/courier/courier.config.ron"];

#[derive(Debug, Clone, Deserialize)]
pub struct CourierConfig {
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub sender: SenderIdentity,

    #[serde(default)]
    pub audit: AuditConfig,
}

impl CourierConfig {
    /// Reads and parses a RON configuration file, then applies
    /// [`PASSWORD_ENV`] if set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = ron::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(config.with_password(std::env::var(PASSWORD_ENV).ok()))
    }

    /// Replaces the relay password, leaving the rest of the credentials as
    /// configured.
    #[must_use]
    pub fn with_password(mut self, password: Option<String>) -> Self {
        let Some(password) = password else {
            return self;
        };

        match self.smtp.auth.as_mut() {
            Some(auth) => auth.password = password,
            None => tracing::warn!(
                "{PASSWORD_ENV} is set but smtp.auth is not configured, ignoring it"
            ),
        }

        self
    }

    /// The identity messages are sent as.
    ///
    /// # Errors
    ///
    /// Returns an error if neither `sender.address` nor `smtp.auth.username`
    /// is set.
    pub fn sender(&self) -> Result<Sender, ConfigError> {
        let address = self
            .sender
            .resolve_address(&self.smtp)
            .ok_or(ConfigError::MissingField("sender.address"))?;

        let sender = Sender::new(address);
        Ok(match &self.sender.name {
            Some(name) => sender.with_name(name),
            None => sender,
        })
    }

    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.smtp.validate()?;
        self.pool.validate()?;
        self.dispatch.validate()?;

        let sender = self.sender()?;
        if !is_valid_address(&sender.address) {
            return Err(ConfigError::invalid(
                "sender.address",
                format!("{} is not a valid address", sender.address),
            ));
        }

        Ok(())
    }
}

/// Finds the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. ./courier.config.ron (current working directory)
/// 3. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`] if no file exists.
pub fn find_config_file() -> Result<PathBuf, ConfigError> {
    let candidates = DEFAULT_CONFIG_PATHS.map(PathBuf::from);
    locate(std::env::var_os(CONFIG_ENV).map(PathBuf::from), &candidates)
}

fn locate(explicit: Option<PathBuf>, candidates: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::NotFound(format!(
            "  - {CONFIG_ENV} points to non-existent file: {}",
            path.display()
        )));
    }

    if let Some(path) = candidates.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let tried = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::NotFound(format!(
        "  - {CONFIG_ENV} environment variable\n{tried}"
    )))
}
