//! Timeout configuration for the SMTP submission session.
//!
//! These map onto the three points where a relay can stall us: opening the
//! TCP (or TLS) connection, waiting for the 220 greeting, and waiting on any
//! single read or write once the session is established.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Client-side SMTP timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// Timeout for establishing the connection (including the TLS handshake
    /// for implicit TLS).
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::connect_secs")]
    pub connect_secs: u64,

    /// Timeout for the server greeting once connected.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::greeting_secs")]
    pub greeting_secs: u64,

    /// Timeout for any single socket read or write.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::socket_secs")]
    pub socket_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::connect_secs(),
            greeting_secs: defaults::greeting_secs(),
            socket_secs: defaults::socket_secs(),
        }
    }
}

impl ClientTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn greeting(&self) -> Duration {
        Duration::from_secs(self.greeting_secs)
    }

    #[must_use]
    pub const fn socket(&self) -> Duration {
        Duration::from_secs(self.socket_secs)
    }
}

mod defaults {
    pub const fn connect_secs() -> u64 {
        60
    }

    pub const fn greeting_secs() -> u64 {
        30
    }

    pub const fn socket_secs() -> u64 {
        60
    }
}
