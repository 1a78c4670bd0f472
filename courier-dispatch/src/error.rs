//! Typed errors for dispatch operations.
//!
//! [`TransportError`] is what a single attempt can fail with. It is the input
//! to [`crate::classify::is_retryable`]; the dispatcher never inspects raw
//! client errors.

use std::{io, time::Duration};

use courier_smtp::ClientError;
use thiserror::Error;

/// SMTP codes that indicate an authentication problem rather than a message
/// problem (RFC 4954).
const AUTH_CODES: [u16; 4] = [530, 534, 535, 538];

/// Why a single transport attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Operation timed out: {0}")]
    TimedOut(String),

    #[error("Socket error: {0}")]
    Socket(String),

    /// The relay answered with an error reply.
    #[error("{code} {message}")]
    Smtp { code: u16, message: String },

    #[error("Authentication failed: {message}")]
    Authentication { code: Option<u16>, message: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The message could not be rendered (bad address, header injection).
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection pool closed")]
    PoolClosed,

    /// The whole attempt (lease acquisition and submission) overran its
    /// deadline.
    #[error("Email send timeout after {0:?}")]
    AttemptTimeout(Duration),
}

impl TransportError {
    /// The SMTP reply code, when the relay answered.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Smtp { code, .. } => Some(*code),
            Self::Authentication { code, .. } => *code,
            _ => None,
        }
    }

    fn from_io(error: &io::Error) -> Self {
        let message = error.to_string();
        match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::ConnectionReset(message),
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(message),
            io::ErrorKind::TimedOut => Self::TimedOut(message),
            _ => Self::Socket(message),
        }
    }
}

impl From<ClientError> for TransportError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Io(e) => Self::from_io(&e),
            ClientError::Resolve { host, source } => Self::HostNotFound(format!("{host}: {source}")),
            e @ ClientError::Timeout { .. } => Self::TimedOut(e.to_string()),
            ClientError::ConnectionClosed => {
                Self::ConnectionReset("connection closed by relay".to_string())
            }
            ClientError::SmtpError { code, message } if AUTH_CODES.contains(&code) => {
                Self::Authentication {
                    code: Some(code),
                    message: format!("{code} {message}"),
                }
            }
            ClientError::SmtpError { code, message } => Self::Smtp { code, message },
            ClientError::AuthUnsupported(offered) => Self::Authentication {
                code: None,
                message: format!("no supported mechanism (relay offers: {offered})"),
            },
            ClientError::TlsError(e) => Self::Tls(e),
            ClientError::BuilderError(e) => Self::InvalidMessage(e),
            e @ (ClientError::ParseError(_)
            | ClientError::UnexpectedResponse { .. }
            | ClientError::Utf8Error(_)) => Self::Protocol(e.to_string()),
        }
    }
}

/// Errors from the connection pool itself.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Connection pool closed")]
    Closed,

    /// A new connection could not be opened.
    #[error("Failed to open connection: {0}")]
    Connect(#[from] TransportError),
}

impl From<PoolError> for TransportError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Closed => Self::PoolClosed,
            PoolError::Connect(e) => e,
        }
    }
}
