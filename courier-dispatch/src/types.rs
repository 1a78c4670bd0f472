//! Requests, outcomes and attempt records.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{classify::FailureClass, error::TransportError};

/// One message to one recipient.
///
/// At least one of `text` and `html` should be set; this is not enforced and
/// a message without either is sent with an empty body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub recipient: String,
    pub subject: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
}

impl SendRequest {
    #[must_use]
    pub fn new(recipient: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            text: None,
            html: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }
}

/// Who messages are sent as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub name: Option<String>,
    pub address: String,
}

impl Sender {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Delivery metadata for a message the relay accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// `Message-ID` of the accepted message.
    pub message_id: String,
    /// `X-Email-ID` shared by every attempt of this send.
    pub email_id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    /// The relay's final reply, e.g. `250 2.0.0 OK: queued as 7F3A`.
    pub response: String,
    pub attempts: u32,
}

/// Why a send ended without delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The relay or the message made success impossible.
    Permanent,
    /// Every allowed attempt failed with a transient error.
    Exhausted,
    /// The connection pool was closed.
    PoolUnavailable,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Exhausted => "exhausted",
            Self::PoolUnavailable => "pool_unavailable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal failure, structured so callers can log it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    /// Text of the last error.
    pub reason: String,
    pub attempts: u32,
    pub kind: FailureKind,
    /// Last SMTP reply code, when the relay answered.
    pub code: Option<u16>,
    pub email_id: String,
    pub error: TransportError,
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Email sending failed after {} attempts: {}",
            self.attempts, self.reason
        )
    }
}

impl std::error::Error for DispatchFailure {}

/// Terminal result of a logical send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success(Delivery),
    Failure(DispatchFailure),
}

impl SendOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Attempts made, whatever the outcome.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Success(delivery) => delivery.attempts,
            Self::Failure(failure) => failure.attempts,
        }
    }

    /// # Errors
    ///
    /// Returns the failure when the send did not succeed.
    pub fn into_result(self) -> Result<Delivery, DispatchFailure> {
        match self {
            Self::Success(delivery) => Ok(delivery),
            Self::Failure(failure) => Err(failure),
        }
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Failed {
        error: TransportError,
        class: FailureClass,
    },
}

/// Record of one try, kept for the duration of a send and logged with its
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchAttempt {
    /// 0-based attempt index.
    pub index: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcome: AttemptOutcome,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_failure_display() {
        let failure = DispatchFailure {
            reason: "451 4.3.0 Local error".to_string(),
            attempts: 4,
            kind: FailureKind::Exhausted,
            code: Some(451),
            email_id: "01J".to_string(),
            error: TransportError::Smtp {
                code: 451,
                message: "4.3.0 Local error".to_string(),
            },
        };

        assert_eq!(
            failure.to_string(),
            "Email sending failed after 4 attempts: 451 4.3.0 Local error"
        );

        let outcome = SendOutcome::Failure(failure);
        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), 4);
        assert!(outcome.into_result().is_err());
    }

    #[test]
    fn test_request_builder() {
        let request = SendRequest::new("patient@example.com", "Welcome")
            .with_text("Hi")
            .with_html("<p>Hi</p>");
        assert_eq!(request.text.as_deref(), Some("Hi"));
        assert_eq!(request.html.as_deref(), Some("<p>Hi</p>"));
    }
}
