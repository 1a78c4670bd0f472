//! Retryable vs. terminal failure classification.

use crate::error::TransportError;

/// Reply codes the relay uses for conditions expected to clear on their own:
/// service unavailable, mailbox busy, local error, insufficient storage.
pub const TRANSIENT_CODES: [u16; 4] = [421, 450, 451, 452];

/// Whether an attempt that failed with `error` is worth repeating.
///
/// Connection-level failures and the transient reply codes are retryable, as
/// is anything whose text mentions a `timeout`. Permanent rejections,
/// authentication failures, malformed messages and a closed pool are not.
#[must_use]
pub fn is_retryable(error: &TransportError) -> bool {
    match error {
        TransportError::ConnectionReset(_)
        | TransportError::HostNotFound(_)
        | TransportError::ConnectionRefused(_)
        | TransportError::TimedOut(_)
        | TransportError::Socket(_)
        | TransportError::AttemptTimeout(_) => true,
        TransportError::PoolClosed => false,
        TransportError::Smtp { code, .. } if TRANSIENT_CODES.contains(code) => true,
        other => other.to_string().contains("timeout"),
    }
}

/// Coarse class of a failure, for logs and outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl FailureClass {
    #[must_use]
    pub fn of(error: &TransportError) -> Self {
        if is_retryable(error) {
            Self::Transient
        } else {
            Self::Permanent
        }
    }
}
