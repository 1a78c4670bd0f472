//! Audit logging for the dispatch lifecycle
//!
//! Every logical send produces a trail of structured events:
//!
//! - `DispatchAttempt`: a transport attempt is starting
//! - `DispatchRetry`: an attempt failed with a transient error and will be retried
//! - `DispatchSuccess`: the relay accepted the message
//! - `DispatchFailure`: the send ended without delivery (permanent error,
//!   exhausted retries, or the pool was unavailable)
//!
//! ## PII Redaction
//!
//! Recipients and subjects in this system routinely identify patients, so both
//! can be redacted via [`AuditConfig`]. Redaction keeps the recipient domain so
//! relay-side problems can still be correlated.
//!
//! Emitting an audit event never fails and never blocks the caller beyond the
//! cost of the subscriber.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable audit logging for dispatch lifecycle events
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redact recipient email addresses from audit logs
    #[serde(default)]
    pub redact_recipients: bool,

    /// Redact message subjects from audit logs
    #[serde(default)]
    pub redact_subject: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_recipients: false,
            redact_subject: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Global audit configuration (thread-safe)
static AUDIT_CONFIG: std::sync::OnceLock<Arc<AuditConfig>> = std::sync::OnceLock::new();

/// Initialize audit logging with configuration
pub fn init(config: AuditConfig) {
    AUDIT_CONFIG.get_or_init(|| Arc::new(config));
}

/// Get the current audit configuration
#[must_use]
pub fn config() -> Arc<AuditConfig> {
    AUDIT_CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(AuditConfig::default()))
}

/// Redact email address if redaction is enabled
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if redact {
        // Keep domain but redact local part
        if let Some((_, domain)) = email.split_once('@') {
            format!("[REDACTED]@{domain}")
        } else {
            "[REDACTED]".to_string()
        }
    } else {
        email.to_string()
    }
}

/// Redact multiple email addresses
#[must_use]
pub fn redact_emails(emails: &[String], redact: bool) -> Vec<String> {
    emails.iter().map(|e| redact_email(e, redact)).collect()
}

/// Redact a subject line if redaction is enabled
#[must_use]
pub fn redact_subject(subject: &str, redact: bool) -> String {
    if redact {
        "[REDACTED]".to_string()
    } else {
        subject.to_string()
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Log dispatch attempt event
///
/// # Fields
/// - `email_id`: Tracing identifier of the logical send (`X-Email-ID`)
/// - `recipient`: Recipient (redacted if configured)
/// - `attempt`: Attempt number (1-based)
/// - `max_attempts`: Attempts allowed for this send
pub fn log_dispatch_attempt(email_id: &str, recipient: &str, attempt: u32, max_attempts: u32) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::DEBUG,
        event = "DispatchAttempt",
        timestamp = %timestamp(),
        email_id = %email_id,
        recipient = %redact_email(recipient, config.redact_recipients),
        attempt = attempt,
        max_attempts = max_attempts,
        "Audit: Dispatch attempt"
    );
}

/// Log dispatch retry event
///
/// Logged when an attempt failed with a transient error and another attempt
/// will follow after `delay_ms`.
pub fn log_dispatch_retry(
    email_id: &str,
    recipient: &str,
    attempt: u32,
    max_attempts: u32,
    delay_ms: u128,
    error: &str,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::WARN,
        event = "DispatchRetry",
        timestamp = %timestamp(),
        email_id = %email_id,
        recipient = %redact_email(recipient, config.redact_recipients),
        attempt = attempt,
        max_attempts = max_attempts,
        delay_ms = delay_ms,
        error = %error,
        "Audit: Dispatch attempt failed, retrying"
    );
}

/// Log dispatch success event
///
/// # Fields
/// - `email_id`: Tracing identifier of the logical send
/// - `message_id`: `Message-ID` of the delivered message
/// - `recipient`, `subject`: redacted if configured
/// - `accepted`, `rejected`: recipient lists reported by the relay
/// - `attempts`: Total attempts made
/// - `duration_ms`: Wall-clock time of the whole logical send
#[allow(clippy::too_many_arguments)]
pub fn log_dispatch_success(
    email_id: &str,
    message_id: &str,
    recipient: &str,
    subject: &str,
    accepted: &[String],
    rejected: &[String],
    attempts: u32,
    duration_ms: u128,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "DispatchSuccess",
        timestamp = %timestamp(),
        email_id = %email_id,
        message_id = %message_id,
        recipient = %redact_email(recipient, config.redact_recipients),
        subject = %redact_subject(subject, config.redact_subject),
        accepted = ?redact_emails(accepted, config.redact_recipients),
        rejected = ?redact_emails(rejected, config.redact_recipients),
        attempts = attempts,
        duration_ms = duration_ms,
        "Audit: Dispatch successful"
    );
}

/// Log dispatch failure event
///
/// Logged once per logical send that ends without delivery.
///
/// # Fields
/// - `error`: Last error description
/// - `code`: Last SMTP response code, when the relay answered
/// - `kind`: Why the send is terminal (`permanent`, `exhausted`, `pool_unavailable`)
/// - `attempts`: Total attempts made
#[allow(clippy::too_many_arguments)]
pub fn log_dispatch_failure(
    email_id: &str,
    recipient: &str,
    subject: &str,
    error: &str,
    code: Option<u16>,
    kind: &str,
    attempts: u32,
    duration_ms: u128,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::ERROR,
        event = "DispatchFailure",
        timestamp = %timestamp(),
        email_id = %email_id,
        recipient = %redact_email(recipient, config.redact_recipients),
        subject = %redact_subject(subject, config.redact_subject),
        error = %error,
        code = ?code,
        kind = %kind,
        attempts = attempts,
        duration_ms = duration_ms,
        "Audit: Dispatch failed"
    );
}
