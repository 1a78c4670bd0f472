//! The retrying dispatcher
//!
//! Per logical send:
//!
//! ```text
//! Pending -> Attempting -> Success
//!                       -> Retrying -> Attempting
//!                       -> Failed
//! ```
//!
//! Each attempt leases a pooled connection and submits the message, the two
//! together raced against the attempt timeout. Failures are classified; only
//! transient ones are retried, after a backoff, up to `max_retries` times.

use std::sync::Arc;

use chrono::Utc;
use courier_common::{audit, tracing};
use courier_smtp::{MessageBuilder, Submission};
use tokio::{task::JoinHandle, time::Instant};
use ulid::Ulid;

use crate::{
    backoff::BackoffPolicy,
    classify::{FailureClass, is_retryable},
    config::DispatchConfig,
    error::TransportError,
    pool::ConnectionPool,
    transport::Envelope,
    types::{
        AttemptOutcome, Delivery, DispatchAttempt, DispatchFailure, FailureKind, SendOutcome,
        SendRequest, Sender,
    },
};

/// Sends notifications through a shared [`ConnectionPool`].
#[derive(Debug)]
pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    config: DispatchConfig,
    backoff: BackoffPolicy,
    sender: Sender,
}

impl Dispatcher {
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, config: DispatchConfig, sender: Sender) -> Self {
        Self {
            backoff: config.backoff(),
            pool,
            config,
            sender,
        }
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Sends `request`, retrying up to the configured `max_retries`.
    pub async fn send(&self, request: &SendRequest) -> SendOutcome {
        self.send_with_retries(request, self.config.max_retries)
            .await
    }

    /// Sends `request`, making at most `max_retries + 1` attempts.
    ///
    /// Never fails in the `Result` sense: every way a send can end is a
    /// [`SendOutcome`].
    #[tracing::instrument(level = "info", skip_all, fields(email_id = tracing::field::Empty))]
    pub async fn send_with_retries(&self, request: &SendRequest, max_retries: u32) -> SendOutcome {
        let email_id = Ulid::new().to_string();
        tracing::Span::current().record("email_id", email_id.as_str());

        let started = Instant::now();
        let max_attempts = max_retries.saturating_add(1);
        let attempt_timeout = self.config.attempt_timeout();
        let mut history: Vec<DispatchAttempt> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            audit::log_dispatch_attempt(&email_id, &request.recipient, attempt + 1, max_attempts);

            let attempt_started = Instant::now();
            let started_at = Utc::now();
            let result = tokio::time::timeout(attempt_timeout, self.attempt(request, &email_id))
                .await
                .unwrap_or(Err(TransportError::AttemptTimeout(attempt_timeout)));

            let error = match result {
                Ok((message_id, submission)) => {
                    history.push(DispatchAttempt {
                        index: attempt,
                        started_at,
                        elapsed: attempt_started.elapsed(),
                        outcome: AttemptOutcome::Delivered,
                    });

                    return Self::succeed(
                        request,
                        email_id,
                        message_id,
                        submission,
                        &history,
                        started,
                    );
                }
                Err(error) => error,
            };

            let retryable = is_retryable(&error);
            history.push(DispatchAttempt {
                index: attempt,
                started_at,
                elapsed: attempt_started.elapsed(),
                outcome: AttemptOutcome::Failed {
                    error: error.clone(),
                    class: FailureClass::of(&error),
                },
            });

            if retryable && attempt < max_retries {
                let delay = self.backoff.delay(attempt);
                audit::log_dispatch_retry(
                    &email_id,
                    &request.recipient,
                    attempt + 1,
                    max_attempts,
                    delay.as_millis(),
                    &error.to_string(),
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let kind = match &error {
                TransportError::PoolClosed => FailureKind::PoolUnavailable,
                _ if retryable => FailureKind::Exhausted,
                _ => FailureKind::Permanent,
            };

            return Self::fail(request, email_id, error, kind, &history, started);
        }
    }

    /// One attempt: render, lease, submit, return the connection.
    async fn attempt(
        &self,
        request: &SendRequest,
        email_id: &str,
    ) -> Result<(String, Submission), TransportError> {
        let message = self.render(request, email_id)?;
        let envelope = Envelope {
            from: self.sender.address.clone(),
            recipients: vec![request.recipient.clone()],
        };

        let mut lease = self.pool.acquire().await?;
        let submission = lease.send(&envelope, &message).await?;
        lease.release().await;

        Ok((message.message_id, submission))
    }

    fn render(
        &self,
        request: &SendRequest,
        email_id: &str,
    ) -> Result<courier_smtp::Message, TransportError> {
        let mut builder = MessageBuilder::new()
            .from(&self.sender.address)
            .to(&request.recipient)
            .subject(&request.subject)
            .mailer(&self.config.mailer)
            .email_id(email_id);

        if let Some(name) = &self.sender.name {
            builder = builder.from_name(name);
        }
        if let Some(text) = &request.text {
            builder = builder.text(text);
        }
        if let Some(html) = &request.html {
            builder = builder.html(html);
        }

        Ok(builder.build()?)
    }

    fn succeed(
        request: &SendRequest,
        email_id: String,
        message_id: String,
        submission: Submission,
        history: &[DispatchAttempt],
        started: Instant,
    ) -> SendOutcome {
        let attempts = u32::try_from(history.len()).unwrap_or(u32::MAX);

        audit::log_dispatch_success(
            &email_id,
            &message_id,
            &request.recipient,
            &request.subject,
            &submission.accepted,
            &submission.rejected,
            attempts,
            started.elapsed().as_millis(),
        );
        tracing::debug!(?history, "Dispatch attempts");

        SendOutcome::Success(Delivery {
            message_id,
            email_id,
            accepted: submission.accepted,
            rejected: submission.rejected,
            response: submission.response.to_string(),
            attempts,
        })
    }

    fn fail(
        request: &SendRequest,
        email_id: String,
        error: TransportError,
        kind: FailureKind,
        history: &[DispatchAttempt],
        started: Instant,
    ) -> SendOutcome {
        let attempts = u32::try_from(history.len()).unwrap_or(u32::MAX);
        let reason = error.to_string();

        audit::log_dispatch_failure(
            &email_id,
            &request.recipient,
            &request.subject,
            &reason,
            error.code(),
            kind.as_str(),
            attempts,
            started.elapsed().as_millis(),
        );
        tracing::debug!(?history, "Dispatch attempts");

        SendOutcome::Failure(DispatchFailure {
            reason,
            attempts,
            kind,
            code: error.code(),
            email_id,
            error,
        })
    }

    /// Sends in the background. A failure is logged, never propagated; the
    /// outcome is still available through the handle.
    pub fn send_detached(self: &Arc<Self>, request: SendRequest) -> JoinHandle<SendOutcome> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = dispatcher.send(&request).await;
            if let SendOutcome::Failure(failure) = &outcome {
                tracing::warn!(
                    email_id = %failure.email_id,
                    kind = %failure.kind,
                    attempts = failure.attempts,
                    "Notification could not be delivered: {failure}"
                );
            }
            outcome
        })
    }
}
