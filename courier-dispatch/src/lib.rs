//! Resilient notification dispatch over a pooled SMTP relay
//!
//! This module provides functionality to:
//! - Pool, rate limit and recycle relay connections
//! - Classify send failures as transient or permanent
//! - Retry transient failures with exponential backoff
//! - Bound every attempt with a deadline

mod backoff;
mod classify;
mod config;
mod dispatcher;
mod error;
mod pool;
mod rate_limiter;
mod transport;
mod types;

// Re-export retry policy
pub use backoff::BackoffPolicy;
pub use classify::{FailureClass, TRANSIENT_CODES, is_retryable};
// Re-export configuration
pub use config::{DispatchConfig, PoolConfig};
// Re-export core types
pub use dispatcher::Dispatcher;
pub use error::{PoolError, TransportError};
pub use pool::{ConnectionPool, Lease};
pub use rate_limiter::RateLimiter;
pub use transport::{Connection, Connector, Envelope, SmtpConnector};
pub use types::{
    AttemptOutcome, Delivery, DispatchAttempt, DispatchFailure, FailureKind, SendOutcome,
    SendRequest, Sender,
};
