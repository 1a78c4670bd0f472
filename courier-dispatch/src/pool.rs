//! Connection pool for the outbound relay
//!
//! The pool owns every live relay connection. It enforces:
//! - a concurrency ceiling (`max_connections` leases at once, via a semaphore)
//! - a throughput ceiling (`rate_limit` messages per `rate_delta`)
//! - a per-connection message cap (`max_messages`), after which the
//!   connection is closed and replaced
//! - an idle timeout, after which a parked connection is not reused
//!
//! A parked connection must answer a liveness check before it is handed out
//! again; one the relay has dropped is discarded and replaced.
//!
//! Callers get a [`Lease`] per attempt. Returning it with [`Lease::release`]
//! parks the connection for reuse; dropping it discards the connection, which
//! is what happens when an attempt fails or times out.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use courier_common::tracing;
use courier_smtp::{Message, Submission};
use parking_lot::Mutex;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::PoolConfig,
    error::{PoolError, TransportError},
    rate_limiter::RateLimiter,
    transport::{Connection, Connector, Envelope},
};

struct IdleConnection {
    connection: Box<dyn Connection>,
    messages: u32,
    last_used: Instant,
}

/// Process-wide pool of relay connections.
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    limiter: RateLimiter,
    idle: Mutex<Vec<IdleConnection>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("idle", &self.idle.lock().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates the pool. No connection is opened until the first lease or
    /// [`ConnectionPool::verify`].
    #[must_use]
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            limiter: RateLimiter::new(config.rate_limit, config.rate_delta()),
            idle: Mutex::new(Vec::with_capacity(config.max_connections)),
            closed: AtomicBool::new(false),
            connector,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connections parked for reuse.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Leases that could be handed out right now without waiting.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Opens and politely closes one connection to prove the relay is
    /// reachable and accepts our credentials.
    ///
    /// Failure is logged and returned, but leaves the pool fully usable.
    ///
    /// # Errors
    ///
    /// Returns the connection error, or [`TransportError::PoolClosed`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn verify(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::PoolClosed);
        }

        match self.connector.connect().await {
            Ok(connection) => {
                connection.close().await;
                tracing::info!("SMTP relay connection verified");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "SMTP relay connection failed");
                Err(e)
            }
        }
    }

    /// Runs [`ConnectionPool::verify`] in the background.
    pub fn spawn_verify(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let _ = pool.verify().await;
        })
    }

    /// Waits for a concurrency permit and a rate token, then hands out a
    /// parked connection or opens a new one.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] once the pool is closed, or
    /// [`PoolError::Connect`] if a new connection cannot be opened.
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        self.limiter.acquire().await;

        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let (connection, messages) = match self.take_live_idle().await {
            Some(idle) => (idle.connection, idle.messages),
            None => (self.connector.connect().await?, 0),
        };

        Ok(Lease {
            pool: Arc::clone(self),
            connection: Some(connection),
            messages,
            _permit: permit,
        })
    }

    /// Pops parked connections until one passes its liveness check.
    async fn take_live_idle(&self) -> Option<IdleConnection> {
        while let Some(mut idle) = self.take_idle() {
            match idle.connection.check().await {
                Ok(()) => return Some(idle),
                Err(e) => {
                    tracing::debug!(error = %e, "Discarding dead idle connection");
                }
            }
        }

        None
    }

    /// Pops the most recently used connection that has not idled out.
    fn take_idle(&self) -> Option<IdleConnection> {
        let idle_timeout = self.config.idle_timeout();
        let mut expired = Vec::new();

        let found = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(candidate) = idle.pop() {
                if candidate.last_used.elapsed() > idle_timeout {
                    expired.push(candidate);
                } else {
                    found = Some(candidate);
                    break;
                }
            }
            found
        };

        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Discarding idle connections");
            tokio::spawn(async move {
                for stale in expired {
                    stale.connection.close().await;
                }
            });
        }

        found
    }

    fn park(&self, connection: Box<dyn Connection>, messages: u32) -> Option<Box<dyn Connection>> {
        if messages >= self.config.max_messages {
            return Some(connection);
        }

        // `close` sets the flag before draining under this lock, so checking
        // here cannot strand a connection in a drained pool.
        let mut idle = self.idle.lock();
        if self.is_closed() {
            return Some(connection);
        }

        idle.push(IdleConnection {
            connection,
            messages,
            last_used: Instant::now(),
        });
        None
    }

    /// Closes every parked connection. Leases already handed out finish
    /// their attempt, after which their connections are closed instead of
    /// parked. Every later [`ConnectionPool::acquire`] fails with
    /// [`PoolError::Closed`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.permits.close();

        let idle = std::mem::take(&mut *self.idle.lock());
        for parked in idle {
            parked.connection.close().await;
        }

        tracing::info!("Courier service closed");
    }
}

/// The right to use one pooled connection for one attempt.
pub struct Lease {
    pool: Arc<ConnectionPool>,
    connection: Option<Box<dyn Connection>>,
    messages: u32,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Messages this connection has carried, including earlier leases.
    #[must_use]
    pub const fn messages(&self) -> u32 {
        self.messages
    }

    /// Submits one message over the leased connection.
    ///
    /// # Errors
    ///
    /// Returns the transport error; the lease should then be dropped.
    pub async fn send(
        &mut self,
        envelope: &Envelope,
        message: &Message,
    ) -> Result<Submission, TransportError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| TransportError::ConnectionReset("lease already released".into()))?;

        self.messages += 1;
        connection.send(envelope, message).await
    }

    /// Returns the connection to the pool, or closes it if it reached the
    /// message cap or the pool is closing.
    pub async fn release(mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        if let Some(retired) = self.pool.park(connection, self.messages) {
            tracing::debug!(messages = self.messages, "Retiring connection");
            retired.close().await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.connection.take().is_some() {
            tracing::debug!("Discarding connection from unreleased lease");
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("messages", &self.messages)
            .finish_non_exhaustive()
    }
}
