//! Scripted in-memory relay for dispatch tests
//!
//! Every `send` pops the next [`Step`] from the script; an empty script
//! delivers. Connect failures and failed liveness checks are scripted
//! separately. Counters track how many
//! connections were opened and closed so pool behaviour can be asserted
//! without a socket.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_dispatch::{Connection, Connector, Envelope, TransportError};
use courier_smtp::{Message, Response, Submission};
use parking_lot::Mutex;

/// What the next `send` does
#[derive(Debug, Clone)]
pub enum Step {
    Deliver,
    Fail(TransportError),
    /// Never completes; only the attempt deadline ends it
    Hang,
    /// Delivers after the given (virtual) delay
    Slow(Duration),
}

#[derive(Default)]
struct StubState {
    script: Mutex<VecDeque<Step>>,
    connect_failures: Mutex<VecDeque<TransportError>>,
    delivered: Mutex<Vec<(Envelope, Message)>>,
    seen: Mutex<Vec<Message>>,
    check_failures: AtomicUsize,
    checks: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    sends: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Shared handle; clone it before handing a copy to the pool.
#[derive(Clone, Default)]
pub struct StubConnector {
    state: Arc<StubState>,
}

impl StubConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
        let connector = Self::new();
        connector.state.script.lock().extend(steps);
        connector
    }

    pub fn fail_next_connect(&self, error: TransportError) {
        self.state.connect_failures.lock().push_back(error);
    }

    /// The next `count` liveness checks report a dropped connection
    pub fn fail_next_checks(&self, count: usize) {
        self.state.check_failures.fetch_add(count, Ordering::SeqCst);
    }

    pub fn push(&self, step: Step) {
        self.state.script.lock().push_back(step);
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn checks(&self) -> usize {
        self.state.checks.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sends(&self) -> usize {
        self.state.sends.load(Ordering::SeqCst)
    }

    /// Highest number of sends that were running at the same time
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every message a send was attempted with, delivered or not
    #[must_use]
    pub fn seen(&self) -> Vec<Message> {
        self.state.seen.lock().clone()
    }

    #[must_use]
    pub fn delivered(&self) -> Vec<(Envelope, Message)> {
        self.state.delivered.lock().clone()
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.state.connect_failures.lock().pop_front() {
            return Err(error);
        }

        Ok(Box::new(StubConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct StubConnection {
    state: Arc<StubState>,
}

struct InFlight<'a>(&'a StubState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a StubState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for StubConnection {
    async fn send(
        &mut self,
        envelope: &Envelope,
        message: &Message,
    ) -> Result<Submission, TransportError> {
        self.state.sends.fetch_add(1, Ordering::SeqCst);
        self.state.seen.lock().push(message.clone());
        let _guard = InFlight::enter(&self.state);

        let step = self.state.script.lock().pop_front().unwrap_or(Step::Deliver);
        match step {
            Step::Deliver => {}
            Step::Fail(error) => return Err(error),
            Step::Hang => std::future::pending::<()>().await,
            Step::Slow(delay) => tokio::time::sleep(delay).await,
        }

        self.state
            .delivered
            .lock()
            .push((envelope.clone(), message.clone()));

        Ok(Submission {
            accepted: envelope.recipients.clone(),
            rejected: Vec::new(),
            response: Response::new(250, vec!["2.0.0 OK: queued".to_string()]),
        })
    }

    async fn check(&mut self) -> Result<(), TransportError> {
        self.state.checks.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .state
            .check_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::ConnectionReset("connection dropped by relay".into()));
        }

        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}
