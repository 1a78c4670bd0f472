//! Dispatcher and pool behaviour against a scripted relay, on a paused clock

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::{sync::Arc, time::Duration};

use courier_dispatch::{
    ConnectionPool, DispatchConfig, Dispatcher, FailureKind, PoolConfig, SendOutcome, SendRequest,
    Sender, TransportError,
};
use mailparse::MailHeaderMap;
use pretty_assertions::assert_eq;
use support::stub::{Step, StubConnector};
use tokio::time::Instant;

fn pool_config() -> PoolConfig {
    PoolConfig {
        rate_limit: 1000,
        ..PoolConfig::default()
    }
}

fn dispatcher(connector: &StubConnector, pool: PoolConfig) -> Arc<Dispatcher> {
    let pool = Arc::new(ConnectionPool::new(pool, Arc::new(connector.clone())));
    Arc::new(Dispatcher::new(
        pool,
        DispatchConfig::default(),
        Sender::new("notifications@clinic.example").with_name("Clinic"),
    ))
}

fn request() -> SendRequest {
    SendRequest::new("patient@example.com", "Appointment confirmed")
        .with_text("See you on Tuesday at 10:00.")
}

fn smtp(code: u16, message: &str) -> TransportError {
    TransportError::Smtp {
        code,
        message: message.to_string(),
    }
}

fn header(content: &str, name: &str) -> Option<String> {
    let parsed = mailparse::parse_mail(content.as_bytes()).expect("parse message");
    parsed.headers.get_first_value(name)
}

fn assert_elapsed_near(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(100),
        "expected about {expected:?}, got {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success() {
    let connector = StubConnector::with_script([
        Step::Fail(smtp(451, "4.3.0 Local error")),
        Step::Fail(TransportError::ConnectionReset("reset by peer".into())),
        Step::Deliver,
    ]);
    let dispatcher = dispatcher(&connector, pool_config());

    let start = Instant::now();
    let outcome = dispatcher.send(&request()).await;

    let SendOutcome::Success(delivery) = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(delivery.attempts, 3);
    assert_eq!(delivery.accepted, vec!["patient@example.com".to_string()]);
    assert!(delivery.rejected.is_empty());
    assert_eq!(delivery.response, "250 2.0.0 OK: queued");

    // 1s after the first failure, 2s after the second
    assert_elapsed_near(start, Duration::from_millis(3000));
    assert_eq!(connector.sends(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_not_retried() {
    let connector = StubConnector::with_script([Step::Fail(smtp(550, "5.1.1 No such user"))]);
    let dispatcher = dispatcher(&connector, pool_config());

    let start = Instant::now();
    let failure = dispatcher.send(&request()).await.into_result().unwrap_err();

    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.code, Some(550));
    assert_eq!(
        failure.to_string(),
        "Email sending failed after 1 attempts: 550 5.1.1 No such user"
    );
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(connector.sends(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_not_retried() {
    let connector = StubConnector::new();
    connector.fail_next_connect(TransportError::Authentication {
        code: Some(535),
        message: "5.7.8 Bad credentials".to_string(),
    });
    let dispatcher = dispatcher(&connector, pool_config());

    let failure = dispatcher.send(&request()).await.into_result().unwrap_err();

    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.code, Some(535));
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let connector = StubConnector::with_script(
        std::iter::repeat_n(Step::Fail(smtp(421, "4.7.0 Try again later")), 10),
    );
    let dispatcher = dispatcher(&connector, pool_config());

    let start = Instant::now();
    let failure = dispatcher.send(&request()).await.into_result().unwrap_err();

    assert_eq!(failure.attempts, 4);
    assert_eq!(failure.kind, FailureKind::Exhausted);
    assert_eq!(failure.code, Some(421));
    assert_elapsed_near(start, Duration::from_millis(1000 + 2000 + 4000));
    assert_eq!(connector.sends(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_retry_budget() {
    let connector = StubConnector::with_script(
        std::iter::repeat_n(Step::Fail(TransportError::Socket("broken pipe".into())), 10),
    );
    let dispatcher = dispatcher(&connector, pool_config());

    let outcome = dispatcher.send_with_retries(&request(), 1).await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.attempts(), 2);
    assert_eq!(connector.sends(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_relay_times_out() {
    let connector = StubConnector::with_script([Step::Hang]);
    let dispatcher = dispatcher(&connector, pool_config());

    let start = Instant::now();
    let failure = dispatcher
        .send_with_retries(&request(), 0)
        .await
        .into_result()
        .unwrap_err();

    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.kind, FailureKind::Exhausted);
    assert_eq!(failure.error, TransportError::AttemptTimeout(Duration::from_secs(30)));
    assert!(failure.reason.contains("timeout"));
    assert_elapsed_near(start, Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_every_attempt_times_out() {
    let connector = StubConnector::with_script(std::iter::repeat_n(Step::Hang, 4));
    let dispatcher = dispatcher(&connector, pool_config());

    let start = Instant::now();
    let failure = dispatcher.send(&request()).await.into_result().unwrap_err();

    assert_eq!(failure.attempts, 4);
    assert_elapsed_near(start, Duration::from_secs(4 * 30 + 1 + 2 + 4));

    // Timed-out leases are discarded, never parked
    assert_eq!(dispatcher.pool().idle_count(), 0);
    assert_eq!(connector.connects(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_slow_delivery_within_deadline() {
    let connector = StubConnector::with_script([Step::Slow(Duration::from_secs(29))]);
    let dispatcher = dispatcher(&connector, pool_config());

    let outcome = dispatcher.send(&request()).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_is_retried() {
    let connector = StubConnector::new();
    connector.fail_next_connect(TransportError::HostNotFound("smtp.example.invalid".into()));
    let dispatcher = dispatcher(&connector, pool_config());

    let outcome = dispatcher.send(&request()).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts(), 2);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_send_after_close() {
    let connector = StubConnector::new();
    let dispatcher = dispatcher(&connector, pool_config());

    dispatcher.pool().close().await;
    let failure = dispatcher.send(&request()).await.into_result().unwrap_err();

    assert_eq!(failure.kind, FailureKind::PoolUnavailable);
    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.error, TransportError::PoolClosed);
    assert_eq!(connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_recipient_never_reaches_relay() {
    let connector = StubConnector::new();
    let dispatcher = dispatcher(&connector, pool_config());

    let failure = dispatcher
        .send(&SendRequest::new("not-an-address", "Hello").with_text("Hi"))
        .await
        .into_result()
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::Permanent);
    assert!(matches!(failure.error, TransportError::InvalidMessage(_)));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_email_id_is_stable_across_retries() {
    let connector = StubConnector::with_script([
        Step::Fail(TransportError::ConnectionReset("reset by peer".into())),
        Step::Deliver,
    ]);
    let dispatcher = dispatcher(&connector, pool_config());

    let delivery = dispatcher.send(&request()).await.into_result().unwrap();

    let seen = connector.seen();
    assert_eq!(seen.len(), 2);
    for message in &seen {
        assert_eq!(
            header(&message.content, "X-Email-ID").as_deref(),
            Some(delivery.email_id.as_str())
        );
        assert_eq!(header(&message.content, "X-Mailer").as_deref(), Some("Courier"));
    }

    let (envelope, message) = connector.delivered().pop().unwrap();
    assert_eq!(envelope.from, "notifications@clinic.example");
    assert_eq!(envelope.recipients, vec!["patient@example.com".to_string()]);
    assert_eq!(message.message_id, delivery.message_id);
    let parsed = mailparse::parse_mail(message.content.as_bytes()).unwrap();
    let from =
        mailparse::addrparse_header(parsed.headers.get_first_header("From").unwrap()).unwrap();
    assert_eq!(
        from.extract_single_info().map(|info| (info.display_name, info.addr)),
        Some((
            Some("Clinic".to_string()),
            "notifications@clinic.example".to_string()
        ))
    );
    assert_eq!(
        header(&message.content, "Subject").as_deref(),
        Some("Appointment confirmed")
    );
}

#[tokio::test(start_paused = true)]
async fn test_separate_sends_get_separate_ids() {
    let connector = StubConnector::new();
    let dispatcher = dispatcher(&connector, pool_config());

    let first = dispatcher.send(&request()).await.into_result().unwrap();
    let second = dispatcher.send(&request()).await.into_result().unwrap();

    assert_ne!(first.email_id, second.email_id);
    assert_ne!(first.message_id, second.message_id);
}

#[tokio::test(start_paused = true)]
async fn test_pool_bounds_concurrency() {
    let connector =
        StubConnector::with_script(std::iter::repeat_n(Step::Slow(Duration::from_millis(100)), 6));
    let dispatcher = dispatcher(
        &connector,
        PoolConfig {
            max_connections: 2,
            ..pool_config()
        },
    );

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.send(&request()).await })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    assert_eq!(connector.max_in_flight(), 2);
    assert_eq!(connector.connects(), 2);
    assert_eq!(dispatcher.pool().idle_count(), 2);
    assert_eq!(dispatcher.pool().available_permits(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connection_recycled_after_message_cap() {
    let connector = StubConnector::new();
    let dispatcher = dispatcher(
        &connector,
        PoolConfig {
            max_messages: 2,
            ..pool_config()
        },
    );

    for _ in 0..5 {
        assert!(dispatcher.send(&request()).await.is_success());
    }

    assert_eq!(connector.connects(), 3);
    assert_eq!(connector.closes(), 2);
    assert_eq!(dispatcher.pool().idle_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_expires() {
    let connector = StubConnector::new();
    let dispatcher = dispatcher(
        &connector,
        PoolConfig {
            idle_timeout_secs: 60,
            ..pool_config()
        },
    );

    assert!(dispatcher.send(&request()).await.is_success());
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(dispatcher.send(&request()).await.is_success());
    assert_eq!(connector.connects(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(dispatcher.send(&request()).await.is_success());
    assert_eq!(connector.connects(), 2);

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(connector.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dead_idle_connection_is_replaced() {
    let connector = StubConnector::new();
    let dispatcher = dispatcher(&connector, pool_config());

    assert!(dispatcher.send(&request()).await.is_success());
    assert_eq!(connector.checks(), 0);

    connector.fail_next_checks(1);
    let start = Instant::now();
    let delivery = dispatcher.send(&request()).await.into_result().unwrap();

    // The dead connection costs neither an attempt nor a backoff
    assert_eq!(delivery.attempts, 1);
    assert_elapsed_near(start, Duration::ZERO);
    assert_eq!(connector.checks(), 1);
    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.sends(), 2);

    assert!(dispatcher.send(&request()).await.is_success());
    assert_eq!(connector.checks(), 2);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_release_after_close_does_not_park() {
    let connector = StubConnector::new();
    let dispatcher = dispatcher(&connector, pool_config());

    let lease = dispatcher.pool().acquire().await.unwrap();
    dispatcher.pool().close().await;
    lease.release().await;

    assert_eq!(dispatcher.pool().idle_count(), 0);
    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spaces_sends() {
    let connector = StubConnector::new();
    let dispatcher = dispatcher(
        &connector,
        PoolConfig {
            rate_limit: 2,
            rate_delta_ms: 1000,
            ..PoolConfig::default()
        },
    );

    let start = Instant::now();
    for _ in 0..4 {
        assert!(dispatcher.send(&request()).await.is_success());
    }

    // Two immediately, then one per half second
    assert_elapsed_near(start, Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_verify_failure_leaves_pool_usable() {
    let connector = StubConnector::new();
    connector.fail_next_connect(TransportError::ConnectionRefused("127.0.0.1:2525".into()));
    let dispatcher = dispatcher(&connector, pool_config());

    let error = dispatcher.pool().verify().await.unwrap_err();
    assert_eq!(
        error,
        TransportError::ConnectionRefused("127.0.0.1:2525".into())
    );

    dispatcher.pool().verify().await.unwrap();
    assert_eq!(connector.closes(), 1);

    assert!(dispatcher.send(&request()).await.is_success());
    assert_eq!(connector.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_verify_runs_in_background() {
    let connector = StubConnector::new();
    let dispatcher = dispatcher(&connector, pool_config());

    dispatcher.pool().spawn_verify().await.unwrap();

    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_quits_idle_connections() {
    let connector = StubConnector::new();
    let dispatcher = dispatcher(&connector, pool_config());

    assert!(dispatcher.send(&request()).await.is_success());
    assert_eq!(dispatcher.pool().idle_count(), 1);

    dispatcher.pool().close().await;
    dispatcher.pool().close().await;

    assert!(dispatcher.pool().is_closed());
    assert_eq!(dispatcher.pool().idle_count(), 0);
    assert_eq!(connector.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_detached_reports_outcome() {
    let connector = StubConnector::with_script([Step::Fail(smtp(554, "5.7.1 Rejected"))]);
    let dispatcher = dispatcher(&connector, pool_config());

    let failed = dispatcher.send_detached(request()).await.unwrap();
    let delivered = dispatcher.send_detached(request()).await.unwrap();

    assert_eq!(failed.attempts(), 1);
    assert!(!failed.is_success());
    assert!(delivered.is_success());
}
