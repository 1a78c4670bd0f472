//! Dispatch through the real SMTP connector against the mock relay

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use courier_common::config::{ClientTimeouts, SmtpConfig};
use courier_dispatch::{
    ConnectionPool, DispatchConfig, Dispatcher, FailureKind, PoolConfig, SendRequest, Sender,
    SmtpConnector, TransportError,
};
use courier_testing::{MockSmtpServer, SmtpCommand};
use pretty_assertions::assert_eq;

fn dispatcher_for(server: &MockSmtpServer, dispatch: DispatchConfig) -> Dispatcher {
    dispatcher_on(server.addr().port(), dispatch)
}

fn dispatcher_on(port: u16, dispatch: DispatchConfig) -> Dispatcher {
    let mut smtp = SmtpConfig::new("127.0.0.1", port);
    smtp.helo_name = "courier.test".to_string();
    smtp.timeouts = ClientTimeouts {
        connect_secs: 5,
        greeting_secs: 5,
        socket_secs: 5,
    };

    let pool = Arc::new(ConnectionPool::new(
        PoolConfig {
            rate_limit: 100,
            ..PoolConfig::default()
        },
        Arc::new(SmtpConnector::new(smtp)),
    ));

    Dispatcher::new(
        pool,
        dispatch,
        Sender::new("notifications@clinic.example").with_name("Clinic"),
    )
}

fn fast_retries(max_retries: u32) -> DispatchConfig {
    DispatchConfig {
        max_retries,
        base_delay_ms: 10,
        ..DispatchConfig::default()
    }
}

fn request() -> SendRequest {
    SendRequest::new("patient@example.com", "Lab results available")
        .with_text("Your results are ready.")
        .with_html("<p>Your results are ready.</p>")
}

#[tokio::test]
async fn test_sends_reuse_one_connection() {
    let server = MockSmtpServer::builder()
        .with_data_end_response(250, "2.0.0 OK: queued as 7F3A")
        .build()
        .await
        .unwrap();
    let dispatcher = dispatcher_for(&server, DispatchConfig::default());

    dispatcher.pool().verify().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let delivery = dispatcher.send(&request()).await.into_result().unwrap();
        assert_eq!(delivery.attempts, 1);
        assert_eq!(delivery.response, "250 2.0.0 OK: queued as 7F3A");
        ids.push(delivery.email_id);
    }

    // One for verify, one shared by all three sends
    assert_eq!(server.connection_count(), 2);

    let messages = server.messages().await;
    assert_eq!(messages.len(), 3);
    for (message, id) in messages.iter().zip(&ids) {
        assert!(message.contains(&format!("X-Email-ID: {id}\r\n")));
        assert!(message.contains("X-Mailer: Courier\r\n"));
        assert!(message.contains("multipart/alternative"));
    }

    dispatcher.pool().close().await;
    let quits = server
        .commands()
        .await
        .into_iter()
        .filter(|c| *c == SmtpCommand::Quit)
        .count();
    assert_eq!(quits, 2);

    server.shutdown();
}

#[tokio::test]
async fn test_connection_dropped_while_parked_is_replaced() {
    // EHLO, MAIL, RCPT and DATA, then the relay hangs up
    let server = MockSmtpServer::builder()
        .with_network_error_after_commands(4)
        .build()
        .await
        .unwrap();
    let dispatcher = dispatcher_for(&server, fast_retries(0));

    for _ in 0..2 {
        let delivery = dispatcher.send(&request()).await.into_result().unwrap();
        assert_eq!(delivery.attempts, 1);
    }

    assert_eq!(server.connection_count(), 2);
    assert_eq!(server.messages().await.len(), 2);

    server.shutdown();
}

#[tokio::test]
async fn test_transient_rejection_exhausts_retries() {
    let server = MockSmtpServer::builder()
        .with_data_end_response(451, "4.3.0 Try again later")
        .build()
        .await
        .unwrap();
    let dispatcher = dispatcher_for(&server, fast_retries(2));

    let failure = dispatcher.send(&request()).await.into_result().unwrap_err();

    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.kind, FailureKind::Exhausted);
    assert_eq!(failure.code, Some(451));
    assert_eq!(server.messages().await.len(), 3);

    server.shutdown();
}

#[tokio::test]
async fn test_permanent_rejection_stops_immediately() {
    let server = MockSmtpServer::builder()
        .with_rejected_recipient("patient@example.com")
        .build()
        .await
        .unwrap();
    let dispatcher = dispatcher_for(&server, fast_retries(3));

    let failure = dispatcher.send(&request()).await.into_result().unwrap_err();

    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.code, Some(550));
    assert_eq!(server.connection_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_unreachable_relay_is_retried() {
    // Nothing listens on the port once this listener is dropped
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let dispatcher = dispatcher_on(port, fast_retries(1));

    let failure = dispatcher.send(&request()).await.into_result().unwrap_err();

    assert_eq!(failure.attempts, 2);
    assert_eq!(failure.kind, FailureKind::Exhausted);
    assert!(matches!(failure.error, TransportError::ConnectionRefused(_)));
}

#[tokio::test]
async fn test_hanging_relay_hits_attempt_deadline() {
    let server = MockSmtpServer::builder()
        .with_timeout_on_command(1)
        .build()
        .await
        .unwrap();
    let dispatcher = dispatcher_for(
        &server,
        DispatchConfig {
            max_retries: 0,
            attempt_timeout_secs: 1,
            ..DispatchConfig::default()
        },
    );

    let started = std::time::Instant::now();
    let failure = dispatcher.send(&request()).await.into_result().unwrap_err();

    assert_eq!(
        failure.error,
        TransportError::AttemptTimeout(Duration::from_secs(1))
    );
    assert!(started.elapsed() < Duration::from_secs(5));

    server.shutdown();
}
