//! Connection lifecycle, fan-out, and backpressure against an in-process
//! WebSocket server.

mod common;

use std::time::Duration;

use ledger_link::{Connection, ConnectionState, LedgerLinkError};
use serde_json::json;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_rejects_http_url_before_any_io() {
    let token = CancellationToken::new();
    match Connection::open("http://localhost:8900", 0, &token).await {
        Err(LedgerLinkError::Configuration(message)) => {
            assert!(message.contains("http"), "error should name the scheme: {message}");
        }
        other => panic!("expected configuration error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_failure_maps_to_connect_failed() {
    // A listener that is immediately dropped: the port refuses connections.
    let (url, listener) = common::start_server().await;
    drop(listener);
    let token = CancellationToken::new();
    let result = Connection::open(&url, 0, &token).await;
    assert!(matches!(result, Err(LedgerLinkError::ConnectFailed { .. })));
}

#[tokio::test]
async fn test_fans_every_payload_out_to_every_consumer_in_order() {
    let (url, listener) = common::start_server().await;
    let token = CancellationToken::new();
    let accept = tokio::spawn(async move { common::accept(&listener).await });
    let connection = Connection::open(&url, 65_536, &token).await.unwrap();
    let mut socket = accept.await.unwrap();

    let collect = |connection: &Connection| {
        let consumer = connection.messages();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(consumer.next().await.unwrap().unwrap());
            }
            seen
        })
    };
    let first = collect(&connection);
    let second = collect(&connection);
    // Let both consumers register before anything is published.
    sleep(Duration::from_millis(50)).await;

    for payload in ["one", "two", "three"] {
        common::send_text(&mut socket, payload).await;
    }

    let expected = vec!["one".to_string(), "two".to_string(), "three".to_string()];
    assert_eq!(timeout(common::TEST_TIMEOUT, first).await.unwrap().unwrap(), expected);
    assert_eq!(timeout(common::TEST_TIMEOUT, second).await.unwrap().unwrap(), expected);
}

#[tokio::test]
async fn test_cancellation_closes_socket_and_ends_consumers_cleanly() {
    let (url, listener) = common::start_server().await;
    let token = CancellationToken::new();
    let accept = tokio::spawn(async move { common::accept(&listener).await });
    let connection = Connection::open(&url, 0, &token).await.unwrap();
    let mut socket = accept.await.unwrap();

    let consumer = connection.messages();
    let pending = tokio::spawn(async move { consumer.next().await });
    sleep(Duration::from_millis(50)).await;

    token.cancel();
    let ended = timeout(common::TEST_TIMEOUT, pending).await.unwrap().unwrap();
    assert_eq!(ended, None);
    common::expect_close(&mut socket).await;
    common::wait_until(|| connection.state() == ConnectionState::Closed).await;
}

#[tokio::test]
async fn test_server_close_surfaces_connection_closed() {
    let (url, listener) = common::start_server().await;
    let token = CancellationToken::new();
    let accept = tokio::spawn(async move { common::accept(&listener).await });
    let connection = Connection::open(&url, 0, &token).await.unwrap();
    let mut socket = accept.await.unwrap();

    let consumer = connection.messages();
    let pending = tokio::spawn(async move { consumer.next().await });
    sleep(Duration::from_millis(50)).await;

    socket.close(None).await.unwrap();
    let outcome = timeout(common::TEST_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        Some(Err(LedgerLinkError::ConnectionClosed { .. }))
    ));
}

#[tokio::test]
async fn test_queued_payloads_drain_before_the_connection_error() {
    let (url, listener) = common::start_server().await;
    let token = CancellationToken::new();
    let accept = tokio::spawn(async move { common::accept(&listener).await });
    let connection = Connection::open(&url, 0, &token).await.unwrap();
    let mut socket = accept.await.unwrap();

    // Register the consumer, then leave it idle while payloads queue up.
    let consumer = connection.messages();
    let registration = tokio::spawn(async move {
        let first = consumer.next().await;
        (consumer, first)
    });
    sleep(Duration::from_millis(50)).await;
    common::send_text(&mut socket, "first").await;
    let (consumer, first) = timeout(common::TEST_TIMEOUT, registration).await.unwrap().unwrap();
    assert_eq!(first, Some(Ok("first".to_string())));

    common::send_text(&mut socket, "second").await;
    sleep(Duration::from_millis(50)).await;
    socket.close(None).await.unwrap();
    common::wait_until(|| connection.state() == ConnectionState::Closed).await;

    assert_eq!(consumer.next().await, Some(Ok("second".to_string())));
    assert!(matches!(
        consumer.next().await,
        Some(Err(LedgerLinkError::ConnectionClosed { .. }))
    ));
}

#[tokio::test]
async fn test_zero_watermark_serializes_sends_and_delivers_each_frame() {
    let (url, listener) = common::start_server().await;
    let token = CancellationToken::new();
    let accept = tokio::spawn(async move { common::accept(&listener).await });
    let connection = Connection::open(&url, 0, &token).await.unwrap();
    let mut socket = accept.await.unwrap();

    let (p1, p2, p3) = (json!({"n": 1}), json!({"n": 2}), json!({"n": 3}));
    let (a, b, c) = tokio::join!(
        connection.send(&p1),
        connection.send(&p2),
        connection.send(&p3),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let frame: serde_json::Value =
            serde_json::from_str(&common::next_text(&mut socket).await).unwrap();
        seen.push(frame["n"].as_u64().unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_send_after_cancellation_fails_closed_before_buffered() {
    let (url, listener) = common::start_server().await;
    let token = CancellationToken::new();
    let accept = tokio::spawn(async move { common::accept(&listener).await });
    let connection = Connection::open(&url, 0, &token).await.unwrap();
    let _socket = accept.await.unwrap();

    token.cancel();
    common::wait_until(|| connection.state() == ConnectionState::Closed).await;
    assert_eq!(
        connection.send(&json!({"late": true})).await,
        Err(LedgerLinkError::ClosedBeforeBuffered)
    );
}
