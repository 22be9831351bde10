#![allow(dead_code)]
//! In-process WebSocket server helpers for integration tests.
//!
//! Each test binds its own loopback listener, so tests run in parallel
//! without an external server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub type ServerSocket = WebSocketStream<TcpStream>;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a loopback listener; returns its `ws://` URL and the listener.
pub async fn start_server() -> (String, TcpListener) {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let url = format!("ws://{}", listener.local_addr().expect("local addr"));
    (url, listener)
}

/// Accept one connection and complete the WebSocket handshake.
pub async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .expect("timed out waiting for a connection")
        .expect("accept");
    accept_async(stream).await.expect("server handshake")
}

/// Read frames until a text frame arrives.
pub async fn next_text(socket: &mut ServerSocket) -> String {
    let read = async {
        while let Some(frame) = socket.next().await {
            match frame.expect("server read") {
                Message::Text(text) => return text.to_string(),
                Message::Close(_) => panic!("socket closed while waiting for text"),
                _ => continue,
            }
        }
        panic!("stream ended while waiting for text");
    };
    timeout(TEST_TIMEOUT, read)
        .await
        .expect("timed out waiting for text")
}

pub async fn send_text(socket: &mut ServerSocket, text: &str) {
    socket
        .send(Message::Text(text.to_string().into()))
        .await
        .expect("server send");
}

/// Read frames until the peer's close frame (or the end of the stream).
pub async fn expect_close(socket: &mut ServerSocket) {
    let read = async {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => return,
                _ => continue,
            }
        }
    };
    timeout(TEST_TIMEOUT, read)
        .await
        .expect("timed out waiting for close");
}

/// Poll `condition` until it holds or the test deadline passes.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}
