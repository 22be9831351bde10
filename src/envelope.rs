//! JSON-RPC 2.0 wire envelope for the subscription protocol.
//!
//! Outbound traffic is a plain request envelope. Inbound traffic is either
//! a reply to one of our requests (keyed by `id`) or a server-push
//! notification (keyed by `method` plus a numeric subscription id in its
//! params).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LedgerLinkError, Result};

const JSONRPC_VERSION: &str = "2.0";

const NOTIFICATIONS_SUFFIX: &str = "Notifications";

/// Derive the subscribe method name from a notifications method name:
/// `accountNotifications` becomes `accountSubscribe`.
pub fn subscribe_method(notifications_method: &str) -> Result<String> {
    replace_suffix(notifications_method, "Subscribe")
}

/// Derive the unsubscribe method name from a notifications method name:
/// `accountNotifications` becomes `accountUnsubscribe`.
pub fn unsubscribe_method(notifications_method: &str) -> Result<String> {
    replace_suffix(notifications_method, "Unsubscribe")
}

fn replace_suffix(notifications_method: &str, replacement: &str) -> Result<String> {
    match notifications_method.strip_suffix(NOTIFICATIONS_SUFFIX) {
        Some(stem) if !stem.is_empty() => Ok(format!("{stem}{replacement}")),
        _ => Err(LedgerLinkError::Configuration(format!(
            "`{notifications_method}` is not a notifications method name; \
             expected a `*{NOTIFICATIONS_SUFFIX}` name"
        ))),
    }
}

/// An outbound JSON-RPC request.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: String, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// A JSON-RPC error object from a reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorReply {
    pub code: i64,
    pub message: String,
}

impl From<ErrorReply> for LedgerLinkError {
    fn from(reply: ErrorReply) -> Self {
        LedgerLinkError::Subscription {
            code: reply.code,
            message: reply.message,
        }
    }
}

/// A classified inbound message.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// A reply to a request we sent.
    Reply {
        id: u64,
        result: std::result::Result<Value, ErrorReply>,
    },
    /// A server-push notification for one subscription.
    Notification {
        method: String,
        subscription: u64,
        result: Value,
    },
    /// Valid JSON that is neither of the above.
    Other,
}

#[derive(Deserialize)]
struct RawNotificationParams {
    subscription: u64,
    result: Value,
}

#[derive(Deserialize)]
struct RawEnvelope {
    id: Option<u64>,
    method: Option<String>,
    result: Option<Value>,
    error: Option<ErrorReply>,
    params: Option<RawNotificationParams>,
}

/// Classify one inbound payload.
///
/// Fails only when the payload is not valid JSON; a well-formed message of
/// an unknown shape classifies as [`ServerMessage::Other`].
pub fn parse_server_message(text: &str) -> Result<ServerMessage> {
    let raw: RawEnvelope = serde_json::from_str(text)
        .map_err(|e| LedgerLinkError::Serialization(format!("malformed server message: {e}")))?;
    if let Some(id) = raw.id {
        if let Some(error) = raw.error {
            return Ok(ServerMessage::Reply {
                id,
                result: Err(error),
            });
        }
        if let Some(result) = raw.result {
            return Ok(ServerMessage::Reply {
                id,
                result: Ok(result),
            });
        }
        return Ok(ServerMessage::Other);
    }
    if let (Some(method), Some(params)) = (raw.method, raw.params) {
        return Ok(ServerMessage::Notification {
            method,
            subscription: params.subscription,
            result: params.result,
        });
    }
    Ok(ServerMessage::Other)
}
