//! Subscription plan: the full subscribe / notify / unsubscribe round trip
//! over one connection.
//!
//! [`RawChannel`] adapts a [`Connection`] into the two-channel publisher
//! surface the rest of the crate consumes: parsed inbound messages on
//! `message`, the connection's terminal failure on `error`.
//! [`execute_subscription_plan`] drives one logical subscription over that
//! surface: it sends the subscribe request, waits for the server's
//! acknowledgement carrying the numeric subscription id, and returns a
//! publisher of that subscription's notifications. The wire unsubscribe is
//! sent only when the last subscriber leaves, and never after the
//! connection has already failed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{subscription_stream, ChannelMessage};
use crate::connection::Connection;
use crate::demux::{demultiplex, DemuxedPublisher};
use crate::envelope::{
    parse_server_message, subscribe_method, unsubscribe_method, Request, ServerMessage,
};
use crate::error::{LedgerLinkError, Result};
use crate::publisher::{Callback, DataPublisher, Subscribable, Unsubscribe};

/// Channel name for parsed inbound messages on a [`RawChannel`].
pub const MESSAGE_CHANNEL: &str = "message";
/// Channel name for a [`RawChannel`]'s terminal failure.
pub const ERROR_CHANNEL: &str = "error";
/// Channel name for a subscription's notifications.
pub const NOTIFICATION_CHANNEL: &str = "notification";

// ── RawChannel ──────────────────────────────────────────────────────────────

struct RawChannelInner {
    connection: Connection,
    publisher: DataPublisher<ChannelMessage<ServerMessage>>,
    next_id: AtomicU64,
    /// Live plan state per server subscription id. The server coalesces
    /// materially identical subscriptions onto one id, so the subscriber
    /// count must be shared across every plan that received that id.
    plans: Mutex<HashMap<u64, Weak<PlanShared>>>,
    pump: JoinHandle<()>,
}

impl Drop for RawChannelInner {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// A [`Connection`] exposed as a two-channel publisher of parsed messages.
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct RawChannel {
    inner: Arc<RawChannelInner>,
}

impl RawChannel {
    pub fn new(connection: Connection) -> Self {
        let publisher = DataPublisher::new();
        let messages = connection.messages();
        // Register before the pump task's first poll so no frame can slip
        // past in between.
        messages.register();
        let pump = tokio::spawn({
            let publisher = publisher.clone();
            async move {
                loop {
                    match messages.next().await {
                        Some(Ok(text)) => match parse_server_message(&text) {
                            Ok(ServerMessage::Other) => {
                                log::debug!("ignoring unrecognized message");
                            }
                            Ok(message) => {
                                publisher.publish(MESSAGE_CHANNEL, &ChannelMessage::Data(message));
                            }
                            Err(e) => log::warn!("dropping inbound payload: {e}"),
                        },
                        Some(Err(error)) => {
                            publisher.publish(ERROR_CHANNEL, &ChannelMessage::Failure(error));
                            return;
                        }
                        // Cancellation: consumers end via their own tokens.
                        None => return,
                    }
                }
            }
        });
        Self {
            inner: Arc::new(RawChannelInner {
                connection,
                publisher,
                next_id: AtomicU64::new(1),
                plans: Mutex::new(HashMap::new()),
                pump,
            }),
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Allocate the next request id. Ids are unique per channel and
    /// monotonically increasing.
    pub fn next_request_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request over the connection, honoring backpressure.
    pub async fn send(&self, request: &Request) -> Result<()> {
        self.inner.connection.send(request).await
    }
}

impl Subscribable<ChannelMessage<ServerMessage>> for RawChannel {
    fn on(
        &self,
        channel: &str,
        callback: Callback<ChannelMessage<ServerMessage>>,
        token: &CancellationToken,
    ) -> Unsubscribe {
        self.inner.publisher.on(channel, callback, token)
    }
}

// ── Message routing ─────────────────────────────────────────────────────────

/// Route a notification for `method` and `subscription_id` to the
/// `notification` channel; everything else is dropped.
fn route_notification(
    method: &str,
    subscription_id: u64,
    message: &ChannelMessage<ServerMessage>,
) -> Option<(String, ChannelMessage<Value>)> {
    match message {
        ChannelMessage::Data(ServerMessage::Notification {
            method: inbound,
            subscription,
            result,
        }) if inbound == method && *subscription == subscription_id => Some((
            NOTIFICATION_CHANNEL.to_string(),
            ChannelMessage::Data(result.clone()),
        )),
        _ => None,
    }
}

/// Route a terminal failure to the `error` channel.
fn route_error(message: &ChannelMessage<ServerMessage>) -> Option<(String, ChannelMessage<Value>)> {
    match message {
        ChannelMessage::Failure(error) => Some((
            ERROR_CHANNEL.to_string(),
            ChannelMessage::Failure(error.clone()),
        )),
        ChannelMessage::Data(_) => None,
    }
}

// ── NotificationSubscription ────────────────────────────────────────────────

struct PlanShared {
    raw: RawChannel,
    unsubscribe_method: String,
    subscription_id: u64,
    subscribers: Mutex<usize>,
    /// Set when the connection fails; the wire unsubscribe is pointless
    /// after that and must not be sent.
    dead: AtomicBool,
}

/// Drop one subscriber from the count; the last one out evicts the shared
/// state from the channel's registry and sends the wire unsubscribe, unless
/// the connection already failed.
fn plan_release(shared: &Arc<PlanShared>) {
    let last = {
        // Lock order: plans before subscribers, same as plan lookup.
        let mut plans = shared.raw.inner.plans.lock().unwrap();
        let mut subscribers = shared.subscribers.lock().unwrap();
        *subscribers -= 1;
        let last = *subscribers == 0;
        let evict = last
            && plans
                .get(&shared.subscription_id)
                .is_some_and(|existing| std::ptr::eq(existing.as_ptr(), Arc::as_ptr(shared)));
        if evict {
            plans.remove(&shared.subscription_id);
        }
        last
    };
    if !last || shared.dead.load(Ordering::SeqCst) {
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let request = Request::new(
            shared.raw.next_request_id(),
            shared.unsubscribe_method.clone(),
            Value::Array(vec![Value::from(shared.subscription_id)]),
        );
        log::debug!(
            "last subscriber left, unsubscribing id {}",
            shared.subscription_id
        );
        if let Err(e) = shared.raw.send(&request).await {
            log::debug!("unsubscribe not sent: {e}");
        }
    });
}

/// One active server-side subscription, exposed as a publisher with a
/// `notification` channel and an `error` channel.
///
/// Subscribers are ref-counted across both channels; when the last one
/// leaves, the wire unsubscribe is sent. Keep this value alive for as long
/// as any subscriber is registered.
pub struct NotificationSubscription {
    shared: Arc<PlanShared>,
    notifications: DemuxedPublisher<ChannelMessage<ServerMessage>, ChannelMessage<Value>>,
    errors: DemuxedPublisher<ChannelMessage<ServerMessage>, ChannelMessage<Value>>,
    error_watch: Unsubscribe,
}

impl NotificationSubscription {
    /// The numeric id the server assigned to this subscription.
    pub fn subscription_id(&self) -> u64 {
        self.shared.subscription_id
    }
}

impl Drop for NotificationSubscription {
    fn drop(&mut self) {
        self.error_watch.unsubscribe();
    }
}

impl Subscribable<ChannelMessage<Value>> for NotificationSubscription {
    fn on(
        &self,
        channel: &str,
        callback: Callback<ChannelMessage<Value>>,
        token: &CancellationToken,
    ) -> Unsubscribe {
        let target = match channel {
            NOTIFICATION_CHANNEL => &self.notifications,
            ERROR_CHANNEL => &self.errors,
            other => {
                log::warn!("no such subscription channel `{other}`");
                return Unsubscribe::noop();
            }
        };
        if token.is_cancelled() {
            return Unsubscribe::noop();
        }
        *self.shared.subscribers.lock().unwrap() += 1;
        let hook: Box<dyn FnOnce() + Send> = {
            let shared = Arc::clone(&self.shared);
            Box::new(move || plan_release(&shared))
        };
        target.on_with_hook(channel, callback, token, Some(hook))
    }
}

// ── Plan execution ──────────────────────────────────────────────────────────

/// Subscribe to `notifications_method` (for example `slotNotifications`)
/// with `params` over `channel`.
///
/// Sends the derived subscribe request, then waits for the server's reply
/// carrying the numeric subscription id, racing connection failure and
/// `token`. An error reply surfaces as a `Subscription` error; cancellation
/// surfaces as `Cancelled`.
pub async fn execute_subscription_plan(
    channel: &RawChannel,
    notifications_method: &str,
    params: Value,
    token: &CancellationToken,
) -> Result<NotificationSubscription> {
    let subscribe = subscribe_method(notifications_method)?;
    let unsubscribe = unsubscribe_method(notifications_method)?;
    if token.is_cancelled() {
        return Err(LedgerLinkError::Cancelled);
    }

    let request_id = channel.next_request_id();
    let request = Request::new(request_id, subscribe, params);

    // Listen before sending so a fast reply cannot be missed; the consumer
    // must be registered too, or a reply pumped between the send resolving
    // and the first poll would be dropped.
    let ack_token = token.child_token();
    let ack_stream = subscription_stream(channel, MESSAGE_CHANNEL, ERROR_CHANNEL, &ack_token);
    let replies = ack_stream.events();
    replies.register();

    channel.send(&request).await?;

    let subscription_id = loop {
        match replies.next().await {
            Some(Ok(ServerMessage::Reply { id, result })) if id == request_id => match result {
                Ok(value) => {
                    break value.as_u64().ok_or_else(|| {
                        LedgerLinkError::Serialization(format!(
                            "subscribe reply is not a numeric subscription id: {value}"
                        ))
                    })?;
                }
                Err(reply) => return Err(reply.into()),
            },
            // Replies to other requests and notifications pass by.
            Some(Ok(_)) => continue,
            Some(Err(error)) => return Err(error),
            None => return Err(LedgerLinkError::Cancelled),
        }
    };
    drop(ack_stream);
    log::debug!("subscribed: {notifications_method} id {subscription_id}");

    let method = notifications_method.to_string();
    let notifications = demultiplex(channel.clone(), MESSAGE_CHANNEL, move |message| {
        route_notification(&method, subscription_id, message)
    });
    let errors = demultiplex(channel.clone(), ERROR_CHANNEL, route_error);

    // Reuse the shared state when the server handed out an id it already
    // assigned to an earlier plan, so their subscriber counts merge and
    // only the very last subscriber across all of them unsubscribes.
    let shared = {
        let mut plans = channel.inner.plans.lock().unwrap();
        match plans.get(&subscription_id).and_then(Weak::upgrade) {
            Some(existing) => existing,
            None => {
                let fresh = Arc::new(PlanShared {
                    raw: channel.clone(),
                    unsubscribe_method: unsubscribe,
                    subscription_id,
                    subscribers: Mutex::new(0),
                    dead: AtomicBool::new(false),
                });
                plans.insert(subscription_id, Arc::downgrade(&fresh));
                fresh
            }
        }
    };
    // A connection failure erases the server-side id: no unsubscribe may be
    // sent for it afterwards.
    let error_watch = {
        let dead = Arc::clone(&shared);
        channel.on(
            ERROR_CHANNEL,
            Arc::new(move |_| dead.dead.store(true, Ordering::SeqCst)),
            token,
        )
    };

    Ok(NotificationSubscription {
        shared,
        notifications,
        errors,
        error_watch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(method: &str, subscription: u64) -> ChannelMessage<ServerMessage> {
        ChannelMessage::Data(ServerMessage::Notification {
            method: method.to_string(),
            subscription,
            result: json!({"slot": 1}),
        })
    }

    #[test]
    fn test_routes_matching_notification() {
        let routed = route_notification("slotNotifications", 4, &notification("slotNotifications", 4));
        let (channel, message) = routed.expect("should route");
        assert_eq!(channel, NOTIFICATION_CHANNEL);
        assert!(matches!(message, ChannelMessage::Data(_)));
    }

    #[test]
    fn test_drops_notification_for_other_subscription() {
        assert!(route_notification("slotNotifications", 4, &notification("slotNotifications", 5)).is_none());
        assert!(route_notification("slotNotifications", 4, &notification("rootNotifications", 4)).is_none());
    }

    #[test]
    fn test_drops_replies_on_notification_channel() {
        let reply = ChannelMessage::Data(ServerMessage::Reply {
            id: 1,
            result: Ok(json!(4)),
        });
        assert!(route_notification("slotNotifications", 4, &reply).is_none());
    }

    #[test]
    fn test_routes_failures_to_error_channel() {
        let failure = ChannelMessage::Failure(LedgerLinkError::ConnectionClosed {
            cause: "gone".to_string(),
        });
        let (channel, message) = route_error(&failure).expect("should route");
        assert_eq!(channel, ERROR_CHANNEL);
        assert!(matches!(message, ChannelMessage::Failure(_)));
        assert!(route_error(&notification("slotNotifications", 1)).is_none());
    }
}
