//! Real-time subscription core for a blockchain RPC client.
//!
//! One WebSocket connection multiplexes every logical subscription. Inbound
//! messages are demultiplexed into independent, pull-based async sequences
//! with backpressure-aware sends, strict one-poll-at-a-time discipline,
//! first-error-wins delivery, and race-free cancellation.
//!
//! # Layers
//!
//! - [`connection`]: socket open and close, backpressured send, and a
//!   shared fan-out of inbound payloads.
//! - [`publisher`] / [`demux`]: named-channel callback registry and the
//!   lazy, ref-counted channel demultiplexer.
//! - [`bridge`] / [`fanout`]: push callbacks turned into multi-consumer
//!   pull sequences.
//! - [`interruptible`]: wraps a pull sequence so it can be terminated out
//!   from under a pending poll.
//! - [`plan`]: the subscribe / notify / unsubscribe round trip, JSON-RPC
//!   framed via [`envelope`].
//!
//! # Example
//!
//! ```rust,no_run
//! use ledger_link::{
//!     execute_subscription_plan, subscription_stream, Connection, RawChannel,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let token = CancellationToken::new();
//! let connection = Connection::open("ws://localhost:8900", 65_536, &token).await?;
//! let channel = RawChannel::new(connection);
//! let subscription = execute_subscription_plan(
//!     &channel,
//!     "slotNotifications",
//!     serde_json::json!([]),
//!     &token,
//! )
//! .await?;
//! let stream = subscription_stream(&subscription, "notification", "error", &token);
//! let events = stream.events();
//! while let Some(notification) = events.next().await {
//!     println!("slot: {:?}", notification?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod connection;
pub mod demux;
pub mod envelope;
pub mod error;
pub mod fanout;
pub mod interruptible;
pub mod plan;
pub mod publisher;

pub use bridge::{subscription_stream, ChannelMessage, ChannelStream};
pub use connection::{validate_url, Connection, ConnectionState};
pub use demux::{demultiplex, DemuxedPublisher};
pub use envelope::{Request, ServerMessage};
pub use error::{LedgerLinkError, Result};
pub use fanout::{FanOut, Outcome, Subscriber};
pub use interruptible::{Interruptible, Raise, Sequence, Step};
pub use plan::{execute_subscription_plan, NotificationSubscription, RawChannel};
pub use publisher::{Callback, DataPublisher, Subscribable, Unsubscribe};
