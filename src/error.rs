//! Error types for the subscription core.

use thiserror::Error;

/// Errors produced by the connection, bridge, and subscription-plan layers.
/// Variants are `Clone` so the captured first error can be redelivered to
/// every consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerLinkError {
    /// The socket never reached the open state: it errored, or the
    /// cancellation token fired, before the handshake completed.
    #[error("failed to connect: {reason}")]
    ConnectFailed { reason: String },

    /// The socket closed or errored after it had opened.
    #[error("connection closed: {cause}")]
    ConnectionClosed { cause: String },

    /// A send was abandoned because the connection closed or was aborted
    /// while the message was still queued behind the backpressure watermark.
    #[error("connection closed before message could be buffered")]
    ClosedBeforeBuffered,

    /// Internal bug class: double poll, missing per-consumer state.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Bad input before any I/O happened (URL scheme, channel naming).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A payload could not be serialized, or a server message could not be
    /// interpreted.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The server rejected a subscribe request with a JSON-RPC error reply.
    #[error("subscription rejected by server: {message} (code {code})")]
    Subscription { code: i64, message: String },

    /// A request-level operation was cancelled before it completed.
    /// Sequence consumers never observe this: for them cancellation is
    /// always translated into a clean end of sequence.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for subscription-core operations.
pub type Result<T> = std::result::Result<T, LedgerLinkError>;
