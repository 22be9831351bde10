//! Push-to-pull bridge: a publisher's data and error channels turned into a
//! multi-consumer pull stream.
//!
//! The stream listens on two channels of one publisher. Data messages fan
//! out to every consumer; the first failure becomes the stream's terminal
//! error, surfaced to each consumer only after its already-queued data has
//! been handed over. Cancelling the token ends every consumer's sequence
//! cleanly instead.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::LedgerLinkError;
use crate::fanout::{FanOut, Subscriber};
use crate::publisher::{Callback, Subscribable, Unsubscribe};

/// What flows on a bridged channel.
#[derive(Debug, Clone)]
pub enum ChannelMessage<T> {
    Data(T),
    Failure(LedgerLinkError),
}

/// A pull stream over a publisher's data and error channels.
///
/// Dropping the stream removes its channel registrations; consumers created
/// earlier then end cleanly once their queues drain.
pub struct ChannelStream<T> {
    fanout: FanOut<T>,
    data_sub: Unsubscribe,
    error_sub: Unsubscribe,
    watcher: Option<JoinHandle<()>>,
}

impl<T> ChannelStream<T> {
    /// A new independent consumer. Registered lazily on its first poll; it
    /// never sees messages delivered before then.
    pub fn events(&self) -> Subscriber<T> {
        self.fanout.subscriber()
    }
}

impl<T> Drop for ChannelStream<T> {
    fn drop(&mut self) {
        self.data_sub.unsubscribe();
        self.error_sub.unsubscribe();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.fanout.cancel();
    }
}

/// Bridge `publisher`'s `data_channel` and `error_channel` into a pull
/// stream bounded by `token`.
///
/// A token that is already cancelled produces a stream whose consumers end
/// on their first poll.
pub fn subscription_stream<T>(
    publisher: &impl Subscribable<ChannelMessage<T>>,
    data_channel: &str,
    error_channel: &str,
    token: &CancellationToken,
) -> ChannelStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    let fanout: FanOut<T> = FanOut::new();
    if token.is_cancelled() {
        fanout.cancel();
        return ChannelStream {
            fanout,
            data_sub: Unsubscribe::noop(),
            error_sub: Unsubscribe::noop(),
            watcher: None,
        };
    }
    // The same handler serves both channels: the channel name routes the
    // message, the variant decides its fate.
    let on_message: Callback<ChannelMessage<T>> = {
        let fanout = fanout.clone();
        std::sync::Arc::new(move |message: &ChannelMessage<T>| match message {
            ChannelMessage::Data(data) => fanout.publish(data),
            ChannelMessage::Failure(error) => fanout.fail(error.clone()),
        })
    };
    let data_sub = publisher.on(data_channel, on_message.clone(), token);
    let error_sub = publisher.on(error_channel, on_message, token);
    let watcher = tokio::spawn({
        let fanout = fanout.clone();
        let token = token.clone();
        async move {
            token.cancelled().await;
            fanout.cancel();
        }
    });
    ChannelStream {
        fanout,
        data_sub,
        error_sub,
        watcher: Some(watcher),
    }
}
