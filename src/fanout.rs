//! Multi-consumer fan-out with strict poll discipline.
//!
//! A [`FanOut`] keeps one entry per consumer: either an idle queue of
//! pending items or a single in-flight poll slot. Publishing resolves every
//! waiting consumer immediately and enqueues for the rest. The first
//! terminal outcome (failure or cancellation) is captured and surfaces to
//! each consumer after its queue drains.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{LedgerLinkError, Result};

/// What a single poll resolves to.
#[derive(Debug)]
pub enum Outcome<T> {
    /// A delivered item.
    Item(T),
    /// The shared terminal error.
    Failure(LedgerLinkError),
    /// The shared source was cancelled; the sequence ends cleanly.
    Cancelled,
}

enum ConsumerState<T> {
    /// No poll outstanding; items delivered while idle queue here.
    Idle { queue: VecDeque<T> },
    /// Exactly one poll outstanding.
    Waiting { slot: oneshot::Sender<Outcome<T>> },
}

#[derive(Clone)]
enum Terminal {
    Failure(LedgerLinkError),
    Cancelled,
}

struct FanOutState<T> {
    consumers: HashMap<u64, ConsumerState<T>>,
    terminal: Option<Terminal>,
}

struct FanOutShared<T> {
    state: Mutex<FanOutState<T>>,
    next_key: AtomicU64,
}

/// Shared fan-out of one push source to any number of pull consumers.
/// Cheap to clone; clones publish into the same consumer map.
pub struct FanOut<T> {
    shared: Arc<FanOutShared<T>>,
}

impl<T> Clone for FanOut<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FanOut<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FanOutShared {
                state: Mutex::new(FanOutState {
                    consumers: HashMap::new(),
                    terminal: None,
                }),
                next_key: AtomicU64::new(0),
            }),
        }
    }

    /// A new independent consumer. Its map entry is created on first poll
    /// (or an explicit [`Subscriber::register`]); it never sees items
    /// published before then.
    pub fn subscriber(&self) -> Subscriber<T> {
        Subscriber {
            shared: Arc::clone(&self.shared),
            key: self.shared.next_key.fetch_add(1, Ordering::Relaxed),
            registered: AtomicBool::new(false),
        }
    }

    /// Deliver `item` to every registered consumer: waiting consumers are
    /// resolved immediately, idle consumers enqueue. Ignored once a terminal
    /// outcome is captured.
    pub fn publish(&self, item: &T)
    where
        T: Clone,
    {
        let mut state = self.shared.state.lock().unwrap();
        if state.terminal.is_some() {
            return;
        }
        for consumer in state.consumers.values_mut() {
            match consumer {
                ConsumerState::Idle { queue } => queue.push_back(item.clone()),
                ConsumerState::Waiting { .. } => {
                    let previous = std::mem::replace(
                        consumer,
                        ConsumerState::Idle {
                            queue: VecDeque::new(),
                        },
                    );
                    if let ConsumerState::Waiting { slot } = previous {
                        let _ = slot.send(Outcome::Item(item.clone()));
                    }
                }
            }
        }
    }

    /// Capture `error` as the terminal outcome. First terminal wins; later
    /// calls are ignored. Waiting consumers are resolved with the error now;
    /// idle queues are left intact so queued items drain first.
    pub fn fail(&self, error: LedgerLinkError) {
        self.terminate(Terminal::Failure(error));
    }

    /// Capture cancellation as the terminal outcome; consumers observe a
    /// clean end of sequence once their queues drain.
    pub fn cancel(&self) {
        self.terminate(Terminal::Cancelled);
    }

    fn terminate(&self, terminal: Terminal) {
        let mut state = self.shared.state.lock().unwrap();
        if state.terminal.is_some() {
            return;
        }
        state.terminal = Some(terminal.clone());
        for consumer in state.consumers.values_mut() {
            if let ConsumerState::Waiting { .. } = consumer {
                let previous = std::mem::replace(
                    consumer,
                    ConsumerState::Idle {
                        queue: VecDeque::new(),
                    },
                );
                if let ConsumerState::Waiting { slot } = previous {
                    let _ = slot.send(terminal_outcome(&terminal));
                }
            }
        }
    }
}

fn terminal_outcome<T>(terminal: &Terminal) -> Outcome<T> {
    match terminal {
        Terminal::Failure(error) => Outcome::Failure(error.clone()),
        Terminal::Cancelled => Outcome::Cancelled,
    }
}

/// One consumer's pull handle over a [`FanOut`].
pub struct Subscriber<T> {
    shared: Arc<FanOutShared<T>>,
    key: u64,
    registered: AtomicBool,
}

impl<T> Subscriber<T> {
    /// Create this consumer's map entry now. Items published between
    /// registration and the first poll are queued instead of missed.
    pub fn register(&self) {
        let mut state = self.shared.state.lock().unwrap();
        self.ensure_registered(&mut state);
    }

    fn ensure_registered(&self, state: &mut FanOutState<T>) {
        if !self.registered.swap(true, Ordering::SeqCst) {
            state.consumers.insert(
                self.key,
                ConsumerState::Idle {
                    queue: VecDeque::new(),
                },
            );
        }
    }

    /// Wait for the next item.
    ///
    /// Returns `None` on a clean end (cancellation), `Some(Err(_))` with the
    /// terminal error once the local queue has drained, and
    /// `Err(InvariantViolation)` when called while a previous `next` on this
    /// consumer is still pending.
    pub async fn next(&self) -> Option<Result<T>> {
        let receiver = {
            let mut state = self.shared.state.lock().unwrap();
            self.ensure_registered(&mut state);
            let terminal = state.terminal.clone();
            let Some(consumer) = state.consumers.get_mut(&self.key) else {
                return Some(Err(LedgerLinkError::InvariantViolation(
                    "consumer state missing at poll time".to_string(),
                )));
            };
            match consumer {
                ConsumerState::Idle { queue } => {
                    if let Some(item) = queue.pop_front() {
                        return Some(Ok(item));
                    }
                    if let Some(terminal) = &terminal {
                        return resolve(terminal_outcome(terminal));
                    }
                    let (tx, rx) = oneshot::channel();
                    *consumer = ConsumerState::Waiting { slot: tx };
                    rx
                }
                ConsumerState::Waiting { .. } => {
                    return Some(Err(LedgerLinkError::InvariantViolation(
                        "next polled while a previous poll is still pending".to_string(),
                    )));
                }
            }
        };
        match receiver.await {
            Ok(outcome) => resolve(outcome),
            // The fan-out itself was dropped; end the sequence.
            Err(_) => None,
        }
    }
}

fn resolve<T>(outcome: Outcome<T>) -> Option<Result<T>> {
    match outcome {
        Outcome::Item(item) => Some(Ok(item)),
        Outcome::Failure(error) => Some(Err(error)),
        Outcome::Cancelled => None,
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        if self.registered.load(Ordering::SeqCst) {
            let mut state = self.shared.state.lock().unwrap();
            state.consumers.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_waiting_consumer_resolved_on_publish() {
        let fanout = FanOut::new();
        let subscriber = fanout.subscriber();
        let pending = tokio::spawn(async move { subscriber.next().await });
        tokio::task::yield_now().await;
        fanout.publish(&7u32);
        let delivered = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert_eq!(delivered, Some(Ok(7)));
    }

    #[tokio::test]
    async fn test_idle_consumer_drains_queue_in_publish_order() {
        let fanout = FanOut::new();
        let subscriber = fanout.subscriber();
        // First poll registers the consumer; resolve it so later publishes
        // find it idle.
        let registration = tokio::spawn(async move {
            let first = subscriber.next().await;
            (subscriber, first)
        });
        tokio::task::yield_now().await;
        fanout.publish(&1u32);
        let (subscriber, first) = registration.await.unwrap();
        assert_eq!(first, Some(Ok(1)));
        fanout.publish(&2);
        fanout.publish(&3);
        assert_eq!(subscriber.next().await, Some(Ok(2)));
        assert_eq!(subscriber.next().await, Some(Ok(3)));
    }

    #[tokio::test]
    async fn test_registered_consumer_queues_items_published_before_first_poll() {
        let fanout = FanOut::new();
        let subscriber = fanout.subscriber();
        subscriber.register();
        fanout.publish(&5u32);
        fanout.publish(&6);
        assert_eq!(subscriber.next().await, Some(Ok(5)));
        assert_eq!(subscriber.next().await, Some(Ok(6)));
    }

    #[tokio::test]
    async fn test_no_replay_for_late_consumers() {
        let fanout = FanOut::new();
        let early = fanout.subscriber();
        let pending = tokio::spawn(async move { early.next().await });
        tokio::task::yield_now().await;
        fanout.publish(&1u32);
        assert_eq!(pending.await.unwrap(), Some(Ok(1)));

        let late = fanout.subscriber();
        let late_pending = tokio::spawn(async move { late.next().await });
        tokio::task::yield_now().await;
        fanout.publish(&2);
        // The late consumer sees only what was published after its first poll.
        assert_eq!(late_pending.await.unwrap(), Some(Ok(2)));
    }

    #[tokio::test]
    async fn test_double_poll_is_an_invariant_violation() {
        let fanout = FanOut::new();
        let subscriber = Arc::new(fanout.subscriber());
        let pending = tokio::spawn({
            let subscriber = Arc::clone(&subscriber);
            async move { subscriber.next().await }
        });
        tokio::task::yield_now().await;
        match subscriber.next().await {
            Some(Err(LedgerLinkError::InvariantViolation(_))) => {}
            other => panic!("expected invariant violation, got {other:?}"),
        }
        // The original poll is unaffected.
        fanout.publish(&9u32);
        assert_eq!(pending.await.unwrap(), Some(Ok(9)));
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let fanout: FanOut<u32> = FanOut::new();
        let subscriber = fanout.subscriber();
        let pending = tokio::spawn(async move { subscriber.next().await });
        tokio::task::yield_now().await;
        fanout.fail(LedgerLinkError::ConnectionClosed {
            cause: "first".to_string(),
        });
        fanout.fail(LedgerLinkError::ConnectionClosed {
            cause: "second".to_string(),
        });
        assert_eq!(
            pending.await.unwrap(),
            Some(Err(LedgerLinkError::ConnectionClosed {
                cause: "first".to_string(),
            }))
        );
    }

    #[tokio::test]
    async fn test_queued_items_drain_before_error() {
        let fanout = FanOut::new();
        let subscriber = fanout.subscriber();
        let registration = tokio::spawn(async move {
            let first = subscriber.next().await;
            (subscriber, first)
        });
        tokio::task::yield_now().await;
        fanout.publish(&1u32);
        let (subscriber, first) = registration.await.unwrap();
        assert_eq!(first, Some(Ok(1)));
        fanout.publish(&2);
        fanout.fail(LedgerLinkError::ConnectionClosed {
            cause: "gone".to_string(),
        });
        assert_eq!(subscriber.next().await, Some(Ok(2)));
        assert_eq!(
            subscriber.next().await,
            Some(Err(LedgerLinkError::ConnectionClosed {
                cause: "gone".to_string(),
            }))
        );
        // The terminal error is redelivered on every later poll.
        assert_eq!(
            subscriber.next().await,
            Some(Err(LedgerLinkError::ConnectionClosed {
                cause: "gone".to_string(),
            }))
        );
    }

    #[tokio::test]
    async fn test_cancellation_ends_sequence_cleanly() {
        let fanout: FanOut<u32> = FanOut::new();
        let subscriber = fanout.subscriber();
        let pending = tokio::spawn(async move { subscriber.next().await });
        tokio::task::yield_now().await;
        fanout.cancel();
        assert_eq!(pending.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queued_items_drain_before_cancellation() {
        let fanout = FanOut::new();
        let subscriber = fanout.subscriber();
        let registration = tokio::spawn(async move {
            let first = subscriber.next().await;
            (subscriber, first)
        });
        tokio::task::yield_now().await;
        fanout.publish(&1u32);
        let (subscriber, first) = registration.await.unwrap();
        assert_eq!(first, Some(Ok(1)));
        fanout.publish(&2);
        fanout.cancel();
        assert_eq!(subscriber.next().await, Some(Ok(2)));
        assert_eq!(subscriber.next().await, None);
    }

    #[tokio::test]
    async fn test_cancellation_beats_later_error() {
        let fanout: FanOut<u32> = FanOut::new();
        let subscriber = fanout.subscriber();
        let pending = tokio::spawn(async move { subscriber.next().await });
        tokio::task::yield_now().await;
        fanout.cancel();
        fanout.fail(LedgerLinkError::ConnectionClosed {
            cause: "too late".to_string(),
        });
        assert_eq!(pending.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_each_consumer_gets_every_item() {
        let fanout = FanOut::new();
        let a = fanout.subscriber();
        let b = fanout.subscriber();
        let both = tokio::spawn(async move {
            let (x, y) = tokio::join!(a.next(), b.next());
            (x, y)
        });
        tokio::task::yield_now().await;
        fanout.publish(&42u32);
        let (x, y) = both.await.unwrap();
        assert_eq!(x, Some(Ok(42)));
        assert_eq!(y, Some(Ok(42)));
    }
}
