//! Named-channel observer registry.
//!
//! [`DataPublisher`] is the minimal publish/subscribe foundation the rest of
//! the crate is built on: callbacks are registered per channel name and
//! removed either by calling the returned [`Unsubscribe`] or by the
//! subscriber's [`CancellationToken`] firing, whichever happens first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A subscriber callback. Invoked once per message published on the channel
/// it was registered for, in publish order.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// The collaborator contract required of any channel publisher: register a
/// callback for a named channel, bounded by a cancellation token, and get
/// back a handle that removes it.
///
/// Implemented by [`DataPublisher`] and by the demultiplexed publisher
/// returned from [`demultiplex`](crate::demux::demultiplex).
pub trait Subscribable<T> {
    /// Register `callback` for `channel`. The registration is removed when
    /// the returned [`Unsubscribe`] is called or when `token` is cancelled;
    /// either way it is removed exactly once.
    fn on(&self, channel: &str, callback: Callback<T>, token: &CancellationToken) -> Unsubscribe;
}

/// Handle that removes one channel registration.
///
/// Calling [`unsubscribe`](Unsubscribe::unsubscribe) more than once is a
/// no-op after the first call, no matter how many clones exist.
#[derive(Clone)]
pub struct Unsubscribe {
    inner: Arc<UnsubscribeShared>,
}

struct UnsubscribeShared {
    called: AtomicBool,
    action: Box<dyn Fn() + Send + Sync>,
}

impl Unsubscribe {
    pub(crate) fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(UnsubscribeShared {
                called: AtomicBool::new(false),
                action: Box::new(action),
            }),
        }
    }

    /// A handle that does nothing, for registrations that never took effect.
    pub(crate) fn noop() -> Self {
        Self::new(|| {})
    }

    /// Remove the registration. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.inner.called.swap(true, Ordering::SeqCst) {
            (self.inner.action)();
        }
    }
}

struct SubscriberRecord<T> {
    id: u64,
    callback: Callback<T>,
    /// Task that waits on the subscriber's cancellation token and removes
    /// the record when it fires. Aborted when the record is removed first.
    watcher: JoinHandle<()>,
    /// Invoked exactly once when the record is removed, whichever path
    /// removed it. Used by the demultiplexer for ref-count bookkeeping.
    on_removed: Option<Box<dyn FnOnce() + Send>>,
}

struct Registry<T> {
    next_id: u64,
    channels: HashMap<String, Vec<SubscriberRecord<T>>>,
}

impl<T> Drop for Registry<T> {
    fn drop(&mut self) {
        for records in self.channels.values() {
            for record in records {
                record.watcher.abort();
            }
        }
    }
}

/// A multi-channel observer registry. Cheap to clone; clones share the same
/// registry.
pub struct DataPublisher<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for DataPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for DataPublisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DataPublisher<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                channels: HashMap::new(),
            })),
        }
    }

    /// Dispatch `message` to every current subscriber of `channel`, in
    /// registration order. Callbacks run outside the registry lock, so a
    /// callback may itself subscribe or unsubscribe.
    pub fn publish(&self, channel: &str, message: &T) {
        let callbacks: Vec<Callback<T>> = {
            let registry = self.registry.lock().unwrap();
            match registry.channels.get(channel) {
                Some(records) => records.iter().map(|r| Arc::clone(&r.callback)).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(message);
        }
    }

    /// Like [`Subscribable::on`] but with a removal hook, fired exactly once
    /// when the registration is removed by either path.
    pub(crate) fn subscribe_with_hook(
        &self,
        channel: &str,
        callback: Callback<T>,
        token: &CancellationToken,
        on_removed: Option<Box<dyn FnOnce() + Send>>,
    ) -> Unsubscribe
    where
        T: Send + Sync + 'static,
    {
        if token.is_cancelled() {
            if let Some(hook) = on_removed {
                hook();
            }
            return Unsubscribe::noop();
        }
        let channel = channel.to_string();
        let weak = Arc::downgrade(&self.registry);
        let mut registry = self.registry.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        let watcher = tokio::spawn({
            let weak = Weak::clone(&weak);
            let channel = channel.clone();
            let token = token.clone();
            async move {
                token.cancelled().await;
                remove_record(&weak, &channel, id);
            }
        });
        registry
            .channels
            .entry(channel.clone())
            .or_default()
            .push(SubscriberRecord {
                id,
                callback,
                watcher,
                on_removed,
            });
        drop(registry);
        Unsubscribe::new(move || remove_record(&weak, &channel, id))
    }
}

/// Remove one record, abort its token watcher, and run its removal hook.
/// No-op when the record is already gone or the registry was dropped.
fn remove_record<T>(registry: &Weak<Mutex<Registry<T>>>, channel: &str, id: u64) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let removed = {
        let mut registry = registry.lock().unwrap();
        let Some(records) = registry.channels.get_mut(channel) else {
            return;
        };
        let Some(pos) = records.iter().position(|r| r.id == id) else {
            return;
        };
        let record = records.remove(pos);
        if records.is_empty() {
            registry.channels.remove(channel);
        }
        record
    };
    removed.watcher.abort();
    if let Some(hook) = removed.on_removed {
        hook();
    }
}

impl<T: Send + Sync + 'static> Subscribable<T> for DataPublisher<T> {
    fn on(&self, channel: &str, callback: Callback<T>, token: &CancellationToken) -> Unsubscribe {
        self.subscribe_with_hook(channel, callback, token, None)
    }
}
