//! Demultiplexer: one upstream channel fanned out to many derived channels.
//!
//! The upstream subscription is lazy and ref-counted: it is taken out when
//! the first downstream subscriber arrives and released when the last one
//! leaves. A subscriber arriving after the count dropped to zero triggers a
//! fresh upstream subscription.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::publisher::{Callback, DataPublisher, Subscribable, Unsubscribe};

/// Maps an upstream message to `(destination_channel, message)`, or `None`
/// to drop it.
pub type Transform<T, U> = Arc<dyn Fn(&T) -> Option<(String, U)> + Send + Sync>;

struct UpstreamLink {
    subscription: Unsubscribe,
    token: CancellationToken,
}

struct DemuxState {
    subscribers: usize,
    upstream: Option<UpstreamLink>,
}

/// A publisher over channels derived from a single upstream channel.
pub struct DemuxedPublisher<T, U> {
    upstream: Arc<dyn Subscribable<T> + Send + Sync>,
    source_channel: String,
    transform: Transform<T, U>,
    inner: DataPublisher<U>,
    state: Arc<Mutex<DemuxState>>,
}

impl<T, U> Clone for DemuxedPublisher<T, U> {
    fn clone(&self) -> Self {
        Self {
            upstream: Arc::clone(&self.upstream),
            source_channel: self.source_channel.clone(),
            transform: Arc::clone(&self.transform),
            inner: self.inner.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// Build a demultiplexed publisher over `upstream`'s `source_channel`.
pub fn demultiplex<T, U>(
    upstream: impl Subscribable<T> + Send + Sync + 'static,
    source_channel: &str,
    transform: impl Fn(&T) -> Option<(String, U)> + Send + Sync + 'static,
) -> DemuxedPublisher<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    DemuxedPublisher {
        upstream: Arc::new(upstream),
        source_channel: source_channel.to_string(),
        transform: Arc::new(transform),
        inner: DataPublisher::new(),
        state: Arc::new(Mutex::new(DemuxState {
            subscribers: 0,
            upstream: None,
        })),
    }
}

impl<T, U> DemuxedPublisher<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn upstream_callback(&self) -> Callback<T> {
        let inner = self.inner.clone();
        let transform = Arc::clone(&self.transform);
        Arc::new(move |message: &T| {
            if let Some((channel, out)) = transform(message) {
                inner.publish(&channel, &out);
            }
        })
    }
}

/// Drop one downstream registration from the ref count; on the last one,
/// release the upstream subscription.
fn release(state: &Arc<Mutex<DemuxState>>) {
    let link = {
        let mut state = state.lock().unwrap();
        state.subscribers -= 1;
        if state.subscribers == 0 {
            state.upstream.take()
        } else {
            None
        }
    };
    if let Some(link) = link {
        link.subscription.unsubscribe();
        link.token.cancel();
    }
}

impl<T, U> DemuxedPublisher<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    /// Like [`Subscribable::on`] but with an extra removal hook, fired
    /// exactly once when the registration is removed by either path, after
    /// the ref-count release.
    pub(crate) fn on_with_hook(
        &self,
        channel: &str,
        callback: Callback<U>,
        token: &CancellationToken,
        hook: Option<Box<dyn FnOnce() + Send>>,
    ) -> Unsubscribe {
        if token.is_cancelled() {
            // The registration is removed before it ever took effect; the
            // caller's hook still fires so its accounting stays balanced.
            if let Some(hook) = hook {
                hook();
            }
            return Unsubscribe::noop();
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.subscribers == 0 {
                let upstream_token = CancellationToken::new();
                let subscription = self.upstream.on(
                    &self.source_channel,
                    self.upstream_callback(),
                    &upstream_token,
                );
                state.upstream = Some(UpstreamLink {
                    subscription,
                    token: upstream_token,
                });
            }
            state.subscribers += 1;
        }
        // The combined hook fires exactly once per registration, no matter
        // which path removed it, so each registration contributes one
        // decrement.
        let combined: Box<dyn FnOnce() + Send> = {
            let state = Arc::clone(&self.state);
            Box::new(move || {
                release(&state);
                if let Some(hook) = hook {
                    hook();
                }
            })
        };
        self.inner
            .subscribe_with_hook(channel, callback, token, Some(combined))
    }
}

impl<T, U> Subscribable<U> for DemuxedPublisher<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on(&self, channel: &str, callback: Callback<U>, token: &CancellationToken) -> Unsubscribe {
        self.on_with_hook(channel, callback, token, None)
    }
}
