//! Interruptible wrapper over a pull sequence.
//!
//! The wrapper forwards polls to an inner sequence until it is terminated:
//! by the inner sequence finishing, by the inner sequence failing, or by an
//! explicit [`finish`](Interruptible::finish). Termination is one-way,
//! idempotent, and never waits on the inner sequence: a pending inner poll
//! is abandoned and the inner's synchronous interrupt hook fires.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::error::{LedgerLinkError, Result};

/// One poll's outcome: an item, or completion with an optional final value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T, R> {
    Item(T),
    Done(Option<R>),
}

/// Synchronous forced-termination hook captured from a sequence.
pub type InterruptHandle = Arc<dyn Fn() + Send + Sync>;

/// A pull sequence that can be wrapped by [`Interruptible`].
#[allow(async_fn_in_trait)]
pub trait Sequence {
    type Item;
    type Terminal: Clone;

    /// Produce the next step. May pend indefinitely.
    async fn advance(&mut self) -> Result<Step<Self::Item, Self::Terminal>>;

    /// Hook fired synchronously when the wrapper is force-terminated.
    /// The default does nothing.
    fn interrupt_handle(&self) -> InterruptHandle {
        Arc::new(|| {})
    }
}

/// Optional capability: a sequence that accepts an injected error.
#[allow(async_fn_in_trait)]
pub trait Raise: Sequence {
    async fn raise(
        &mut self,
        error: LedgerLinkError,
    ) -> Result<Step<Self::Item, Self::Terminal>>;
}

enum Termination<R> {
    Active,
    Terminated(Option<R>),
}

/// Wraps a [`Sequence`] so it can be terminated out from under a pending
/// poll. Once terminated, every call returns a fresh clone of the terminal
/// step and the inner sequence is never touched again.
pub struct Interruptible<I: Sequence> {
    inner: Mutex<I>,
    interrupt: InterruptHandle,
    termination: watch::Sender<Termination<I::Terminal>>,
}

impl<I: Sequence> Interruptible<I> {
    pub fn new(inner: I) -> Self {
        let interrupt = inner.interrupt_handle();
        let (termination, _rx) = watch::channel(Termination::Active);
        Self {
            inner: Mutex::new(inner),
            interrupt,
            termination,
        }
    }

    fn terminal(&self) -> Option<Option<I::Terminal>> {
        match &*self.termination.borrow() {
            Termination::Active => None,
            Termination::Terminated(value) => Some(value.clone()),
        }
    }

    /// Flip to terminated, once. Returns whether this call did the flip.
    fn terminate(&self, value: Option<I::Terminal>) -> bool {
        let flipped = self.termination.send_if_modified(|state| {
            if matches!(state, Termination::Active) {
                *state = Termination::Terminated(value.clone());
                true
            } else {
                false
            }
        });
        if flipped {
            (self.interrupt)();
        }
        flipped
    }

    /// Force termination with `value`. Idempotent: the first call wins and
    /// later calls leave the terminal value unchanged. Pending polls resolve
    /// with the terminal step immediately; the inner sequence's own wind-down
    /// is never awaited.
    pub fn finish(&self, value: Option<I::Terminal>) -> Step<I::Item, I::Terminal> {
        self.terminate(value);
        // Not necessarily the value passed in: an earlier termination wins.
        Step::Done(self.terminal().unwrap_or(None))
    }

    /// Poll the inner sequence, racing it against termination.
    pub async fn advance(&self) -> Result<Step<I::Item, I::Terminal>> {
        if let Some(value) = self.terminal() {
            return Ok(Step::Done(value));
        }
        let mut termination = self.termination.subscribe();
        let terminated =
            |state: &Termination<I::Terminal>| matches!(state, Termination::Terminated(_));
        // Waiting for the inner lock also races termination, so a poll
        // queued behind a slow one resolves as soon as `finish` lands.
        let mut inner = tokio::select! {
            biased;
            _ = termination.wait_for(terminated) => {
                return Ok(Step::Done(self.terminal().unwrap_or(None)));
            }
            guard = self.inner.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = termination.wait_for(terminated) => {
                drop(inner);
                Ok(Step::Done(self.terminal().unwrap_or(None)))
            }
            step = inner.advance() => self.absorb(step),
        }
    }

    /// Fold one inner step into the wrapper's termination state.
    fn absorb(
        &self,
        step: Result<Step<I::Item, I::Terminal>>,
    ) -> Result<Step<I::Item, I::Terminal>> {
        match step {
            Ok(Step::Item(item)) => Ok(Step::Item(item)),
            Ok(Step::Done(value)) => {
                self.terminate(value.clone());
                Ok(Step::Done(value))
            }
            Err(error) => {
                // The failure terminates the sequence but is surfaced only
                // to the caller that observed it.
                self.terminate(None);
                Err(error)
            }
        }
    }
}

impl<I: Raise> Interruptible<I> {
    /// Inject `error` into the inner sequence, racing termination exactly
    /// like [`advance`](Interruptible::advance). Available only when the
    /// inner sequence supports it.
    pub async fn raise(&self, error: LedgerLinkError) -> Result<Step<I::Item, I::Terminal>> {
        if let Some(value) = self.terminal() {
            return Ok(Step::Done(value));
        }
        let mut termination = self.termination.subscribe();
        let terminated =
            |state: &Termination<I::Terminal>| matches!(state, Termination::Terminated(_));
        let mut inner = tokio::select! {
            biased;
            _ = termination.wait_for(terminated) => {
                return Ok(Step::Done(self.terminal().unwrap_or(None)));
            }
            guard = self.inner.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = termination.wait_for(terminated) => {
                drop(inner);
                Ok(Step::Done(self.terminal().unwrap_or(None)))
            }
            step = inner.raise(error) => self.absorb(step),
        }
    }
}
