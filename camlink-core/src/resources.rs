//! Owned runtime resources of an engine instance
//!
//! Timers and event subscriptions are tokio tasks. Each is owned by exactly one
//! engine instance and is stopped deterministically when that instance is torn
//! down, instead of being left to finish on its own.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

pub use tokio_util::sync::CancellationToken;

/// Resource an event subscription is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// The consumer's media sink
    Sink,
    /// A managed adaptive decode session
    Session,
    /// A negotiated peer session
    Peer,
}

/// Subscription table keyed by (resource, event name)
///
/// Every handler registered for an engine instance lives here, so teardown can
/// unsubscribe all of them in one pass.
#[derive(Default)]
pub struct Subscriptions {
    handlers: HashMap<(Resource, &'static str), JoinHandle<()>>,
}

impl Subscriptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler task; an existing handler for the same slot is
    /// unsubscribed first.
    pub fn insert(&mut self, resource: Resource, event: &'static str, handler: JoinHandle<()>) {
        if let Some(previous) = self.handlers.insert((resource, event), handler) {
            previous.abort();
        }
    }

    /// Spawn a handler that receives every event of `events` in order
    ///
    /// Lagged receivers skip the missed events and keep going; the handler
    /// ends when the sender side is dropped.
    pub fn listen<E, F>(
        &mut self,
        resource: Resource,
        event: &'static str,
        mut events: broadcast::Receiver<E>,
        mut handler: F,
    ) where
        E: Clone + Send + 'static,
        F: FnMut(E) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ev) => handler(ev),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(?resource, event, skipped, "Event handler lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.insert(resource, event, task);
    }

    pub fn remove(&mut self, resource: Resource, event: &'static str) -> bool {
        self.handlers
            .remove(&(resource, event))
            .map(|handler| handler.abort())
            .is_some()
    }

    /// Unsubscribe everything
    pub fn clear(&mut self) {
        for (_, handler) in self.handlers.drain() {
            handler.abort();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, resource: Resource, event: &'static str) -> bool {
        self.handlers.contains_key(&(resource, event))
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A cancellable timer task
///
/// Callbacks run synchronously on the timer task, so a callback that tears
/// down the owner of this timer (a retry re-entering its engine) finishes
/// before the abort takes effect.
pub struct Timer {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Timer {
    /// Run `callback` once after `delay`
    pub fn once<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                () = child.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if !child.is_cancelled() {
                        child.cancel();
                        callback();
                    }
                }
            }
        });
        Self { token, task }
    }

    /// Run `callback` every `period`, first after one full period
    pub fn repeating<F>(period: Duration, mut callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = child.cancelled() => break,
                    _ = ticker.tick() => callback(),
                }
            }
        });
        Self { token, task }
    }

    pub fn cancel(&self) {
        self.token.cancel();
        self.task.abort();
    }

    /// Whether the timer can still fire
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.token.is_cancelled() && !self.task.is_finished()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// An in-flight asynchronous operation that can be abandoned
///
/// The token is cancelled before the task is aborted, so code racing the
/// cancellation can tell an abandoned operation from a failed one.
pub struct Operation {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Operation {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            task: None,
        }
    }

    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn the operation body
    pub fn spawn<F>(&mut self, body: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.task.replace(tokio::spawn(body)) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Bookkeeping shared by both engine instance kinds
///
/// `generation` fences callbacks of superseded instances. An instance is
/// released once its protocol resources are gone; it may still hold a retry
/// timer until it is torn down completely.
pub struct InstanceCore {
    generation: u64,
    released: bool,
    retry: Option<Timer>,
    pub subscriptions: Subscriptions,
}

impl InstanceCore {
    #[must_use]
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            released: false,
            retry: None,
            subscriptions: Subscriptions::new(),
        }
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Still owns live protocol resources
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.released
    }

    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.retry.as_ref().is_some_and(Timer::is_pending)
    }

    pub fn set_retry(&mut self, timer: Timer) {
        if let Some(previous) = self.retry.replace(timer) {
            previous.cancel();
        }
    }

    pub fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry.take() {
            timer.cancel();
        }
    }

    /// Unsubscribe every handler and mark the instance released
    pub fn release(&mut self) {
        self.subscriptions.clear();
        self.released = true;
    }

    pub fn teardown(&mut self) {
        self.cancel_retry();
        self.release();
    }
}
