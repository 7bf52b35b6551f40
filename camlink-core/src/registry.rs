//! Connection Registry - single source of truth for open streams
//!
//! This module provides:
//! - Keyed storage of per-stream state plus the engine instance owning its resources
//! - Atomic state transitions (reducer step applied while the entry is held)
//! - Generation fencing for callbacks of superseded instances
//! - Full teardown before an entry leaves the registry
//! - Broadcast of every applied transition

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::adaptive::AdaptiveInstance;
use crate::error::{StreamError, StreamResult};
use crate::negotiated::NegotiatedInstance;
use crate::resources::InstanceCore;
use crate::state::{StatePatch, StreamState};
use crate::types::{Protocol, StreamKey};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A state transition applied to one stream
#[derive(Debug, Clone)]
pub struct StateChange {
    pub key: StreamKey,
    pub state: StreamState,
}

/// Protocol-specific resources owned by a registry entry
pub enum EngineInstance {
    Adaptive(AdaptiveInstance),
    Negotiated(NegotiatedInstance),
}

impl EngineInstance {
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::Adaptive(_) => Protocol::Adaptive,
            Self::Negotiated(_) => Protocol::Negotiated,
        }
    }

    pub(crate) const fn core(&self) -> &InstanceCore {
        match self {
            Self::Adaptive(instance) => &instance.core,
            Self::Negotiated(instance) => &instance.core,
        }
    }

    pub(crate) fn core_mut(&mut self) -> &mut InstanceCore {
        match self {
            Self::Adaptive(instance) => &mut instance.core,
            Self::Negotiated(instance) => &mut instance.core,
        }
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.core().generation()
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.core().is_active()
    }

    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.core().retry_pending()
    }

    /// Timers still able to fire: the retry timer and the stats sampler
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        let sampler = match self {
            Self::Adaptive(instance) => usize::from(instance.sampler_running()),
            Self::Negotiated(_) => 0,
        };
        sampler + usize::from(self.retry_pending())
    }

    pub(crate) fn adaptive_mut(&mut self) -> Option<&mut AdaptiveInstance> {
        match self {
            Self::Adaptive(instance) => Some(instance),
            Self::Negotiated(_) => None,
        }
    }

    pub(crate) fn negotiated_mut(&mut self) -> Option<&mut NegotiatedInstance> {
        match self {
            Self::Negotiated(instance) => Some(instance),
            Self::Adaptive(_) => None,
        }
    }

    /// Release protocol resources; a pending retry timer is kept
    pub(crate) fn release(&mut self) {
        match self {
            Self::Adaptive(instance) => instance.release(),
            Self::Negotiated(instance) => instance.release(),
        }
    }

    /// Release everything, including the retry timer. Idempotent.
    pub fn teardown(&mut self) {
        self.release();
        self.core_mut().cancel_retry();
    }
}

impl Drop for EngineInstance {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Registry entry: current state plus its owning instance
pub struct RegistryEntry {
    key: StreamKey,
    state: StreamState,
    pub(crate) engine: EngineInstance,
    changes: broadcast::Sender<StateChange>,
}

impl RegistryEntry {
    #[must_use]
    pub const fn state(&self) -> &StreamState {
        &self.state
    }

    #[must_use]
    pub const fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Apply one reducer step and announce the result if anything changed
    pub fn apply(&mut self, patch: &StatePatch) -> &StreamState {
        let next = self.state.apply(patch);
        if next != self.state {
            self.state = next;
            self.announce();
        }
        &self.state
    }

    fn announce(&self) {
        // No receivers is fine
        let _ = self.changes.send(StateChange {
            key: self.key.clone(),
            state: self.state.clone(),
        });
    }
}

struct RegistryInner {
    entries: DashMap<StreamKey, RegistryEntry>,
    changes: broadcast::Sender<StateChange>,
    next_generation: AtomicU64,
}

/// Keyed store of open streams
///
/// Cheap to clone; all clones share the same entries.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl StreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                entries: DashMap::new(),
                changes,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Allocate a generation number for a new engine instance
    #[must_use]
    pub fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or replace the entry for `key`
    ///
    /// A replaced entry is torn down before the new one becomes visible.
    pub fn upsert(&self, key: StreamKey, state: StreamState, engine: EngineInstance) -> StreamResult<()> {
        if state.protocol() != engine.protocol() {
            return Err(StreamError::ProtocolMismatch {
                key: key.to_string(),
                state: state.protocol(),
                engine: engine.protocol(),
            });
        }

        let generation = engine.generation();
        let entry = RegistryEntry {
            key: key.clone(),
            state,
            engine,
            changes: self.inner.changes.clone(),
        };

        match self.inner.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.get_mut();
                debug!(
                    stream_key = %previous.key,
                    old_generation = previous.engine.generation(),
                    new_generation = generation,
                    "Superseding stream instance"
                );
                previous.engine.teardown();
                // The old entry is dropped here; its teardown is already done
                occupied.insert(entry);
                occupied.get().announce();
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(entry);
                info!(stream_key = %entry.key, generation, "Stream registered");
                entry.announce();
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &StreamKey) -> Option<StreamState> {
        self.inner.entries.get(key).map(|entry| entry.state.clone())
    }

    #[must_use]
    pub fn contains(&self, key: &StreamKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Tear down and delete the entry for `key`; absent keys are a no-op
    pub fn remove(&self, key: &StreamKey) -> bool {
        let removed = self
            .inner
            .entries
            .remove_if_mut(key, |_, entry| {
                entry.engine.teardown();
                true
            })
            .is_some();

        if removed {
            info!(stream_key = %key, "Stream removed");
        }
        removed
    }

    /// Merge `patch` into the state for `key`; absent keys are a no-op
    pub fn replace(&self, key: &StreamKey, patch: &StatePatch) -> Option<StreamState> {
        self.modify(key, |entry| entry.apply(patch).clone())
    }

    /// Like [`replace`](Self::replace), but only while `generation` still owns the entry
    pub fn replace_if_current(&self, key: &StreamKey, generation: u64, patch: &StatePatch) -> Option<StreamState> {
        self.modify_current(key, generation, |entry| entry.apply(patch).clone())
    }

    /// Run `f` on the entry while holding it
    ///
    /// `f` must not call back into the registry.
    pub(crate) fn modify<R>(&self, key: &StreamKey, f: impl FnOnce(&mut RegistryEntry) -> R) -> Option<R> {
        let mut entry = self.inner.entries.get_mut(key)?;
        Some(f(&mut entry))
    }

    /// Run `f` only if the entry is still owned by `generation`
    pub(crate) fn modify_current<R>(
        &self,
        key: &StreamKey,
        generation: u64,
        f: impl FnOnce(&mut RegistryEntry) -> R,
    ) -> Option<R> {
        let mut entry = self.inner.entries.get_mut(key)?;
        if entry.engine.generation() != generation {
            debug!(
                stream_key = %key,
                stale = generation,
                current = entry.engine.generation(),
                "Dropping callback of superseded instance"
            );
            return None;
        }
        Some(f(&mut entry))
    }

    /// Run `f` only if `generation` owns the entry and has not been released
    pub(crate) fn modify_live<R>(
        &self,
        key: &StreamKey,
        generation: u64,
        f: impl FnOnce(&mut RegistryEntry) -> R,
    ) -> Option<R> {
        self.modify_current(key, generation, |entry| {
            entry.engine.is_active().then(|| f(entry))
        })
        .flatten()
    }

    /// Generation of the instance currently owning `key`
    #[must_use]
    pub fn generation(&self, key: &StreamKey) -> Option<u64> {
        self.inner.entries.get(key).map(|entry| entry.engine.generation())
    }

    /// Timers of `key` that can still fire
    #[must_use]
    pub fn pending_timers(&self, key: &StreamKey) -> usize {
        self.inner
            .entries
            .get(key)
            .map_or(0, |entry| entry.engine.pending_timers())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<StreamKey> {
        self.inner.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Tear down and remove every entry
    pub fn dispose_all(&self) {
        let keys = self.keys();
        let count = keys.len();
        for key in keys {
            self.remove(&key);
        }
        if count > 0 {
            info!(count, "Disposed all streams");
        }
    }

    /// Receive every state transition applied from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.changes.subscribe()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
