//! Bounded reconnection
//!
//! The scheduler runs inside a registry transition: it reads the stream's
//! retry counter, consults the protocol's current policy and either arms a
//! single-shot retry timer on the instance or publishes terminal failure.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{PolicyStore, ReconnectPolicy};
use crate::registry::RegistryEntry;
use crate::resources::Timer;
use crate::state::{AdaptiveStatus, NegotiatedStatus, StatePatch, StreamStatus};
use crate::types::Protocol;

/// Outcome of one reconnect decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry number `attempt` fires after `delay`
    Schedule { attempt: u32, delay: Duration },
    /// `attempts` retries were already spent
    Exhausted { attempts: u32 },
    /// Automatic reconnection is off
    Disabled,
    /// A retry is already waiting; the failure was ignored
    AlreadyPending,
}

/// Decide what to do about a failure given the retries already spent
#[must_use]
pub fn decide(policy: &ReconnectPolicy, retry_count: u32) -> RetryDecision {
    if !policy.auto_reconnect {
        return RetryDecision::Disabled;
    }
    let attempt = retry_count.saturating_add(1);
    if attempt > policy.max_reconnect_attempts {
        RetryDecision::Exhausted { attempts: retry_count }
    } else {
        RetryDecision::Schedule {
            attempt,
            delay: policy.reconnect_delay(),
        }
    }
}

const fn retrying_status(protocol: Protocol) -> StreamStatus {
    match protocol {
        Protocol::Adaptive => StreamStatus::Adaptive(AdaptiveStatus::Loading),
        Protocol::Negotiated => StreamStatus::Negotiated(NegotiatedStatus::Connecting),
    }
}

const fn terminal_status(protocol: Protocol) -> StreamStatus {
    match protocol {
        Protocol::Adaptive => StreamStatus::Adaptive(AdaptiveStatus::Error),
        Protocol::Negotiated => StreamStatus::Negotiated(NegotiatedStatus::Failed),
    }
}

/// Per-protocol retry scheduling
#[derive(Clone)]
pub struct RetryScheduler {
    policies: Arc<PolicyStore>,
}

impl RetryScheduler {
    #[must_use]
    pub const fn new(policies: Arc<PolicyStore>) -> Self {
        Self { policies }
    }

    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// Handle a failure of the instance owning `entry`
    ///
    /// `reconnect` is invoked once when the retry timer fires. It runs on the
    /// timer task with no registry entry held.
    pub(crate) fn schedule<F>(&self, entry: &mut RegistryEntry, reason: &str, reconnect: F) -> RetryDecision
    where
        F: FnOnce() + Send + 'static,
    {
        if entry.engine.retry_pending() {
            return RetryDecision::AlreadyPending;
        }

        let protocol = entry.state().protocol();
        let retry_count = entry.state().retry_count();
        let policy = self.policies.get(protocol);
        let decision = decide(&policy, retry_count);

        match decision {
            RetryDecision::Schedule { attempt, delay } => {
                info!(
                    stream_key = %entry.key(),
                    attempt,
                    max_attempts = policy.max_reconnect_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason,
                    "Scheduling reconnect"
                );
                entry.apply(
                    &StatePatch::new()
                        .status(retrying_status(protocol))
                        .error(reason)
                        .retry_count(attempt),
                );
                entry.engine.core_mut().set_retry(Timer::once(delay, reconnect));
            }
            RetryDecision::Exhausted { attempts } => {
                warn!(stream_key = %entry.key(), attempts, reason, "Reconnect attempts exhausted");
                entry.apply(
                    &StatePatch::new()
                        .status(terminal_status(protocol))
                        .error(format!("{reason} (gave up after {attempts} reconnect attempts)")),
                );
            }
            RetryDecision::Disabled => {
                warn!(stream_key = %entry.key(), reason, "Stream failed, automatic reconnect disabled");
                entry.apply(&StatePatch::new().status(terminal_status(protocol)).error(reason));
            }
            RetryDecision::AlreadyPending => {}
        }

        decision
    }
}
