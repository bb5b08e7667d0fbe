pub mod memory;
pub mod redis;

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

use async_trait::async_trait;
use std::time::Duration;

/// The admission policy a key is checked against.
///
/// Policies are supplied by the caller on every check and are never persisted;
/// the same key may in principle be checked against different policies,
/// although in practice each feature namespace uses one fixed policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// The length of one admission window.
    pub window: Duration,
    /// The total admissions allowed within the window.
    pub max_admissions: u64,
}

impl RateLimitPolicy {
    pub fn new(window: Duration, max_admissions: u64) -> Self {
        Self {
            window,
            max_admissions,
        }
    }

    /// A policy of `max_admissions` per minute.
    pub fn per_minute(max_admissions: u64) -> Self {
        Self::new(Duration::from_secs(60), max_admissions)
    }
}

/// The outcome of a successfully evaluated admission check.
///
/// Infrastructure faults are not part of this type; stores report them through
/// their [CounterStore::Error] and the [RateLimiter](crate::RateLimiter)
/// facade converts them to a fail-closed
/// [RateLimitOutcome::Unavailable](crate::RateLimitOutcome::Unavailable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The check consumed one admission unit.
    Allowed,
    /// The key is at its limit; no state was mutated.
    Denied {
        /// Time remaining until the current window resets.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
}

/// A counter store tracking fixed-window admissions per key.
///
/// Implementations are required to be [Clone], usually by wrapping their state
/// in an [Arc](std::sync::Arc); clones share the underlying counters.
///
/// The contract, evaluated against the current clock:
///
/// 1. No live entry for `key` (absent, or recorded with `reset_at` in the
///    past): record `count = 1`, `reset_at = now + window`, allow.
/// 2. Live entry with `count < max_admissions`: increment, allow.
/// 3. Live entry at the limit: deny with `retry_after = reset_at - now`,
///    without mutating the entry.
/// 4. Any storage fault that prevents evaluating the above is an `Err`; it is
///    never mapped to an allow.
///
/// The check must be atomic per key: two concurrent checks against a key with
/// one admission remaining must not both observe an allow.
#[async_trait]
pub trait CounterStore: Clone {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Check `key` against `policy` and consume one admission unit if allowed.
    async fn check_and_consume(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<Admission, Self::Error>;
}
