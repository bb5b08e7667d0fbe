use crate::backend::{Admission, CounterStore, RateLimitPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::time::Instant;

/// A [CounterStore] that keeps fixed-window counters in a process-local
/// [DashMap](dashmap::DashMap).
///
/// Clones share the underlying map, so a single store constructed at the
/// application's composition root behaves as process-wide state. Counts are
/// not shared across separate processes: a deployment running N instances
/// effectively multiplies the allowed rate by N, which is the explicit reason
/// [RedisCounterStore](crate::backend::RedisCounterStore) exists.
///
/// Expiry is evaluated lazily at check time; there is no background task.
/// Expired entries are opportunistically swept on each check to bound memory
/// growth.
#[derive(Clone, Default)]
pub struct MemoryCounterStore {
    map: Arc<DashMap<String, CounterEntry>>,
}

struct CounterEntry {
    count: u64,
    reset_at: Instant,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Best-effort sweep of logically dead entries. Removal is purely an
    /// optimization: an expired entry left in place is treated as absent by
    /// the check itself.
    fn prune_expired(&self, now: Instant) {
        self.map.retain(|_, entry| entry.reset_at > now);
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    type Error = Infallible;

    async fn check_and_consume(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<Admission, Self::Error> {
        let now = Instant::now();
        self.prune_expired(now);

        let fresh_reset = now + policy.window;
        let mut admission = Admission::Allowed;
        self.map
            .entry(key.to_owned())
            .and_modify(|entry| {
                if entry.reset_at <= now {
                    // The recorded window has ended; start a fresh one.
                    entry.count = 1;
                    entry.reset_at = fresh_reset;
                } else if entry.count < policy.max_admissions {
                    entry.count += 1;
                } else {
                    admission = Admission::Denied {
                        retry_after: entry.reset_at.saturating_duration_since(now),
                    };
                }
            })
            .or_insert_with(|| CounterEntry {
                count: 1,
                reset_at: fresh_reset,
            });
        Ok(admission)
    }
}
