pub mod selector;

use crate::backend::{Admission, CounterStore, MemoryCounterStore, RateLimitPolicy, RedisCounterStore};
use selector::StoreSelection;
use std::time::Duration;

/// The outcome of a rate limit check, as seen by callers of the facade.
///
/// Infrastructure faults are a value, not an error: callers are forced to
/// handle [Unavailable](RateLimitOutcome::Unavailable) distinctly from an
/// ordinary denial ("the safety check is broken" vs "slow down"), and neither
/// case may proceed with the gated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// The check consumed one admission unit; the caller may proceed.
    Admitted,
    /// The caller exceeded the policy. Expected, not an error.
    Denied {
        /// Time until the window resets.
        retry_after: Duration,
    },
    /// The check itself could not be evaluated. Fail-closed: the caller must
    /// not proceed, and should surface the feature as temporarily unavailable
    /// rather than as a "slow down" message.
    Unavailable {
        /// Description of the underlying fault.
        reason: String,
    },
}

impl RateLimitOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Admitted)
    }

    /// Time until the window resets; only meaningful for a denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Denied { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// The infrastructure fault, if the check could not be evaluated.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Unavailable { reason } => Some(reason),
            _ => None,
        }
    }
}

impl From<Admission> for RateLimitOutcome {
    fn from(admission: Admission) -> Self {
        match admission {
            Admission::Allowed => Self::Admitted,
            Admission::Denied { retry_after } => Self::Denied { retry_after },
        }
    }
}

enum SelectionSource {
    /// Resolved from the environment on every check.
    Environment,
    /// Pinned at construction; used by tests and explicit wiring.
    Fixed(StoreSelection),
}

/// Facade dispatching admission checks to the selected counter store.
///
/// Construct one instance at the application's composition root and share it
/// (clones share the underlying stores, so the in-memory counters remain
/// process-wide).
///
/// ```no_run
/// # use windowed_rate_limit::{RateLimiter, RateLimitPolicy, RateLimitOutcome};
/// # async fn example(user_id: &str) {
/// let limiter = RateLimiter::builder().build();
/// match limiter.check(&format!("ai:{user_id}"), &RateLimitPolicy::per_minute(10)).await {
///     RateLimitOutcome::Admitted => { /* proceed with the AI call */ }
///     RateLimitOutcome::Denied { .. } => { /* "slow down" */ }
///     RateLimitOutcome::Unavailable { .. } => { /* "temporarily unavailable" */ }
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    memory: MemoryCounterStore,
    persistent: Option<RedisCounterStore>,
    selection: std::sync::Arc<SelectionSource>,
}

impl RateLimiter {
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder {
            persistent: None,
            selection: SelectionSource::Environment,
        }
    }

    /// Check `key` against `policy`, consuming one admission unit if allowed.
    ///
    /// Never panics and never returns an error across this boundary: store
    /// faults are logged and folded into
    /// [RateLimitOutcome::Unavailable].
    pub async fn check(&self, key: &str, policy: &RateLimitPolicy) -> RateLimitOutcome {
        let selection = match self.selection.as_ref() {
            SelectionSource::Environment => StoreSelection::from_env(),
            SelectionSource::Fixed(selection) => *selection,
        };
        match selection {
            StoreSelection::Memory => match self.memory.check_and_consume(key, policy).await {
                Ok(admission) => admission.into(),
                Err(e) => match e {},
            },
            StoreSelection::Persistent => self.check_persistent(key, policy).await,
        }
    }

    async fn check_persistent(&self, key: &str, policy: &RateLimitPolicy) -> RateLimitOutcome {
        let Some(store) = &self.persistent else {
            log::error!(
                "Rate limit check failed: key={key} backend=redis: \
                 persistent store selected but not configured"
            );
            return RateLimitOutcome::Unavailable {
                reason: "rate limiting storage is not configured; \
                         an administrator must provision the Redis store"
                    .to_owned(),
            };
        };
        match store.check_and_consume(key, policy).await {
            Ok(admission) => admission.into(),
            Err(e) => {
                log::error!("Rate limit check failed: key={key} backend=redis: {e}");
                RateLimitOutcome::Unavailable {
                    reason: format!("rate limiting storage unavailable: {e}"),
                }
            }
        }
    }
}

pub struct RateLimiterBuilder {
    persistent: Option<RedisCounterStore>,
    selection: SelectionSource,
}

impl RateLimiterBuilder {
    /// Configure the persistent store used when the selection resolves to
    /// [StoreSelection::Persistent].
    ///
    /// Without one, persistent checks fail closed: the facade never silently
    /// falls back to the per-process memory store, which would multiply the
    /// effective limit by the instance count.
    pub fn persistent_store(mut self, store: RedisCounterStore) -> Self {
        self.persistent = Some(store);
        self
    }

    /// Pin the store selection instead of resolving it from the environment
    /// on each check.
    pub fn store_selection(mut self, selection: StoreSelection) -> Self {
        self.selection = SelectionSource::Fixed(selection);
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            memory: MemoryCounterStore::new(),
            persistent: self.persistent,
            selection: std::sync::Arc::new(self.selection),
        }
    }
}
