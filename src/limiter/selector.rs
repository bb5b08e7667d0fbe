use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Environment variable explicitly selecting the counter store
/// (`memory` or `redis`).
pub const STORE_SELECTION_VAR: &str = "RATE_LIMIT_STORE";

/// Environment variable carrying the deployment mode; `production` defaults
/// the selection to the persistent store, anything else to memory.
pub const DEPLOYMENT_MODE_VAR: &str = "APP_ENV";

/// Which counter store answers a check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreSelection {
    /// Process-local counters; suitable for single-process deployments.
    Memory,
    /// Redis-backed counters shared across all instances of a deployment.
    Persistent,
}

#[derive(Debug, Error)]
#[error("unrecognised rate limit store {0:?} (expected \"memory\" or \"redis\")")]
pub struct ParseStoreError(String);

impl FromStr for StoreSelection {
    type Err = ParseStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Persistent),
            _ => Err(ParseStoreError(s.to_owned())),
        }
    }
}

impl StoreSelection {
    /// Resolve the selection from the environment.
    ///
    /// Read fresh on every call rather than cached, so a redeployment-free
    /// override (or a test) is always honoured.
    pub fn from_env() -> Self {
        resolve(
            env::var(STORE_SELECTION_VAR).ok().as_deref(),
            env::var(DEPLOYMENT_MODE_VAR).ok().as_deref(),
        )
    }
}

fn resolve(explicit: Option<&str>, deployment_mode: Option<&str>) -> StoreSelection {
    if let Some(explicit) = explicit {
        match explicit.parse() {
            Ok(selection) => return selection,
            Err(e) => {
                log::warn!("ignoring {STORE_SELECTION_VAR}: {e}");
            }
        }
    }
    // Multi-instance production deployments need cross-process counters.
    if deployment_mode == Some("production") {
        StoreSelection::Persistent
    } else {
        StoreSelection::Memory
    }
}
