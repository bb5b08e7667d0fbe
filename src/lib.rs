pub mod backend;
mod limiter;

pub use backend::{Admission, CounterStore, RateLimitPolicy};
pub use limiter::selector::{
    ParseStoreError, StoreSelection, DEPLOYMENT_MODE_VAR, STORE_SELECTION_VAR,
};
pub use limiter::{RateLimitOutcome, RateLimiter, RateLimiterBuilder};
