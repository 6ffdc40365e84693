//! Rate limiting logic and state management.

mod bucket;
mod bucket_set;
mod limiter;
mod rates;
mod store;

pub use bucket::{TokenBucket, NEVER};
pub use bucket_set::TokenBucketSet;
pub use limiter::{Decision, Limiter, LimiterBuilder, DEFAULT_KEY};
pub use rates::{RateDefinition, RateSet, TimeUnit};
pub use store::{ExpiringKeyStore, DEFAULT_CAPACITY};
