//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod identity;
mod key;
mod limiter;
mod profile;

pub use bucket::{BucketState, ConsumeResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{
    AuthenticatedPrincipal, ChainedIdentityResolver, IdentityResolver, IdentitySource,
    RequestContext,
};
pub use key::{validate_namespace, BucketKey, DEFAULT_NAMESPACE};
pub use limiter::{FailureMode, LimiterSettings, RateLimitStatus, TokenBucketLimiter};
pub use profile::{
    ProfileConfig, ProfileRegistry, RateLimitProfile, Strategy, MAX_DURATION_SECONDS,
};
