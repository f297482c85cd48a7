//! Shared bucket state storage.
//!
//! Bucket state lives outside the limiter so that every service instance
//! sees the same buckets. Stores expose a small key-value contract with an
//! atomic compare-and-swap; the limiter builds its read-modify-write loop
//! on top of it.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a bucket store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store round trip exceeded {0}ms")]
    Timeout(u64),
    #[error("corrupt bucket state under '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Key-value storage for serialized bucket state.
///
/// All writes carry a TTL; an expired entry behaves exactly like a missing one.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Read the current value for `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Replace the value for `key` with `new` only if it currently equals `expected`.
    ///
    /// Returns `false` when the value changed, expired, or disappeared in the meantime.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Store `value` under `key` only if no live value exists.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;
}
