//! Core token bucket limiter.
//!
//! Every decision is an optimistic read-modify-write against the bucket
//! store: read the bucket, refill it, take a token, and write it back with
//! compare-and-swap. A lost swap means another caller changed the bucket
//! first, so the whole step is retried on the fresh value.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::bucket::{BucketState, ConsumeResult};
use super::clock::{Clock, SystemClock};
use super::key::BucketKey;
use super::profile::{ProfileRegistry, RateLimitProfile};
use crate::error::{Result, TollgateError};
use crate::store::{BucketStore, StoreError};

/// Default bound on a single store round trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);
/// Default number of compare-and-swap attempts per decision.
const DEFAULT_MAX_RETRIES: u32 = 10;
/// Default bucket TTL, in windows.
const DEFAULT_TTL_MULTIPLIER: u32 = 2;
/// Upper bound of the randomized pause between attempts, per attempt.
const BACKOFF_STEP_MICROS: u64 = 50;

/// What the limiter does when the bucket store fails or times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request and log the failure
    #[default]
    Open,
    /// Refuse with [`TollgateError::StoreUnavailable`]
    Closed,
}

/// Tunables for [`TokenBucketLimiter`].
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub failure_mode: FailureMode,
    pub store_timeout: Duration,
    pub max_retries: u32,
    /// Bucket TTL as a multiple of the profile window
    pub ttl_multiplier: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            ttl_multiplier: DEFAULT_TTL_MULTIPLIER,
        }
    }
}

/// Non-consuming view of one caller's bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub profile: String,
    pub limit: u64,
    pub remaining: u64,
    pub duration_seconds: u64,
}

/// Token bucket limiter over a shared [`BucketStore`].
///
/// The limiter holds no bucket state itself and can be shared freely
/// between tasks; all coordination happens in the store.
pub struct TokenBucketLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
}

impl TokenBucketLimiter {
    /// Create a limiter with default settings on the system clock.
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self::with_settings(store, Arc::new(SystemClock), LimiterSettings::default())
    }

    /// Create a limiter with explicit clock and settings.
    pub fn with_settings(
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        settings: LimiterSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Try to take one token from the bucket at `key`.
    ///
    /// A denial is a normal outcome (`consumed == false`), not an error.
    /// Errors only arise from the store, and only under [`FailureMode::Closed`].
    pub async fn try_consume(
        &self,
        key: &BucketKey,
        profile: &RateLimitProfile,
    ) -> Result<ConsumeResult> {
        let store_key = key.to_store_key();

        trace!(key = %store_key, profile = %profile.name(), "Checking rate limit");

        match self.consume(&store_key, profile).await {
            Ok(result) => {
                if result.consumed {
                    trace!(
                        key = %store_key,
                        remaining = result.remaining_tokens,
                        "Request admitted"
                    );
                } else {
                    debug!(
                        key = %store_key,
                        retry_after = result.retry_after_seconds,
                        "Rate limit exceeded"
                    );
                }
                Ok(result)
            }
            Err(err) => self
                .on_store_failure(&store_key, err)
                .map(|()| ConsumeResult::unmetered(profile)),
        }
    }

    /// Whole tokens currently available at `key`, without consuming any.
    pub async fn peek(&self, key: &BucketKey, profile: &RateLimitProfile) -> Result<u64> {
        let store_key = key.to_store_key();
        let now = self.clock.now_millis();

        let current = match self.bounded(self.store.get(&store_key)).await {
            Ok(raw) => raw,
            Err(err) => {
                return self
                    .on_store_failure(&store_key, err)
                    .map(|()| profile.limit())
            }
        };

        match current {
            None => Ok(profile.limit()),
            Some(raw) => match decode(&store_key, &raw) {
                Ok(state) => Ok(state.refilled(profile, now).remaining()),
                Err(err) => self
                    .on_store_failure(&store_key, err)
                    .map(|()| profile.limit()),
            },
        }
    }

    /// Inspect `identity`'s bucket on the named profile.
    pub async fn status(
        &self,
        registry: &ProfileRegistry,
        namespace: &str,
        profile_name: &str,
        identity: &str,
    ) -> Result<RateLimitStatus> {
        let profile = registry.resolve(profile_name)?;
        let key = BucketKey::with_namespace(namespace, identity, profile.name());
        let remaining = self.peek(&key, &profile).await?;

        Ok(RateLimitStatus {
            profile: profile.name().to_string(),
            limit: profile.limit(),
            remaining,
            duration_seconds: profile.duration_seconds(),
        })
    }

    /// Resolve the named profile and charge `identity`'s bucket on it.
    pub async fn admit(
        &self,
        registry: &ProfileRegistry,
        namespace: &str,
        profile_name: &str,
        identity: &str,
    ) -> Result<(Arc<RateLimitProfile>, ConsumeResult)> {
        let profile = registry.resolve(profile_name)?;
        let key = BucketKey::with_namespace(namespace, identity, profile.name());
        let result = self.try_consume(&key, &profile).await?;
        Ok((profile, result))
    }

    async fn consume(
        &self,
        store_key: &str,
        profile: &RateLimitProfile,
    ) -> std::result::Result<ConsumeResult, StoreError> {
        let ttl = self.ttl_for(profile);
        let attempts = self.settings.max_retries.max(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                let pause = rand::thread_rng().gen_range(0..=BACKOFF_STEP_MICROS * attempt as u64);
                tokio::time::sleep(Duration::from_micros(pause)).await;
            }

            let now = self.clock.now_millis();
            let current = self.bounded(self.store.get(store_key)).await?;

            let stored = match &current {
                Some(raw) => Some(decode(store_key, raw)?),
                None => None,
            };
            let state = stored.unwrap_or_else(|| BucketState::full(profile, now));

            let mut next = state.refilled(profile, now);
            let consumed = next.try_take();
            let result = if consumed {
                ConsumeResult::admitted(&next, profile, now)
            } else {
                ConsumeResult::denied(&next, profile, now)
            };

            // A denial that earned nothing leaves the bucket as it was.
            if !consumed && stored == Some(next) {
                return Ok(result);
            }

            let encoded = next.encode().map_err(|e| StoreError::Corrupt {
                key: store_key.to_string(),
                reason: e.to_string(),
            })?;

            let written = match &current {
                Some(raw) => {
                    self.bounded(self.store.compare_and_swap(store_key, raw, &encoded, ttl))
                        .await?
                }
                None => {
                    self.bounded(self.store.set_if_absent(store_key, &encoded, ttl))
                        .await?
                }
            };

            if written {
                return Ok(result);
            }

            trace!(key = %store_key, attempt, "Bucket changed concurrently, retrying");
        }

        warn!(
            key = %store_key,
            attempts,
            "Bucket contention exhausted retries, denying request"
        );
        Ok(ConsumeResult {
            consumed: false,
            remaining_tokens: 0,
            reset_time_seconds: profile.duration_seconds(),
            retry_after_seconds: 1,
        })
    }

    fn ttl_for(&self, profile: &RateLimitProfile) -> Duration {
        profile
            .duration()
            .checked_mul(self.settings.ttl_multiplier.max(1))
            .unwrap_or(Duration::MAX)
    }

    /// Run one store call under the configured timeout.
    async fn bounded<T, F>(&self, call: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        let timeout = self.settings.store_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(timeout.as_millis() as u64))?
    }

    /// Apply the failure policy: `Ok(())` means carry on as if unmetered.
    fn on_store_failure(&self, store_key: &str, err: StoreError) -> Result<()> {
        match self.settings.failure_mode {
            FailureMode::Open => {
                warn!(
                    key = %store_key,
                    backend = self.store.backend(),
                    error = %err,
                    "Bucket store failed, admitting request"
                );
                Ok(())
            }
            FailureMode::Closed => {
                warn!(
                    key = %store_key,
                    backend = self.store.backend(),
                    error = %err,
                    "Bucket store failed, refusing request"
                );
                Err(TollgateError::from(err))
            }
        }
    }
}

fn decode(store_key: &str, raw: &str) -> std::result::Result<BucketState, StoreError> {
    BucketState::decode(raw).map_err(|e| StoreError::Corrupt {
        key: store_key.to_string(),
        reason: e.to_string(),
    })
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("backend", &self.store.backend())
            .field("settings", &self.settings)
            .finish()
    }
}
