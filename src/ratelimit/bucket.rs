//! Token bucket state and refill arithmetic.
//!
//! A bucket's capacity and window come from its profile; only the token
//! count and the refill timestamp are persisted.

use serde::{Deserialize, Serialize};

use super::profile::{RateLimitProfile, Strategy};

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketState {
    /// Tokens currently available, possibly fractional
    pub available_tokens: f64,
    /// Epoch milliseconds of the last refill
    #[serde(rename = "lastRefillTimestamp")]
    pub last_refill_ms: i64,
}

/// Start of the epoch-aligned window containing `now_ms`.
fn window_start(now_ms: i64, window_ms: i64) -> i64 {
    now_ms.div_euclid(window_ms) * window_ms
}

/// Round milliseconds up to whole seconds.
fn ceil_secs(millis: i64) -> u64 {
    if millis <= 0 {
        0
    } else {
        (millis.saturating_add(999) / 1000) as u64
    }
}

impl BucketState {
    /// A full bucket created at `now_ms`.
    pub fn full(profile: &RateLimitProfile, now_ms: i64) -> Self {
        let last_refill_ms = match profile.strategy() {
            Strategy::FixedWindow => window_start(now_ms, profile.duration_millis()),
            Strategy::Greedy | Strategy::Interval => now_ms,
        };
        Self {
            available_tokens: profile.limit() as f64,
            last_refill_ms,
        }
    }

    /// Serialize for the bucket store.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize a value read from the bucket store.
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// The state after crediting every token earned up to `now_ms`.
    ///
    /// Time running backwards earns nothing and never moves the refill
    /// timestamp back.
    pub fn refilled(&self, profile: &RateLimitProfile, now_ms: i64) -> Self {
        let capacity = profile.limit() as f64;
        let window_ms = profile.duration_millis();
        let mut next = Self {
            available_tokens: self.available_tokens.clamp(0.0, capacity),
            last_refill_ms: self.last_refill_ms,
        };

        match profile.strategy() {
            Strategy::Greedy => {
                let elapsed = now_ms.saturating_sub(self.last_refill_ms);
                if elapsed > 0 {
                    let earned = elapsed as f64 * capacity / window_ms as f64;
                    next.available_tokens = (next.available_tokens + earned).min(capacity);
                    next.last_refill_ms = now_ms;
                }
            }
            Strategy::Interval => {
                let elapsed = now_ms.saturating_sub(self.last_refill_ms);
                let periods = elapsed / window_ms;
                if periods > 0 {
                    next.available_tokens =
                        (next.available_tokens + periods as f64 * capacity).min(capacity);
                    next.last_refill_ms = self
                        .last_refill_ms
                        .saturating_add(periods.saturating_mul(window_ms));
                }
            }
            Strategy::FixedWindow => {
                let start = window_start(now_ms, window_ms);
                if start > self.last_refill_ms {
                    next.available_tokens = capacity;
                    next.last_refill_ms = start;
                }
            }
        }

        next
    }

    /// Take one token if a whole one is available.
    pub fn try_take(&mut self) -> bool {
        if self.available_tokens >= 1.0 {
            self.available_tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens available.
    pub fn remaining(&self) -> u64 {
        self.available_tokens.max(0.0).floor() as u64
    }

    /// Milliseconds until at least one whole token is available.
    pub fn millis_until_token(&self, profile: &RateLimitProfile, now_ms: i64) -> i64 {
        if self.available_tokens >= 1.0 {
            return 0;
        }
        self.millis_until(profile, now_ms, 1.0)
    }

    /// Milliseconds until the bucket is back at capacity.
    pub fn millis_until_full(&self, profile: &RateLimitProfile, now_ms: i64) -> i64 {
        let capacity = profile.limit() as f64;
        if self.available_tokens >= capacity {
            return 0;
        }
        self.millis_until(profile, now_ms, capacity)
    }

    fn millis_until(&self, profile: &RateLimitProfile, now_ms: i64, target: f64) -> i64 {
        let window_ms = profile.duration_millis();
        match profile.strategy() {
            Strategy::Greedy => {
                let missing = (target - self.available_tokens).max(0.0);
                (missing * window_ms as f64 / profile.limit() as f64).ceil() as i64
            }
            Strategy::Interval => self
                .last_refill_ms
                .saturating_add(window_ms)
                .saturating_sub(now_ms)
                .max(0),
            Strategy::FixedWindow => {
                window_start(now_ms, window_ms) + window_ms - now_ms
            }
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResult {
    /// Whether a token was taken and the request may proceed
    pub consumed: bool,
    /// Whole tokens left after this decision
    pub remaining_tokens: u64,
    /// Seconds until the bucket is full again
    pub reset_time_seconds: u64,
    /// Seconds until a retry can succeed (0 when consumed)
    pub retry_after_seconds: u64,
}

impl ConsumeResult {
    /// A request that took a token, leaving `state` behind.
    pub fn admitted(state: &BucketState, profile: &RateLimitProfile, now_ms: i64) -> Self {
        Self {
            consumed: true,
            remaining_tokens: state.remaining(),
            reset_time_seconds: ceil_secs(state.millis_until_full(profile, now_ms)),
            retry_after_seconds: 0,
        }
    }

    /// A request refused because `state` holds less than one token.
    pub fn denied(state: &BucketState, profile: &RateLimitProfile, now_ms: i64) -> Self {
        Self {
            consumed: false,
            remaining_tokens: state.remaining(),
            reset_time_seconds: ceil_secs(state.millis_until_full(profile, now_ms)),
            retry_after_seconds: ceil_secs(state.millis_until_token(profile, now_ms)).max(1),
        }
    }

    /// A request admitted without touching any bucket.
    pub fn unmetered(profile: &RateLimitProfile) -> Self {
        Self {
            consumed: true,
            remaining_tokens: profile.limit(),
            reset_time_seconds: 0,
            retry_after_seconds: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn profile(limit: u64, duration_seconds: u64, strategy: Strategy) -> RateLimitProfile {
        RateLimitProfile::new("test", limit, duration_seconds, strategy).unwrap()
    }

    #[test]
    fn test_full_bucket() {
        let p = profile(10, 60, Strategy::Greedy);
        let state = BucketState::full(&p, T0);
        assert_eq!(state.remaining(), 10);
        assert_eq!(state.last_refill_ms, T0);
    }

    #[test]
    fn test_take_within_limit_and_exhaust() {
        let p = profile(5, 60, Strategy::Greedy);
        let mut state = BucketState::full(&p, T0);

        for expected in (0..5).rev() {
            assert!(state.try_take());
            assert_eq!(state.remaining(), expected);
        }

        // The 6th request should be rejected without going negative
        assert!(!state.try_take());
        assert_eq!(state.available_tokens, 0.0);
    }

    #[test]
    fn test_greedy_refill_is_proportional() {
        let p = profile(5, 60, Strategy::Greedy);
        let empty = BucketState {
            available_tokens: 0.0,
            last_refill_ms: T0,
        };

        let later = empty.refilled(&p, T0 + 12_000);
        assert_eq!(later.available_tokens, 1.0);
        assert_eq!(later.last_refill_ms, T0 + 12_000);

        let half = empty.refilled(&p, T0 + 6_000);
        assert_eq!(half.remaining(), 0);
        assert!((half.available_tokens - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_greedy_refill_caps_at_capacity() {
        let p = profile(5, 60, Strategy::Greedy);
        let empty = BucketState {
            available_tokens: 0.0,
            last_refill_ms: T0,
        };
        let much_later = empty.refilled(&p, T0 + 3_600_000);
        assert_eq!(much_later.available_tokens, 5.0);
    }

    #[test]
    fn test_clock_going_backwards_earns_nothing() {
        let p = profile(5, 60, Strategy::Greedy);
        let state = BucketState {
            available_tokens: 2.0,
            last_refill_ms: T0,
        };

        let skewed = state.refilled(&p, T0 - 30_000);
        assert_eq!(skewed, state);

        // Returning to the original time must not credit the skew either
        let recovered = skewed.refilled(&p, T0);
        assert_eq!(recovered.available_tokens, 2.0);
    }

    #[test]
    fn test_greedy_retry_after() {
        let p = profile(5, 60, Strategy::Greedy);
        let empty = BucketState {
            available_tokens: 0.0,
            last_refill_ms: T0,
        };
        let result = ConsumeResult::denied(&empty, &p, T0);
        assert!(!result.consumed);
        assert_eq!(result.retry_after_seconds, 12);
        assert_eq!(result.reset_time_seconds, 60);
        assert_eq!(result.remaining_tokens, 0);
    }

    #[test]
    fn test_interval_refills_whole_periods() {
        let p = profile(3, 10, Strategy::Interval);
        let empty = BucketState {
            available_tokens: 0.0,
            last_refill_ms: T0,
        };

        // Nothing before the period completes
        let partial = empty.refilled(&p, T0 + 9_999);
        assert_eq!(partial.available_tokens, 0.0);
        assert_eq!(partial.millis_until_token(&p, T0 + 9_999), 1);

        // Everything at once after it
        let refilled = empty.refilled(&p, T0 + 25_000);
        assert_eq!(refilled.available_tokens, 3.0);
        // Phase is preserved
        assert_eq!(refilled.last_refill_ms, T0 + 20_000);
    }

    #[test]
    fn test_fixed_window_resets_on_boundary() {
        let p = profile(2, 60, Strategy::FixedWindow);
        let start = T0 - T0.rem_euclid(60_000);
        let mut state = BucketState::full(&p, start + 50_000);
        assert_eq!(state.last_refill_ms, start);

        assert!(state.try_take());
        assert!(state.try_take());
        assert!(!state.try_take());

        assert_eq!(state.millis_until_token(&p, start + 50_000), 10_000);

        let same_window = state.refilled(&p, start + 59_999);
        assert_eq!(same_window.available_tokens, 0.0);

        let next_window = state.refilled(&p, start + 60_000);
        assert_eq!(next_window.available_tokens, 2.0);
        assert_eq!(next_window.last_refill_ms, start + 60_000);
    }

    #[test]
    fn test_encoding_uses_wire_names() {
        let state = BucketState {
            available_tokens: 2.5,
            last_refill_ms: T0,
        };
        let raw = state.encode().unwrap();
        assert!(raw.contains("\"availableTokens\":2.5"));
        assert!(raw.contains("\"lastRefillTimestamp\":1700000000000"));
        assert_eq!(BucketState::decode(&raw).unwrap(), state);
        assert!(BucketState::decode("not json").is_err());
    }

    #[test]
    fn test_unmetered_result() {
        let p = profile(7, 60, Strategy::Greedy);
        let result = ConsumeResult::unmetered(&p);
        assert!(result.consumed);
        assert_eq!(result.remaining_tokens, 7);
        assert_eq!(result.retry_after_seconds, 0);
    }
}
