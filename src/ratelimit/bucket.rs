//! Token bucket algorithm.
//!
//! A bucket holds up to `capacity` tokens. Every whole `refill_period`
//! seconds adds `refill_rate` tokens, capped at capacity. Refill is computed
//! lazily from the stored `last_refill` timestamp whenever a key is read, so
//! no timer is needed. Partial periods accrue nothing and leave the refill
//! clock where it was.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::{AegisError, Result};
use crate::storage::{BucketState, BucketStore};

/// Bucket state after refill, and whether it came from storage.
struct Loaded {
    state: BucketState,
    stored: bool,
    refilled: bool,
}

/// A token bucket whose per-key state lives in a [`BucketStore`].
pub struct TokenBucket {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    capacity: u32,
    refill_rate: f64,
    refill_period: u64,
}

impl TokenBucket {
    /// Create a new token bucket.
    ///
    /// `refill_rate` tokens are added every `refill_period` seconds, up to
    /// `capacity`. All three must be positive.
    pub fn new(
        store: Arc<dyn BucketStore>,
        capacity: u32,
        refill_rate: f64,
        refill_period: u64,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(AegisError::Config("Capacity must be positive".to_string()));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(AegisError::Config(format!(
                "Refill rate must be positive, got {}",
                refill_rate
            )));
        }
        if refill_period == 0 {
            return Err(AegisError::Config(
                "Refill period must be positive".to_string(),
            ));
        }

        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            capacity,
            refill_rate,
            refill_period,
        })
    }

    /// Use the given clock for refill computations.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn refill_period(&self) -> u64 {
        self.refill_period
    }

    /// Lifetime given to stored state: twice the time a drained bucket needs
    /// to refill completely.
    pub fn ttl_secs(&self) -> u64 {
        let periods_to_fill = (self.capacity as f64 / self.refill_rate).ceil() as u64;
        periods_to_fill
            .saturating_mul(self.refill_period)
            .saturating_mul(2)
    }

    /// Try to consume `tokens` tokens for `key`.
    ///
    /// Returns `Ok(true)` if the tokens were available and consumed, and
    /// `Ok(false)` if the request is denied. A denied request still writes
    /// back any refill that happened, but never creates state for a new key.
    pub fn attempt(&self, key: &str, tokens: u32) -> Result<bool> {
        if tokens == 0 {
            return Err(AegisError::InvalidTokens(tokens));
        }
        validate_key(key)?;

        let now = self.clock.now();
        let Loaded {
            mut state,
            stored,
            refilled,
        } = self.load(key, now)?;

        trace!(
            key = %key,
            tokens = tokens,
            available = state.tokens,
            "Checking token bucket"
        );

        if state.tokens < tokens as f64 {
            debug!(
                key = %key,
                requested = tokens,
                available = state.tokens,
                "Rate limit exceeded"
            );
            if stored && refilled {
                self.save(key, state)?;
            }
            return Ok(false);
        }

        state.tokens -= tokens as f64;
        self.save(key, state)?;
        Ok(true)
    }

    /// Tokens currently available for `key`. Does not write to storage.
    pub fn remaining(&self, key: &str) -> Result<f64> {
        validate_key(key)?;
        let loaded = self.load(key, self.clock.now())?;
        Ok(loaded.state.tokens.max(0.0))
    }

    /// Seconds until the next refill boundary for `key`, or 0 if at least one
    /// token is available now.
    pub fn reset_at(&self, key: &str) -> Result<u64> {
        validate_key(key)?;
        let now = self.clock.now();
        let Loaded { state, .. } = self.load(key, now)?;

        if state.tokens >= 1.0 {
            return Ok(0);
        }

        let elapsed = elapsed_secs(state.last_refill, now);
        Ok(self.refill_period - elapsed % self.refill_period)
    }

    /// Forget all state for `key`; its next use starts with a full bucket.
    pub fn reset(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        debug!(key = %key, "Resetting token bucket");
        self.store.delete(key)
    }

    /// Load state for `key` and apply refill up to `now`.
    fn load(&self, key: &str, now: i64) -> Result<Loaded> {
        let capacity = self.capacity as f64;

        let Some(mut state) = self.store.get(key)? else {
            debug!(key = %key, capacity = self.capacity, "Initializing token bucket");
            return Ok(Loaded {
                state: BucketState::new(capacity, now),
                stored: false,
                refilled: false,
            });
        };

        state.tokens = state.tokens.clamp(0.0, capacity);

        let periods = elapsed_secs(state.last_refill, now) / self.refill_period;
        let refilled = periods > 0;
        if refilled {
            state.tokens = (state.tokens + periods as f64 * self.refill_rate).min(capacity);
            state.last_refill = now;
        }

        Ok(Loaded {
            state,
            stored: true,
            refilled,
        })
    }

    fn save(&self, key: &str, state: BucketState) -> Result<()> {
        self.store.set(key, state, self.ttl_secs())
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(AegisError::EmptyKey);
    }
    Ok(())
}

/// Seconds from `last_refill` to `now`; a refill stamp in the future counts as zero.
fn elapsed_secs(last_refill: i64, now: i64) -> u64 {
    now.saturating_sub(last_refill).max(0) as u64
}
