//! High-level rate limiter with preset configurations.

use std::borrow::Cow;
use std::sync::Arc;

use tracing::debug;

use super::bucket::TokenBucket;
use super::window::TimeWindow;
use crate::clock::Clock;
use crate::error::{AegisError, Result};
use crate::storage::BucketStore;

/// Rate limiter over a single token bucket.
///
/// The presets turn a "N requests per window" limit into bucket parameters:
/// tokens refill every second at `N / window` per second, and the bucket
/// holds at most the burst allowance.
///
/// ```no_run
/// use std::sync::Arc;
/// use aegis_ratelimit::{FileStore, RateLimiter};
///
/// let store = Arc::new(FileStore::new("/tmp/ratelimit")?);
/// let limiter = RateLimiter::per_minute(60, store, None)?;
/// if !limiter.attempt("203.0.113.7", 1)? {
///     // reject with 429
/// }
/// # Ok::<(), aegis_ratelimit::AegisError>(())
/// ```
pub struct RateLimiter {
    bucket: TokenBucket,
    namespace: Option<String>,
}

impl RateLimiter {
    /// Create a rate limiter from an existing bucket.
    pub fn new(bucket: TokenBucket) -> Self {
        Self {
            bucket,
            namespace: None,
        }
    }

    /// Allow `max_requests` per second, all of them at once if needed.
    pub fn per_second(max_requests: u32, store: Arc<dyn BucketStore>) -> Result<Self> {
        Self::per_window(TimeWindow::Second, max_requests, store, None)
    }

    /// Allow `max_requests` per minute with a burst of `burst`
    /// (default: `max_requests`).
    pub fn per_minute(
        max_requests: u32,
        store: Arc<dyn BucketStore>,
        burst: Option<u32>,
    ) -> Result<Self> {
        Self::per_window(TimeWindow::Minute, max_requests, store, burst)
    }

    /// Allow `max_requests` per hour with a burst of `burst`
    /// (default: `max_requests / 10`).
    pub fn per_hour(
        max_requests: u32,
        store: Arc<dyn BucketStore>,
        burst: Option<u32>,
    ) -> Result<Self> {
        Self::per_window(TimeWindow::Hour, max_requests, store, burst)
    }

    /// Allow `max_requests` per day with a burst of `burst`
    /// (default: `max_requests / 100`).
    pub fn per_day(
        max_requests: u32,
        store: Arc<dyn BucketStore>,
        burst: Option<u32>,
    ) -> Result<Self> {
        Self::per_window(TimeWindow::Day, max_requests, store, burst)
    }

    /// Allow `max_requests` per `window`.
    ///
    /// A missing or zero `burst` falls back to the window's default burst
    /// policy (see [`TimeWindow::default_burst`]).
    pub fn per_window(
        window: TimeWindow,
        max_requests: u32,
        store: Arc<dyn BucketStore>,
        burst: Option<u32>,
    ) -> Result<Self> {
        if max_requests == 0 {
            return Err(AegisError::Config(format!(
                "Maximum requests per {} must be positive",
                window
            )));
        }

        let capacity = burst
            .filter(|b| *b > 0)
            .unwrap_or_else(|| window.default_burst(max_requests));
        if capacity == 0 {
            return Err(AegisError::Config(format!(
                "A limit of {} per {} has no default burst; set one explicitly",
                max_requests, window
            )));
        }

        let refill_rate = max_requests as f64 / window.as_secs() as f64;

        debug!(
            window = %window,
            max_requests = max_requests,
            capacity = capacity,
            refill_rate = refill_rate,
            "Creating rate limiter"
        );

        Ok(Self::new(TokenBucket::new(store, capacity, refill_rate, 1)?))
    }

    /// Use the given clock for refill computations.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            bucket: self.bucket.with_clock(clock),
            namespace: self.namespace,
        }
    }

    /// Keep this limiter's state apart from other limiters sharing the store.
    ///
    /// Keys are stored as `{namespace}:{key}`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Try to spend `tokens` requests for `key`.
    pub fn attempt(&self, key: &str, tokens: u32) -> Result<bool> {
        self.bucket.attempt(&self.scoped_key(key)?, tokens)
    }

    /// Requests still available for `key`.
    pub fn remaining(&self, key: &str) -> Result<f64> {
        self.bucket.remaining(&self.scoped_key(key)?)
    }

    /// Seconds until `key` gains more allowance (0 if a request would pass now).
    pub fn reset_at(&self, key: &str) -> Result<u64> {
        self.bucket.reset_at(&self.scoped_key(key)?)
    }

    /// Clear the limit for `key`.
    pub fn reset(&self, key: &str) -> Result<()> {
        self.bucket.reset(&self.scoped_key(key)?)
    }

    /// The underlying token bucket.
    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    fn scoped_key<'a>(&self, key: &'a str) -> Result<Cow<'a, str>> {
        if key.is_empty() {
            return Err(AegisError::EmptyKey);
        }
        Ok(match &self.namespace {
            Some(namespace) => Cow::Owned(format!("{}:{}", namespace, key)),
            None => Cow::Borrowed(key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    fn memory_store() -> Arc<dyn BucketStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_per_second_preset() {
        let limiter = RateLimiter::per_second(10, memory_store()).unwrap();

        for _ in 0..10 {
            assert!(limiter.attempt("user1", 1).unwrap());
        }
        assert!(!limiter.attempt("user1", 1).unwrap());
        assert_eq!(limiter.remaining("user1").unwrap(), 0.0);
    }

    #[test]
    fn test_per_second_bucket_parameters() {
        let limiter = RateLimiter::per_second(10, memory_store()).unwrap();
        let bucket = limiter.bucket();

        assert_eq!(bucket.capacity(), 10);
        assert_eq!(bucket.refill_rate(), 10.0);
        assert_eq!(bucket.refill_period(), 1);
    }

    #[test]
    fn test_per_minute_preset() {
        let limiter = RateLimiter::per_minute(60, memory_store(), None).unwrap();
        assert_eq!(limiter.remaining("user1").unwrap(), 60.0);
        assert_eq!(limiter.bucket().refill_rate(), 1.0);
    }

    #[test]
    fn test_per_minute_with_burst() {
        let limiter = RateLimiter::per_minute(60, memory_store(), Some(10)).unwrap();
        assert_eq!(limiter.remaining("user1").unwrap(), 10.0);
    }

    #[test]
    fn test_zero_burst_uses_default() {
        let limiter = RateLimiter::per_minute(60, memory_store(), Some(0)).unwrap();
        assert_eq!(limiter.remaining("user1").unwrap(), 60.0);
    }

    #[test]
    fn test_per_hour_default_burst() {
        let limiter = RateLimiter::per_hour(1000, memory_store(), None).unwrap();
        assert_eq!(limiter.remaining("user1").unwrap(), 100.0);
    }

    #[test]
    fn test_per_hour_with_burst() {
        let limiter = RateLimiter::per_hour(1000, memory_store(), Some(50)).unwrap();
        assert_eq!(limiter.remaining("user1").unwrap(), 50.0);
    }

    #[test]
    fn test_per_day_default_burst() {
        let limiter = RateLimiter::per_day(10000, memory_store(), None).unwrap();
        assert_eq!(limiter.remaining("user1").unwrap(), 100.0);
    }

    #[test]
    fn test_per_day_with_burst() {
        let limiter = RateLimiter::per_day(10000, memory_store(), Some(200)).unwrap();
        assert_eq!(limiter.remaining("user1").unwrap(), 200.0);
    }

    #[test]
    fn test_presets_reject_unusable_limits() {
        assert!(matches!(
            RateLimiter::per_second(0, memory_store()),
            Err(AegisError::Config(_))
        ));
        assert!(matches!(
            RateLimiter::per_hour(9, memory_store(), None),
            Err(AegisError::Config(_))
        ));
        assert!(matches!(
            RateLimiter::per_day(99, memory_store(), None),
            Err(AegisError::Config(_))
        ));
        // An explicit burst makes small limits usable
        assert!(RateLimiter::per_day(99, memory_store(), Some(1)).is_ok());
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = RateLimiter::per_second(5, memory_store()).unwrap();

        for _ in 0..5 {
            assert!(limiter.attempt("user1", 1).unwrap());
        }
        assert!(!limiter.attempt("user1", 1).unwrap());

        assert_eq!(limiter.remaining("user2").unwrap(), 5.0);
    }

    #[test]
    fn test_zero_tokens_is_an_error() {
        let limiter = RateLimiter::per_second(5, memory_store()).unwrap();
        assert!(matches!(
            limiter.attempt("user1", 0),
            Err(AegisError::InvalidTokens(0))
        ));
    }

    #[test]
    fn test_login_limit_reports_wait() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store: Arc<dyn BucketStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = RateLimiter::per_minute(60, store, Some(5))
            .unwrap()
            .with_clock(clock.clone());

        for _ in 0..5 {
            assert!(limiter.attempt("login_user", 1).unwrap());
        }
        assert!(!limiter.attempt("login_user", 1).unwrap());
        assert_eq!(limiter.reset_at("login_user").unwrap(), 1);

        // 60 per minute refills one token every second
        clock.advance(1);
        assert!(limiter.attempt("login_user", 1).unwrap());
        assert!(!limiter.attempt("login_user", 1).unwrap());

        clock.advance(3);
        assert_eq!(limiter.remaining("login_user").unwrap(), 3.0);
    }

    #[test]
    fn test_complete_workflow() {
        let limiter = RateLimiter::per_minute(60, memory_store(), None).unwrap();
        let user = "user123";

        for _ in 0..10 {
            assert!(limiter.attempt(user, 1).unwrap());
        }
        assert_eq!(limiter.remaining(user).unwrap(), 50.0);

        assert!(limiter.attempt(user, 50).unwrap());
        assert!(!limiter.attempt(user, 1).unwrap());
        assert_eq!(limiter.remaining(user).unwrap(), 0.0);
        assert!(limiter.reset_at(user).unwrap() > 0);

        limiter.reset(user).unwrap();
        assert!(limiter.attempt(user, 1).unwrap());
        assert_eq!(limiter.remaining(user).unwrap(), 59.0);
    }

    #[test]
    fn test_namespaces_keep_limiters_apart() {
        let store = memory_store();
        let login = RateLimiter::per_minute(5, store.clone(), None)
            .unwrap()
            .with_namespace("login");
        let api = RateLimiter::per_minute(100, store.clone(), None)
            .unwrap()
            .with_namespace("api");

        assert!(login.attempt("user1", 5).unwrap());
        assert!(!login.attempt("user1", 1).unwrap());

        assert_eq!(api.remaining("user1").unwrap(), 100.0);
        assert!(store.get("login:user1").unwrap().is_some());
        assert!(store.get("user1").unwrap().is_none());
    }

    #[test]
    fn test_namespaced_limiter_rejects_empty_key() {
        let limiter = RateLimiter::per_second(5, memory_store())
            .unwrap()
            .with_namespace("login");

        assert!(matches!(limiter.attempt("", 1), Err(AegisError::EmptyKey)));
        assert!(matches!(limiter.remaining(""), Err(AegisError::EmptyKey)));
    }
}
