//! Declarative rate limit rules.
//!
//! A rule is the configuration-file form of a preset: a request count per
//! time unit and an optional burst allowance.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::limiter::RateLimiter;
use super::window::TimeWindow;
use crate::error::Result;
use crate::storage::BucketStore;

/// A rate limit rule specifying the limit and time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Number of requests allowed per unit of time
    pub requests_per_unit: u32,
    /// The time unit
    pub unit: TimeWindow,
    /// Burst allowance; the unit's default burst policy applies if unset
    #[serde(default)]
    pub burst: Option<u32>,
}

impl LimitRule {
    pub fn new(requests_per_unit: u32, unit: TimeWindow) -> Self {
        Self {
            requests_per_unit,
            unit,
            burst: None,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }
}

impl RateLimiter {
    /// Build a rate limiter enforcing `rule`.
    pub fn from_rule(rule: &LimitRule, store: Arc<dyn BucketStore>) -> Result<Self> {
        Self::per_window(rule.unit, rule.requests_per_unit, store, rule.burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AegisError;
    use crate::storage::MemoryStore;

    #[test]
    fn test_parse_rule() {
        let yaml = r#"
requests_per_unit: 1000
unit: hour
"#;
        let rule: LimitRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule, LimitRule::new(1000, TimeWindow::Hour));
    }

    #[test]
    fn test_parse_rule_with_burst() {
        let yaml = r#"
requests_per_unit: 100
unit: minute
burst: 20
"#;
        let rule: LimitRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.burst, Some(20));
    }

    #[test]
    fn test_parse_rejects_unknown_unit() {
        let yaml = r#"
requests_per_unit: 100
unit: fortnight
"#;
        assert!(serde_yaml::from_str::<LimitRule>(yaml).is_err());
    }

    #[test]
    fn test_limiter_from_rule() {
        let store = Arc::new(MemoryStore::new());

        let hourly = RateLimiter::from_rule(&LimitRule::new(1000, TimeWindow::Hour), store.clone())
            .unwrap();
        assert_eq!(hourly.remaining("user1").unwrap(), 100.0);

        let search = LimitRule::new(100, TimeWindow::Minute).with_burst(20);
        let search = RateLimiter::from_rule(&search, store).unwrap();
        for _ in 0..20 {
            assert!(search.attempt("search_user", 1).unwrap());
        }
        assert!(!search.attempt("search_user", 1).unwrap());
    }

    #[test]
    fn test_limiter_from_unusable_rule() {
        let store = Arc::new(MemoryStore::new());
        let result = RateLimiter::from_rule(&LimitRule::new(5, TimeWindow::Day), store);
        assert!(matches!(result, Err(AegisError::Config(_))));
    }
}
