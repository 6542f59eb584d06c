//! Time windows used by the rate limiter presets.

use serde::{Deserialize, Serialize};

/// Time window a request limit is expressed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Length of this window in seconds.
    pub fn as_secs(&self) -> u64 {
        match self {
            TimeWindow::Second => 1,
            TimeWindow::Minute => 60,
            TimeWindow::Hour => 3600,
            TimeWindow::Day => 86400,
        }
    }

    /// Burst allowance used when a preset is not given one explicitly.
    ///
    /// Short windows allow the whole limit as a burst. Hourly limits allow a
    /// tenth of the limit at once and daily limits a hundredth, so a client
    /// cannot spend a long window's quota in one go.
    pub fn default_burst(&self, max_requests: u32) -> u32 {
        match self {
            TimeWindow::Second | TimeWindow::Minute => max_requests,
            TimeWindow::Hour => max_requests / 10,
            TimeWindow::Day => max_requests / 100,
        }
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeWindow::Second => "second",
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_secs() {
        assert_eq!(TimeWindow::Second.as_secs(), 1);
        assert_eq!(TimeWindow::Minute.as_secs(), 60);
        assert_eq!(TimeWindow::Hour.as_secs(), 3600);
        assert_eq!(TimeWindow::Day.as_secs(), 86400);
    }

    #[test]
    fn test_default_burst_policy() {
        assert_eq!(TimeWindow::Second.default_burst(10), 10);
        assert_eq!(TimeWindow::Minute.default_burst(60), 60);
        assert_eq!(TimeWindow::Hour.default_burst(1000), 100);
        assert_eq!(TimeWindow::Day.default_burst(10000), 100);
        // Floors, so small limits can yield no burst at all
        assert_eq!(TimeWindow::Hour.default_burst(9), 0);
    }

    #[test]
    fn test_time_window_serde() {
        let window: TimeWindow = serde_yaml::from_str("hour").unwrap();
        assert_eq!(window, TimeWindow::Hour);
        assert_eq!(TimeWindow::Day.to_string(), "day");
    }
}
