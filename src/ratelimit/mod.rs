//! Token bucket rate limiting.

mod bucket;
mod limiter;
mod rules;
mod window;

pub use bucket::TokenBucket;
pub use limiter::RateLimiter;
pub use rules::LimitRule;
pub use window::TimeWindow;
