//! Aegis rate limiting
//!
//! Token bucket rate limiting keyed by caller-defined identifiers (user ids,
//! IP addresses, API tokens). Bucket state is refilled lazily from elapsed
//! time and persisted through a pluggable [`BucketStore`]; an in-memory and a
//! file-backed store are provided. [`RateLimiter`] wraps a bucket with
//! per-second/minute/hour/day presets.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod storage;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::AegisConfig;
pub use crate::error::{AegisError, Result};
pub use crate::ratelimit::{LimitRule, RateLimiter, TimeWindow, TokenBucket};
pub use crate::storage::{BucketState, BucketStore, FileStore, MemoryStore};
