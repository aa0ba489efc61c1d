//! Self-imposed rate limiting: named budgets of method-scoped token buckets, and the
//! auto-tuner that resizes them from observed upstream error rates.

pub mod auto_tuner;
pub mod budget;

pub use auto_tuner::{BudgetAdjustment, RateLimitAutoTuner};
pub use budget::{RateLimitRule, RateLimiterBudget, RateLimitersRegistry, TokenBucketLimiter};
