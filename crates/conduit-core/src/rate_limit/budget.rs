use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::{RateLimitRuleConfig, RateLimiterConfig},
    errors::GatewayError,
    utils::wildcard::WildcardPattern,
};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilling `capacity` permits per `period`.
///
/// Only [`try_acquire_permit`](Self::try_acquire_permit) touches the bucket state, under
/// its own lock. The capacity is an atomic so the auto-tuner can resize the bucket
/// without contending with callers.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: AtomicU64,
    period: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    /// Creates a full bucket.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(capacity: u64, period: Duration) -> Self {
        Self {
            capacity: AtomicU64::new(capacity),
            period,
            state: Mutex::new(BucketState { tokens: capacity as f64, last_refill: Instant::now() }),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn refill(&self, state: &mut BucketState, now: Instant) -> f64 {
        let capacity = self.capacity() as f64;
        let elapsed = now.duration_since(state.last_refill);
        let period = self.period.as_secs_f64();
        let tokens_to_add = if period > 0.0 { elapsed.as_secs_f64() / period * capacity } else { capacity };

        if tokens_to_add > 0.0 {
            state.tokens = (state.tokens + tokens_to_add).min(capacity);
            state.last_refill = now;
        }
        // capacity may have been lowered since the last refill
        state.tokens = state.tokens.min(capacity);
        capacity
    }

    /// Takes one permit if available. Never blocks.
    #[must_use]
    pub fn try_acquire_permit(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole permits currently available.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn available_permits(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens.floor() as u64
    }

    /// Time until the next permit becomes available, zero if one is available now.
    #[must_use]
    pub fn time_until_next_permit(&self) -> Duration {
        let mut state = self.state.lock();
        let capacity = self.refill(&mut state, Instant::now());

        if state.tokens >= 1.0 || capacity <= 0.0 {
            return Duration::ZERO;
        }
        let deficit = 1.0 - state.tokens;
        Duration::from_secs_f64(deficit / capacity * self.period.as_secs_f64())
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Resizes the bucket. Tokens above the new capacity are discarded on the next refill.
    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }
}

/// A rule of a budget: method pattern, original config and the live limiter.
#[derive(Debug)]
pub struct RateLimitRule {
    config: RateLimitRuleConfig,
    pattern: WildcardPattern,
    limiter: TokenBucketLimiter,
}

impl RateLimitRule {
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPattern`] if the method pattern does not compile.
    pub fn new(config: RateLimitRuleConfig) -> Result<Self, GatewayError> {
        let pattern = WildcardPattern::new(&config.method)?;
        let limiter = TokenBucketLimiter::new(config.max_count, config.period());
        Ok(Self { config, pattern, limiter })
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitRuleConfig {
        &self.config
    }

    #[must_use]
    pub fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn matches(&self, method: &str) -> bool {
        self.pattern.is_match(method)
    }
}

/// A named, ordered set of rules.
#[derive(Debug)]
pub struct RateLimiterBudget {
    id: String,
    rules: Vec<Arc<RateLimitRule>>,
}

impl RateLimiterBudget {
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPattern`] if any rule pattern does not compile.
    pub fn new(id: impl Into<String>, rules: &[RateLimitRuleConfig]) -> Result<Self, GatewayError> {
        let rules = rules
            .iter()
            .cloned()
            .map(|rule| RateLimitRule::new(rule).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { id: id.into(), rules })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn rules(&self) -> &[Arc<RateLimitRule>] {
        &self.rules
    }

    /// Rules whose pattern matches `method`, in configuration order.
    #[must_use]
    pub fn rules_by_method(&self, method: &str) -> Vec<Arc<RateLimitRule>> {
        self.rules.iter().filter(|rule| rule.matches(method)).cloned().collect()
    }
}

/// All configured budgets, keyed by id. Immutable after construction.
#[derive(Debug, Default)]
pub struct RateLimitersRegistry {
    budgets: HashMap<String, Arc<RateLimiterBudget>>,
}

impl RateLimitersRegistry {
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPattern`] if any rule pattern does not compile.
    pub fn new(config: &RateLimiterConfig) -> Result<Self, GatewayError> {
        let mut budgets = HashMap::with_capacity(config.budgets.len());
        for budget in &config.budgets {
            debug!(budget = %budget.id, rules = budget.rules.len(), "registering rate limit budget");
            budgets.insert(
                budget.id.clone(),
                Arc::new(RateLimiterBudget::new(budget.id.clone(), &budget.rules)?),
            );
        }
        Ok(Self { budgets })
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::RateLimitBudgetNotFound`] if no budget has this id.
    pub fn get_budget(&self, name: &str) -> Result<Arc<RateLimiterBudget>, GatewayError> {
        self.budgets
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::RateLimitBudgetNotFound { budget: name.to_string() })
    }

    pub fn budgets(&self) -> impl Iterator<Item = &Arc<RateLimiterBudget>> {
        self.budgets.values()
    }
}
