//! Feedback loop resizing a budget's rules from the error rate observed on one upstream.
//!
//! Each tick folds the per-method counters into the rules they matched, so a wildcard rule
//! shared by many methods is adjusted once per tick from the combined rate.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use tokio::{sync::broadcast, time::interval};
use tracing::{debug, info};

use crate::{
    config::RateLimitAutoTuneConfig, metrics::MetricsCollector,
    rate_limit::budget::{RateLimitRule, RateLimiterBudget},
};

/// Absorbs float noise such as `100.0 * 1.05 == 105.00000000000001` before rounding.
const ROUNDING_SLACK: f64 = 1e-9;

#[derive(Debug, Default)]
struct MethodCounters {
    successes: AtomicU64,
    errors: AtomicU64,
}

impl MethodCounters {
    fn take(&self) -> (u64, u64) {
        (self.successes.swap(0, Ordering::Relaxed), self.errors.swap(0, Ordering::Relaxed))
    }
}

/// Adjusts the capacity of one budget from one upstream's outcomes.
pub struct RateLimitAutoTuner {
    upstream_id: String,
    budget: Arc<RateLimiterBudget>,
    config: RateLimitAutoTuneConfig,
    counters: DashMap<String, MethodCounters>,
    metrics: Option<Arc<MetricsCollector>>,
}

/// Result of one adjustment, per rule.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetAdjustment {
    pub rule_method: String,
    pub previous: u64,
    pub current: u64,
    pub error_rate: f64,
}

impl RateLimitAutoTuner {
    #[must_use]
    pub fn new(
        upstream_id: impl Into<String>,
        budget: Arc<RateLimiterBudget>,
        config: RateLimitAutoTuneConfig,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self { upstream_id: upstream_id.into(), budget, config, counters: DashMap::new(), metrics }
    }

    #[must_use]
    pub fn budget(&self) -> &Arc<RateLimiterBudget> {
        &self.budget
    }

    pub fn record_success(&self, method: &str) {
        self.with_counters(method, |c| c.successes.fetch_add(1, Ordering::Relaxed));
    }

    pub fn record_error(&self, method: &str) {
        self.with_counters(method, |c| c.errors.fetch_add(1, Ordering::Relaxed));
    }

    #[inline]
    fn with_counters(&self, method: &str, f: impl FnOnce(&MethodCounters) -> u64) {
        if let Some(counters) = self.counters.get(method) {
            f(&counters);
            return;
        }
        let counters = self.counters.entry(method.to_string()).or_default();
        f(&counters);
    }

    /// Runs one adjustment tick and resets the counters.
    ///
    /// Rules without samples since the previous tick keep their capacity.
    #[allow(clippy::cast_precision_loss)]
    pub fn adjust_budgets(&self) -> Vec<BudgetAdjustment> {
        let mut per_rule: Vec<(Arc<RateLimitRule>, u64, u64)> = Vec::new();

        for entry in &self.counters {
            let (successes, errors) = entry.value().take();
            if successes + errors == 0 {
                continue;
            }
            for rule in self.budget.rules_by_method(entry.key()) {
                match per_rule.iter_mut().find(|(r, _, _)| Arc::ptr_eq(r, &rule)) {
                    Some((_, s, e)) => {
                        *s += successes;
                        *e += errors;
                    }
                    None => per_rule.push((rule, successes, errors)),
                }
            }
        }

        per_rule
            .into_iter()
            .map(|(rule, successes, errors)| {
                let error_rate = errors as f64 / (successes + errors) as f64;
                let previous = rule.limiter().capacity();
                let current = self.next_capacity(previous, error_rate);
                rule.limiter().set_capacity(current);

                if current != previous {
                    debug!(
                        upstream = %self.upstream_id,
                        budget = %self.budget.id(),
                        method = %rule.config().method,
                        previous,
                        current,
                        error_rate,
                        "adjusted rate limit budget"
                    );
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_rate_budget_capacity(self.budget.id(), &rule.config().method, current);
                }

                BudgetAdjustment {
                    rule_method: rule.config().method.clone(),
                    previous,
                    current,
                    error_rate,
                }
            })
            .collect()
    }

    /// Scales `previous` by the configured factor. A factor other than 1 always moves the
    /// capacity by at least one slot, so small budgets keep converging.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn next_capacity(&self, previous: u64, error_rate: f64) -> u64 {
        let prev = previous as f64;
        let (min, max) = (self.config.min_budget, self.config.max_budget.max(self.config.min_budget));

        let next = if error_rate > self.config.error_rate_threshold {
            let factor = self.config.decrease_factor;
            let scaled = (prev * factor + ROUNDING_SLACK).floor().max(0.0) as u64;
            if factor < 1.0 {
                scaled.min(previous.saturating_sub(1))
            } else {
                scaled
            }
        } else {
            let factor = self.config.increase_factor;
            let scaled = (prev * factor - ROUNDING_SLACK).ceil().min(u64::MAX as f64) as u64;
            if factor > 1.0 {
                scaled.max(previous.saturating_add(1))
            } else {
                scaled
            }
        };

        next.clamp(min, max)
    }

    /// Starts the periodic adjustment task. It stops when `shutdown_rx` fires.
    pub fn start_with_shutdown(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let period = self.config.adjustment_period();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // the first tick completes immediately and there is nothing to adjust yet
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.adjust_budgets();
                    }
                    _ = shutdown_rx.recv() => {
                        info!(upstream = %self.upstream_id, budget = %self.budget.id(), "rate limit auto-tuner shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for RateLimitAutoTuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitAutoTuner")
            .field("upstream_id", &self.upstream_id)
            .field("budget", &self.budget.id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
