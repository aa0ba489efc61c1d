//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `Default` implementations and `set_default` entries
//! 2. **Config file**: TOML file named by the `CONDUIT_CONFIG` env var
//! 3. **Environment variables**: `CONDUIT__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`ServerConfig`]: HTTP server settings (bind address, concurrency, request deadline)
//! - [`RateLimiterConfig`]: named rate budgets and their rules
//! - [`ProjectConfig`]: projects, their networks, auth secrets and upstreams
//! - [`UpstreamConfig`]: endpoint, eligibility lists, failsafe policies, rate budget
//! - [`MetricsConfig`], [`LoggingConfig`]: observability
//!
//! # Example
//!
//! ```toml
//! [[rate_limiters.budgets]]
//! id = "default-budget"
//! rules = [{ method = "*", max_count = 100, period_ms = 1000 }]
//!
//! [[projects]]
//! id = "main"
//! networks = [{ architecture = "evm", chain_id = 1 }]
//!
//! [[projects.upstreams]]
//! id = "alchemy-1"
//! endpoint = "https://eth-mainnet.example.com"
//! rate_limit_budget = "default-budget"
//! evm = { chain_id = 1, node_type = "full", max_available_recent_blocks = 128 }
//! failsafe = { timeout = { duration_ms = 3000 }, hedge = { delay_ms = 200, max_count = 1 } }
//! ```

use crate::types::{EvmNodeType, NetworkArchitecture, UpstreamType};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};

/// HTTP server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Deadline applied to every request item, in milliseconds.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    4000
}

fn default_max_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent_requests() -> usize {
    1000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            max_timeout_ms: default_max_timeout_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json` or `pretty`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// Named rate budgets shared by upstreams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub budgets: Vec<RateLimitBudgetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitBudgetConfig {
    pub id: String,
    #[serde(default)]
    pub rules: Vec<RateLimitRuleConfig>,
}

/// A single token-bucket rule: `max_count` permits per `period_ms` for methods matching
/// `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRuleConfig {
    #[serde(default = "default_wildcard")]
    pub method: String,
    pub max_count: u64,
    #[serde(default = "default_rule_period_ms")]
    pub period_ms: u64,
}

fn default_wildcard() -> String {
    "*".to_string()
}

fn default_rule_period_ms() -> u64 {
    1000
}

impl RateLimitRuleConfig {
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Adaptive tuning of an upstream's rate budget from its observed error rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitAutoTuneConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_adjustment_period_ms")]
    pub adjustment_period_ms: u64,
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
    #[serde(default = "default_min_budget")]
    pub min_budget: u64,
    #[serde(default = "default_max_budget")]
    pub max_budget: u64,
}

fn default_adjustment_period_ms() -> u64 {
    60_000
}

fn default_error_rate_threshold() -> f64 {
    0.1
}

fn default_increase_factor() -> f64 {
    1.05
}

fn default_decrease_factor() -> f64 {
    0.9
}

fn default_min_budget() -> u64 {
    1
}

fn default_max_budget() -> u64 {
    10_000
}

impl Default for RateLimitAutoTuneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            adjustment_period_ms: default_adjustment_period_ms(),
            error_rate_threshold: default_error_rate_threshold(),
            increase_factor: default_increase_factor(),
            decrease_factor: default_decrease_factor(),
            min_budget: default_min_budget(),
            max_budget: default_max_budget(),
        }
    }
}

impl RateLimitAutoTuneConfig {
    #[must_use]
    pub fn adjustment_period(&self) -> Duration {
        Duration::from_millis(self.adjustment_period_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectAdminConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Secrets accepted on the admin path. Empty means the consumer secrets apply.
    #[serde(default)]
    pub auth: ProjectAuthConfig,
}

/// Shared-secret authentication. An empty list means the project is open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectAuthConfig {
    #[serde(default)]
    pub secrets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub architecture: NetworkArchitecture,
    pub chain_id: u64,
}

impl NetworkConfig {
    /// Network id in `architecture:chain_id` form, e.g. `evm:1`.
    #[must_use]
    pub fn network_id(&self) -> String {
        format!("{}:{}", self.architecture, self.chain_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    #[serde(default)]
    pub admin: ProjectAdminConfig,
    #[serde(default)]
    pub auth: ProjectAuthConfig,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvmUpstreamConfig {
    /// Probed with `eth_chainId` at bootstrap when absent.
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub node_type: EvmNodeType,
    /// How many recent blocks a full node still serves. Zero defaults to 128 for full nodes.
    #[serde(default)]
    pub max_available_recent_blocks: u64,
    #[serde(default = "default_state_poller_interval_ms")]
    pub state_poller_interval_ms: u64,
    /// Initial syncing state. Unset means unknown.
    #[serde(default)]
    pub syncing: Option<bool>,
}

fn default_state_poller_interval_ms() -> u64 {
    30_000
}

impl Default for EvmUpstreamConfig {
    fn default() -> Self {
        Self {
            chain_id: None,
            node_type: EvmNodeType::default(),
            max_available_recent_blocks: 0,
            state_poller_interval_ms: default_state_poller_interval_ms(),
            syncing: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicyConfig {
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_backoff_max_delay_ms() -> u64 {
    3_000
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: 0,
            backoff_factor: default_backoff_factor(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicyConfig {
    /// Failures within the last `failure_threshold_capacity` outcomes that open the circuit.
    #[serde(default = "default_failure_threshold_count")]
    pub failure_threshold_count: u32,
    #[serde(default = "default_failure_threshold_capacity")]
    pub failure_threshold_capacity: u32,
    #[serde(default = "default_half_open_after_ms")]
    pub half_open_after_ms: u64,
    /// Trial successes needed in half-open state to close the circuit.
    #[serde(default = "default_success_threshold_count")]
    pub success_threshold_count: u32,
}

fn default_failure_threshold_count() -> u32 {
    20
}

fn default_failure_threshold_capacity() -> u32 {
    80
}

fn default_half_open_after_ms() -> u64 {
    300_000
}

fn default_success_threshold_count() -> u32 {
    8
}

impl Default for CircuitBreakerPolicyConfig {
    fn default() -> Self {
        Self {
            failure_threshold_count: default_failure_threshold_count(),
            failure_threshold_capacity: default_failure_threshold_capacity(),
            half_open_after_ms: default_half_open_after_ms(),
            success_threshold_count: default_success_threshold_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgePolicyConfig {
    pub delay_ms: u64,
    #[serde(default = "default_hedge_max_count")]
    pub max_count: u32,
}

fn default_hedge_max_count() -> u32 {
    1
}

/// Resilience policies applied around each upstream send. Absent sections disable the layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailsafeConfig {
    #[serde(default)]
    pub timeout: Option<TimeoutPolicyConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicyConfig>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerPolicyConfig>,
    #[serde(default)]
    pub hedge: Option<HedgePolicyConfig>,
}

/// Routing weights for one (network, method) pattern pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreMultiplierConfig {
    #[serde(default = "default_wildcard")]
    pub network: String,
    #[serde(default = "default_wildcard")]
    pub method: String,
    #[serde(default = "default_multiplier")]
    pub overall: f64,
    #[serde(default = "default_multiplier")]
    pub error_rate: f64,
    #[serde(default = "default_multiplier")]
    pub resp_latency: f64,
    #[serde(default = "default_multiplier")]
    pub total_requests: f64,
    #[serde(default = "default_multiplier")]
    pub throttled_rate: f64,
    #[serde(default = "default_multiplier")]
    pub block_head_lag: f64,
    #[serde(default = "default_multiplier")]
    pub finalization_lag: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl Default for ScoreMultiplierConfig {
    fn default() -> Self {
        Self {
            network: default_wildcard(),
            method: default_wildcard(),
            overall: default_multiplier(),
            error_rate: default_multiplier(),
            resp_latency: default_multiplier(),
            total_requests: default_multiplier(),
            throttled_rate: default_multiplier(),
            block_head_lag: default_multiplier(),
            finalization_lag: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub score_multipliers: Vec<ScoreMultiplierConfig>,
}

/// Configuration of a single upstream node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub id: String,
    pub endpoint: String,
    #[serde(rename = "type", default)]
    pub upstream_type: UpstreamType,
    #[serde(default)]
    pub evm: EvmUpstreamConfig,
    #[serde(default)]
    pub ignore_methods: Vec<String>,
    #[serde(default)]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub auto_ignore_unsupported_methods: bool,
    #[serde(default)]
    pub failsafe: FailsafeConfig,
    #[serde(default)]
    pub rate_limit_budget: Option<String>,
    #[serde(default)]
    pub rate_limit_auto_tune: RateLimitAutoTuneConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// In-flight request cap for the HTTP transport.
    #[serde(default = "default_upstream_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// Largest response body accepted from the upstream.
    #[serde(default = "default_upstream_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_upstream_max_concurrent() -> usize {
    200
}

fn default_upstream_max_response_bytes() -> usize {
    64 * 1024 * 1024
}

impl UpstreamConfig {
    /// Minimal config for an EVM upstream, used by tests and bootstrap probes.
    #[must_use]
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            upstream_type: UpstreamType::default(),
            evm: EvmUpstreamConfig::default(),
            ignore_methods: Vec::new(),
            allow_methods: Vec::new(),
            auto_ignore_unsupported_methods: false,
            failsafe: FailsafeConfig::default(),
            rate_limit_budget: None,
            rate_limit_auto_tune: RateLimitAutoTuneConfig::default(),
            routing: RoutingConfig::default(),
            max_concurrent_requests: default_upstream_max_concurrent(),
            max_response_bytes: default_upstream_max_response_bytes(),
        }
    }
}

/// Root configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub rate_limiters: RateLimiterConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Use `__` as a separator for nested fields (e.g., `CONDUIT__SERVER__BIND_PORT=8080`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("server.bind_address", default_bind_address())?
            .set_default("server.bind_port", i64::from(default_bind_port()))?
            .set_default("server.max_timeout_ms", default_max_timeout_ms())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.format", default_log_format())?
            .set_default("metrics.enabled", true)?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("CONDUIT").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/config.toml`, or the path in `CONDUIT_CONFIG`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONDUIT_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed.
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.server.bind_address, self.server.bind_port).parse().map_err(|_| {
            format!("Invalid socket address: {}:{}", self.server.bind_address, self.server.bind_port)
        })
    }

    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.server.max_timeout_ms)
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string for the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.max_concurrent_requests == 0 {
            return Err("Max concurrent requests must be greater than 0".to_string());
        }
        if self.server.max_timeout_ms == 0 {
            return Err("Server max_timeout_ms must be greater than 0".to_string());
        }
        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        let mut budget_ids = HashSet::new();
        for budget in &self.rate_limiters.budgets {
            if !budget_ids.insert(budget.id.as_str()) {
                return Err(format!("Duplicate rate limit budget id: {}", budget.id));
            }
            for rule in &budget.rules {
                if rule.max_count == 0 || rule.period_ms == 0 {
                    return Err(format!(
                        "Rate limit rule '{}' in budget {} must have positive max_count and period_ms",
                        rule.method, budget.id
                    ));
                }
            }
        }

        let mut project_ids = HashSet::new();
        for project in &self.projects {
            if !project_ids.insert(project.id.as_str()) {
                return Err(format!("Duplicate project id: {}", project.id));
            }

            let mut upstream_ids = HashSet::new();
            for upstream in &project.upstreams {
                if !upstream_ids.insert(upstream.id.as_str()) {
                    return Err(format!(
                        "Duplicate upstream id {} in project {}",
                        upstream.id, project.id
                    ));
                }
                Self::validate_upstream(upstream, &budget_ids)?;
            }
        }

        Ok(())
    }

    fn validate_upstream(upstream: &UpstreamConfig, budgets: &HashSet<&str>) -> Result<(), String> {
        if !upstream.endpoint.starts_with("http") {
            return Err(format!("Invalid endpoint for upstream {}: {}", upstream.id, upstream.endpoint));
        }

        if let Some(budget) = &upstream.rate_limit_budget {
            if !budgets.contains(budget.as_str()) {
                return Err(format!(
                    "Upstream {} references unknown rate limit budget: {budget}",
                    upstream.id
                ));
            }
        }

        let tune = &upstream.rate_limit_auto_tune;
        if tune.enabled {
            if tune.adjustment_period_ms == 0 {
                return Err(format!("Upstream {}: adjustment_period_ms must be > 0", upstream.id));
            }
            if !(0.0..=1.0).contains(&tune.error_rate_threshold) {
                return Err(format!(
                    "Upstream {}: error_rate_threshold must be within [0, 1]",
                    upstream.id
                ));
            }
            if tune.increase_factor < 1.0 || !(0.0..=1.0).contains(&tune.decrease_factor) {
                return Err(format!(
                    "Upstream {}: increase_factor must be >= 1 and decrease_factor within [0, 1]",
                    upstream.id
                ));
            }
            if tune.min_budget > tune.max_budget {
                return Err(format!("Upstream {}: min_budget exceeds max_budget", upstream.id));
            }
        }

        let failsafe = &upstream.failsafe;
        if failsafe.timeout.as_ref().is_some_and(|t| t.duration_ms == 0) {
            return Err(format!("Upstream {}: timeout duration_ms must be > 0", upstream.id));
        }
        if let Some(retry) = &failsafe.retry {
            if retry.max_attempts == 0 {
                return Err(format!("Upstream {}: retry max_attempts must be > 0", upstream.id));
            }
            if retry.backoff_factor < 1.0 {
                return Err(format!("Upstream {}: retry backoff_factor must be >= 1", upstream.id));
            }
        }
        if let Some(breaker) = &failsafe.circuit_breaker {
            if breaker.failure_threshold_count == 0 ||
                breaker.failure_threshold_count > breaker.failure_threshold_capacity
            {
                return Err(format!(
                    "Upstream {}: circuit breaker needs 0 < failure_threshold_count <= failure_threshold_capacity",
                    upstream.id
                ));
            }
            if breaker.success_threshold_count == 0 {
                return Err(format!(
                    "Upstream {}: circuit breaker success_threshold_count must be > 0",
                    upstream.id
                ));
            }
        }
        if failsafe.hedge.as_ref().is_some_and(|h| h.max_count == 0) {
            return Err(format!("Upstream {}: hedge max_count must be > 0", upstream.id));
        }

        Ok(())
    }
}
