use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

/// Top-level Cadence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "cadence=info,warn".to_string() }

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Constant,
    #[default]
    Linear,
}

/// Retry configuration for wrapped steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub strategy: BackoffKind,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Growth factor for the linear strategy.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound of the random offset added to every delay (0 disables jitter).
    #[serde(default)]
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            strategy: BackoffKind::default(),
            initial_backoff_ms: default_initial_backoff(),
            multiplier: default_multiplier(),
            max_jitter_ms: 0,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 100 }
fn default_multiplier() -> f64 { 2.0 }

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures tolerated before the breaker opens. Negative never trips.
    #[serde(default = "default_breaker_max_tries")]
    pub max_tries: i64,
    /// Reset the failure count every `window_ms` milliseconds.
    #[serde(default)]
    pub window_ms: Option<u64>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_tries: default_breaker_max_tries(),
            window_ms: None,
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Option<Duration> {
        self.window_ms.map(Duration::from_millis)
    }
}

fn default_breaker_max_tries() -> i64 { -1 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound for a single step invocation.
    #[serde(default)]
    pub step_timeout_ms: Option<u64>,
    /// Upper bound for a whole run.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

impl TimeoutConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Fixed-window rate limiting: at most `count` un-stalled calls per `window_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub count: u32,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl CadenceConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CadenceError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| CadenceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the combinators cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !self.retry.multiplier.is_finite() || self.retry.multiplier <= 0.0 {
            return Err(CadenceError::Config(format!(
                "retry.multiplier must be a positive number, got {}",
                self.retry.multiplier
            )));
        }
        if let Some(rl) = &self.rate_limit {
            if rl.count == 0 {
                return Err(CadenceError::InvalidRateLimit);
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
