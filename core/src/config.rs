//! Configuration for the resilience layer.
//!
//! Provides environment-based configuration with validation and secrets management.
//!
//! # Features
//!
//! - Environment-based defaults (development, staging, production)
//! - Optional TOML file layered over the defaults
//! - Secrets (`REDIS_URL`) read from environment variables, never from files
//! - Validation with clear error messages
//!
//! # Example
//!
//! ```no_run
//! use pos_resilience_core::config::{Environment, ResilienceConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from CONFIG_ENV (defaults to development) and RESILIENCE_CONFIG
//! let config = ResilienceConfig::from_env()?;
//!
//! // Or load explicitly
//! let config = ResilienceConfig::load(Environment::Production)?;
//!
//! println!("Rate limit: {} per {:?}", config.rate_limit.limit, config.rate_limit.window());
//! # Ok(())
//! # }
//! ```

use crate::error::ConfigError;
use crate::store::AdmissionMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development environment (local)
    #[default]
    Development,
    /// Staging environment (pre-production)
    Staging,
    /// Production environment
    Production,
}

impl Environment {
    /// Check if this is production environment
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if this is development environment
    #[must_use]
    pub const fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "staging" | "stage" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Production),
            _ => Err(ConfigError::InvalidEnvironment(s.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens
    pub max_failures: u32,
    /// Cooldown before a trial call is allowed, in milliseconds
    pub reset_timeout_ms: u64,
}

impl CircuitBreakerSettings {
    /// Validate circuit breaker configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_failures == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.max_failures must be > 0".to_string(),
            ));
        }
        if self.reset_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.reset_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Get reset timeout as Duration
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Bulkhead configuration: one capacity per isolated resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadSettings {
    /// Named pools (e.g. `database`, `payments`) and their capacities
    pub pools: BTreeMap<String, usize>,
    /// Capacity used for a pool that is not listed
    pub default_max_concurrency: usize,
}

impl BulkheadSettings {
    /// Validate bulkhead configuration
    ///
    /// # Errors
    ///
    /// Returns error if any capacity is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_concurrency == 0 {
            return Err(ConfigError::Validation(
                "bulkheads.default_max_concurrency must be > 0".to_string(),
            ));
        }
        if let Some((name, _)) = self.pools.iter().find(|(_, cap)| **cap == 0) {
            return Err(ConfigError::Validation(format!(
                "bulkheads.pools.{name} must be > 0"
            )));
        }
        Ok(())
    }

    /// Capacity for `name`, falling back to the default.
    #[must_use]
    pub fn capacity(&self, name: &str) -> usize {
        self.pools
            .get(name)
            .copied()
            .unwrap_or(self.default_max_concurrency)
    }
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        let pools = [("database", 20), ("payments", 10), ("downstream", 50)]
            .into_iter()
            .map(|(name, cap)| (name.to_string(), cap))
            .collect();
        Self {
            pools,
            default_max_concurrency: 10,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolSettings {
    /// Number of persistent workers
    pub workers: usize,
    /// Bounded queue capacity
    pub queue_size: usize,
}

impl WorkerPoolSettings {
    /// Validate worker pool configuration
    ///
    /// # Errors
    ///
    /// Returns error if there are no workers
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Validation(
                "worker_pool.workers must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_size: 100,
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Requests allowed per identifier per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Prefix for store keys
    pub key_prefix: String,
}

impl RateLimitSettings {
    /// Validate rate limiter configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.limit must be > 0".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.window_secs must be > 0".to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "rate_limit.key_prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Get window as Duration
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            limit: 100,
            window_secs: 60,
            key_prefix: "ratelimit".to_string(),
        }
    }
}

/// Request coalescer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescerSettings {
    /// Default TTL for cached results, in milliseconds
    pub ttl_ms: u64,
    /// Capacity of the in-memory result cache
    pub max_entries: usize,
}

impl CoalescerSettings {
    /// Validate coalescer configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_ms == 0 {
            return Err(ConfigError::Validation(
                "coalescer.ttl_ms must be > 0".to_string(),
            ));
        }
        if self.max_entries == 0 {
            return Err(ConfigError::Validation(
                "coalescer.max_entries must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Get TTL as Duration
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for CoalescerSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            max_entries: 10_000,
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Redis URL (from environment variable for security)
    #[serde(skip)]
    pub url: Option<String>,
    /// How the window store performs admission
    pub admission: AdmissionMode,
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Enable metrics
    pub metrics_enabled: bool,
    /// Prometheus listen address
    pub metrics_addr: String,
}

impl ObservabilitySettings {
    /// Validate observability configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "invalid log_level: {}. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.metrics_enabled && self.metrics_addr.is_empty() {
            return Err(ConfigError::Validation(
                "metrics_addr is required when metrics are enabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Complete resilience configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Deployment environment
    pub environment: Environment,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerSettings,
    /// Bulkhead configuration
    pub bulkheads: BulkheadSettings,
    /// Worker pool configuration
    pub worker_pool: WorkerPoolSettings,
    /// Rate limiter configuration
    pub rate_limit: RateLimitSettings,
    /// Request coalescer configuration
    pub coalescer: CoalescerSettings,
    /// Redis configuration
    pub redis: RedisSettings,
    /// Observability configuration
    pub observability: ObservabilitySettings,
}

impl ResilienceConfig {
    /// Load configuration from environment
    ///
    /// Reads `CONFIG_ENV` (defaults to "development"). When `RESILIENCE_CONFIG` names a
    /// TOML file it is layered over the environment defaults.
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be loaded or is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_str = std::env::var("CONFIG_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = env_str.parse()?;

        let mut config = match std::env::var("RESILIENCE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::for_environment(environment),
        };
        config.environment = environment;
        config.finish()?;
        Ok(config)
    }

    /// Load configuration for specific environment
    ///
    /// # Errors
    ///
    /// Returns error if required secrets are missing or the configuration is invalid
    pub fn load(environment: Environment) -> Result<Self, ConfigError> {
        let mut config = Self::for_environment(environment);
        config.finish()?;
        Ok(config)
    }

    /// Defaults with per-environment overrides, no secrets and no validation.
    #[must_use]
    pub fn for_environment(environment: Environment) -> Self {
        let mut config = Self {
            environment,
            ..Self::default()
        };

        match environment {
            Environment::Development => {
                config.observability.log_level = "debug".to_string();
                config.redis.admission = AdmissionMode::Sequential;
            }
            Environment::Staging => {
                config.observability.log_level = "info".to_string();
            }
            Environment::Production => {
                config.observability.log_level = "warn".to_string();
                config.circuit_breaker.max_failures = 3; // Stricter in prod
            }
        }

        config
    }

    /// Parse a TOML document. Missing sections keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is malformed
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        toml::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path)?;
        Self::from_toml(&document)
    }

    fn finish(&mut self) -> Result<(), ConfigError> {
        self.load_overrides()?;
        self.load_secrets()?;
        self.validate()
    }

    /// Numeric overrides from environment variables
    fn load_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw) = std::env::var("RATE_LIMIT_REQUESTS") {
            self.rate_limit.limit = raw.parse().map_err(|_| {
                ConfigError::Parse(format!("RATE_LIMIT_REQUESTS is not a number: {raw}"))
            })?;
        }
        Ok(())
    }

    /// Load secrets from environment variables
    ///
    /// # Errors
    ///
    /// Returns error if required secrets are missing
    fn load_secrets(&mut self) -> Result<(), ConfigError> {
        // Redis URL (required in staging/prod)
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis.url = Some(url);
        } else if !self.environment.is_development() {
            return Err(ConfigError::EnvVarNotSet("REDIS_URL".to_string()));
        }
        Ok(())
    }

    /// Validate entire configuration
    ///
    /// # Errors
    ///
    /// Returns error if any configuration section is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.bulkheads.validate()?;
        self.worker_pool.validate()?;
        self.rate_limit.validate()?;
        self.coalescer.validate()?;
        self.observability.validate()?;
        Ok(())
    }

    /// Check if running in production
    #[must_use]
    pub const fn is_production(&self) -> bool {
        self.environment.is_production()
    }
}
