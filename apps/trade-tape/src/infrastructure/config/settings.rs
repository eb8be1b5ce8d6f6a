//! Tape Configuration Settings
//!
//! Configuration types for the trade tape service, loaded from environment
//! variables. Unparseable values fall back to their defaults; values that
//! parse but make no sense are rejected by [`TapeConfig::validate`].

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::application::services::locator::DEFAULT_MAX_ITERATIONS;
use crate::application::services::{ReconcilerConfig, RetryConfig, SizerConfig, StartPoint};
use crate::infrastructure::broadcast::DEFAULT_CAPACITY;

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Retry settings shared by every REST and realtime scope.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Total attempts per scope, including the first.
    pub max_attempts: u32,
    /// Unit of the quadratic delay schedule.
    pub base_delay: Duration,
    /// Cap on a single delay.
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay: defaults.base_delay,
            max_delay: defaults.max_delay,
        }
    }
}

/// Adaptive window sizer settings.
#[derive(Debug, Clone)]
pub struct SizerSettings {
    /// Amount a shrink subtracts at or below the halving threshold.
    pub shrink_step: f64,
    /// Coefficient above which a shrink halves.
    pub halving_threshold: f64,
    /// Boost after skipping an empty id range.
    pub gap_boost: f64,
    /// Fill ratio under which a batch counts as small.
    pub catch_up_ratio: f64,
    /// Upper bound of the coefficient.
    pub max_coefficient: f64,
}

impl Default for SizerSettings {
    fn default() -> Self {
        let defaults = SizerConfig::default();
        Self {
            shrink_step: defaults.shrink_step,
            halving_threshold: defaults.halving_threshold,
            gap_boost: defaults.gap_boost,
            catch_up_ratio: defaults.catch_up_ratio,
            max_coefficient: defaults.max_coefficient,
        }
    }
}

/// Broadcast channel settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Per-market channel capacity in trades.
    pub capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Simulated venue settings for the service binary.
#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    /// Markets to simulate.
    pub markets: Vec<String>,
    /// Trades of history per market at startup.
    pub history: usize,
    /// Trades per REST response.
    pub page_size: usize,
    /// Interval between live trades.
    pub trade_interval: Duration,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            markets: vec!["BTC-USD".to_string()],
            history: 5_000,
            page_size: 100,
            trade_interval: Duration::from_millis(250),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default)]
pub struct TapeConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Retry settings.
    pub retry: RetrySettings,
    /// Window sizer settings.
    pub sizer: SizerSettings,
    /// Broadcast channel settings.
    pub broadcast: BroadcastSettings,
    /// Where backfill starts.
    pub start: StartPoint,
    /// Simulated venue settings.
    pub simulator: SimulatorSettings,
}

impl TapeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `TAPE_START` cannot be parsed or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup };

        let server = ServerSettings {
            health_port: env.parse("TAPE_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let retry = RetrySettings {
            max_attempts: env.parse(
                "TAPE_RETRY_MAX_ATTEMPTS",
                RetrySettings::default().max_attempts,
            ),
            base_delay: env.duration_millis(
                "TAPE_RETRY_BASE_DELAY_MS",
                RetrySettings::default().base_delay,
            ),
            max_delay: env.duration_secs(
                "TAPE_RETRY_MAX_DELAY_SECS",
                RetrySettings::default().max_delay,
            ),
        };

        let sizer = SizerSettings {
            shrink_step: env.parse("TAPE_SIZER_SHRINK_STEP", SizerSettings::default().shrink_step),
            halving_threshold: env.parse(
                "TAPE_SIZER_HALVING_THRESHOLD",
                SizerSettings::default().halving_threshold,
            ),
            gap_boost: env.parse("TAPE_SIZER_GAP_BOOST", SizerSettings::default().gap_boost),
            catch_up_ratio: env.parse(
                "TAPE_SIZER_CATCH_UP_RATIO",
                SizerSettings::default().catch_up_ratio,
            ),
            max_coefficient: env.parse(
                "TAPE_SIZER_MAX_COEFFICIENT",
                SizerSettings::default().max_coefficient,
            ),
        };

        let broadcast = BroadcastSettings {
            capacity: env.parse(
                "TAPE_BROADCAST_CAPACITY",
                BroadcastSettings::default().capacity,
            ),
        };

        let start = env
            .get("TAPE_START")
            .map(|value| parse_start_point(&value))
            .transpose()?
            .unwrap_or_default();

        let simulator = SimulatorSettings {
            markets: env
                .get("TAPE_SIM_MARKETS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|market| !market.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| SimulatorSettings::default().markets),
            history: env.parse("TAPE_SIM_HISTORY", SimulatorSettings::default().history),
            page_size: env.parse("TAPE_SIM_PAGE_SIZE", SimulatorSettings::default().page_size),
            trade_interval: env.duration_millis(
                "TAPE_SIM_TRADE_INTERVAL_MS",
                SimulatorSettings::default().trade_interval,
            ),
        };

        let config = Self {
            server,
            retry,
            sizer,
            broadcast,
            start,
            simulator,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(invalid("TAPE_RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(invalid(
                "TAPE_RETRY_BASE_DELAY_MS",
                "must not exceed TAPE_RETRY_MAX_DELAY_SECS",
            ));
        }
        if self.broadcast.capacity == 0 {
            return Err(invalid("TAPE_BROADCAST_CAPACITY", "must be at least 1"));
        }
        if self.sizer.shrink_step <= 0.0 {
            return Err(invalid("TAPE_SIZER_SHRINK_STEP", "must be positive"));
        }
        if self.sizer.max_coefficient < 1.0 {
            return Err(invalid("TAPE_SIZER_MAX_COEFFICIENT", "must be at least 1"));
        }
        if self.sizer.halving_threshold > self.sizer.max_coefficient {
            return Err(invalid(
                "TAPE_SIZER_HALVING_THRESHOLD",
                "must not exceed TAPE_SIZER_MAX_COEFFICIENT",
            ));
        }
        if !(0.0..=1.0).contains(&self.sizer.catch_up_ratio) {
            return Err(invalid("TAPE_SIZER_CATCH_UP_RATIO", "must be within 0..=1"));
        }
        if self.sizer.gap_boost < 0.0 {
            return Err(invalid("TAPE_SIZER_GAP_BOOST", "must not be negative"));
        }
        if self.simulator.page_size == 0 {
            return Err(invalid("TAPE_SIM_PAGE_SIZE", "must be at least 1"));
        }
        if self.simulator.markets.is_empty() {
            return Err(invalid("TAPE_SIM_MARKETS", "must name at least one market"));
        }
        Ok(())
    }

    /// Pipeline configuration shared by every market.
    #[must_use]
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            retry: RetryConfig {
                max_attempts: self.retry.max_attempts,
                base_delay: self.retry.base_delay,
                max_delay: self.retry.max_delay,
                ..RetryConfig::default()
            },
            sizer: SizerConfig {
                shrink_step: self.sizer.shrink_step,
                halving_threshold: self.sizer.halving_threshold,
                gap_boost: self.sizer.gap_boost,
                catch_up_ratio: self.sizer.catch_up_ratio,
                max_coefficient: self.sizer.max_coefficient,
                ..SizerConfig::default()
            },
            broadcast_capacity: self.broadcast.capacity,
            start: self.start,
            locator_max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable holds an unusable value.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse `resume`, `first`, or an RFC 3339 timestamp.
///
/// # Errors
///
/// [`ConfigError::EmptyValue`] for a blank value, [`ConfigError::Invalid`]
/// for anything else unrecognised.
pub fn parse_start_point(value: &str) -> Result<StartPoint, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyValue("TAPE_START".to_string()));
    }
    match trimmed.to_lowercase().as_str() {
        "resume" => Ok(StartPoint::Resume),
        "first" => Ok(StartPoint::FirstTrade),
        _ => DateTime::parse_from_rfc3339(trimmed)
            .map(|timestamp| StartPoint::Since(timestamp.with_timezone(&Utc)))
            .map_err(|error| invalid("TAPE_START", &error.to_string())),
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
