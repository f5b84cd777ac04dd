use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::billing::{BillingConfig, ProcessorFeeConfig};
use crate::error::{DuesError, Result};
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};

/// Main configuration for a duesledger deployment
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub processor: ProcessorFeeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

/// Timer settings for the background billing scheduler
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Run the scheduler at all
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// Seconds between passes
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            interval_seconds: default_interval_seconds(),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Load scheduler configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the key if a value does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override only the fields whose environment variable is set
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the key if a value does not parse.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(enabled) = parse_env_with_prefix("SCHEDULER_ENABLED")? {
            self.enabled = enabled;
        }
        if let Some(seconds) = parse_env_with_prefix("SCHEDULER_INTERVAL_SECONDS")? {
            self.interval_seconds = seconds;
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_interval_seconds() -> u64 {
    60 * 60 // hourly
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
    /// First environment value that failed to parse, reported by `build()`
    env_error: Option<DuesError>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            env_error: None,
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_billing(mut self, billing: BillingConfig) -> Self {
        self.config.billing = billing;
        self
    }

    pub fn with_processor_fees(mut self, processor: ProcessorFeeConfig) -> Self {
        self.config.processor = processor;
        self
    }

    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler.interval_seconds = interval.as_secs();
        self
    }

    pub fn with_scheduler_enabled(mut self, enabled: bool) -> Self {
        self.config.scheduler.enabled = enabled;
        self
    }

    /// Load configuration from environment variables with DUESLEDGER_ prefix
    ///
    /// Only variables that are set override the builder's current values.
    /// A value that fails to parse is reported by [`build`](Self::build).
    pub fn from_env(mut self) -> Self {
        if let Err(e) = self.apply_env() {
            if self.env_error.is_none() {
                self.env_error = Some(e);
            }
        }
        self
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = parse_env_with_prefix("LOG_JSON")? {
            self.config.logging.json = json;
        }

        self.config.billing.apply_env()?;
        self.config.processor.apply_env()?;
        self.config.scheduler.apply_env()
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns a configuration error if any setting is invalid:
    /// - Unknown log level
    /// - Reminder schedule empty, unsorted or containing zero
    /// - Max reminders of zero
    /// - Processor fee percent outside `[0, 1)` or negative fixed fee
    /// - Scheduler interval of zero
    /// - An environment variable that failed to parse
    pub fn build(self) -> Result<Config> {
        if let Some(e) = self.env_error {
            return Err(e);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(DuesError::configuration(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        self.config.billing.validate()?;

        self.config
            .processor
            .validate()
            .map_err(DuesError::configuration)?;

        if self.config.scheduler.interval_seconds == 0 {
            return Err(DuesError::configuration(
                "Scheduler interval must be greater than 0",
            ));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
