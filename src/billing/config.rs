//! Billing configuration.
//!
//! The deployment-wide defaults live in [`BillingConfig`]; organizations can
//! override some of them through [`OrgBillingSettings`]. Services take the
//! config explicitly and never read ambient defaults.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::error::BillingError;
use super::reminders::ReminderSchedule;
use super::types::{OrgBillingSettings, Organization};
use crate::error;
use crate::utils::{parse_env_day_list, parse_env_with_prefix};

/// Processor fee parameters (percentage plus fixed per-transaction amount).
///
/// # Example
///
/// ```rust
/// use duesledger::billing::ProcessorFeeConfig;
/// use rust_decimal_macros::dec;
///
/// let fees = ProcessorFeeConfig::new(dec!(0.029), 30);
/// assert_eq!(fees.fixed_cents, 30);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorFeeConfig {
    /// Fraction of the charged amount, e.g. `0.029` for 2.9%.
    #[serde(default = "default_percent")]
    pub percent: Decimal,
    /// Fixed fee per transaction in minor units.
    #[serde(default = "default_fixed_cents")]
    pub fixed_cents: i64,
}

impl Default for ProcessorFeeConfig {
    fn default() -> Self {
        Self {
            percent: default_percent(),
            fixed_cents: default_fixed_cents(),
        }
    }
}

impl ProcessorFeeConfig {
    #[must_use]
    pub fn new(percent: Decimal, fixed_cents: i64) -> Self {
        Self { percent, fixed_cents }
    }

    /// Load processor fee settings from environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the key if a value is set but
    /// does not parse.
    pub fn from_env() -> error::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override only the fields whose environment variable is set.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the key if a value does not parse.
    pub fn apply_env(&mut self) -> error::Result<()> {
        if let Some(percent) = parse_env_with_prefix::<Decimal>("PROCESSOR_FEE_PERCENT")? {
            self.percent = percent;
        }
        if let Some(fixed) = parse_env_with_prefix("PROCESSOR_FEE_FIXED_CENTS")? {
            self.fixed_cents = fixed;
        }
        Ok(())
    }

    /// Check the percentage is in `[0, 1)` and the fixed fee is non-negative.
    pub fn validate(&self) -> Result<(), String> {
        if self.percent < Decimal::ZERO || self.percent >= Decimal::ONE {
            return Err(format!(
                "processor fee percent must be in [0, 1), got {}",
                self.percent
            ));
        }
        if self.fixed_cents < 0 {
            return Err(format!(
                "processor fixed fee must not be negative, got {}",
                self.fixed_cents
            ));
        }
        Ok(())
    }
}

fn default_percent() -> Decimal {
    dec!(0.029)
}

fn default_fixed_cents() -> i64 {
    30
}

/// Deployment-wide billing defaults.
///
/// # Example
///
/// ```rust
/// use duesledger::billing::BillingConfig;
///
/// let config = BillingConfig::new()
///     .eligibility_months(12)
///     .reminder_schedule(vec![5, 10, 20]);
/// assert_eq!(config.eligibility_months, 12);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Paid months after which a member becomes eligible.
    #[serde(default = "default_eligibility_months")]
    pub eligibility_months: u32,
    /// Days an unpaid payment may age before a lapse is recommended.
    #[serde(default = "default_lapse_days")]
    pub lapse_days: u32,
    /// Days after the due date at which reminders fire, ascending.
    #[serde(default = "default_reminder_schedule")]
    pub reminder_schedule: Vec<u32>,
    /// Reminders after which a payment is flagged for manual review.
    #[serde(default = "default_max_reminders")]
    pub max_reminders: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            eligibility_months: default_eligibility_months(),
            lapse_days: default_lapse_days(),
            reminder_schedule: default_reminder_schedule(),
            max_reminders: default_max_reminders(),
        }
    }
}

fn default_eligibility_months() -> u32 {
    6
}

fn default_lapse_days() -> u32 {
    60
}

fn default_reminder_schedule() -> Vec<u32> {
    vec![3, 7, 14]
}

fn default_max_reminders() -> u32 {
    3
}

impl BillingConfig {
    /// Create a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eligibility_months(mut self, months: u32) -> Self {
        self.eligibility_months = months;
        self
    }

    #[must_use]
    pub fn lapse_days(mut self, days: u32) -> Self {
        self.lapse_days = days;
        self
    }

    #[must_use]
    pub fn reminder_schedule(mut self, days: Vec<u32>) -> Self {
        self.reminder_schedule = days;
        self
    }

    #[must_use]
    pub fn max_reminders(mut self, max: u32) -> Self {
        self.max_reminders = max;
        self
    }

    /// Load billing defaults from environment variables.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the key if a value is set but
    /// does not parse.
    pub fn from_env() -> error::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override only the fields whose environment variable is set.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the key if a value does not parse.
    pub fn apply_env(&mut self) -> error::Result<()> {
        if let Some(months) = parse_env_with_prefix("ELIGIBILITY_MONTHS")? {
            self.eligibility_months = months;
        }
        if let Some(days) = parse_env_with_prefix("LAPSE_DAYS")? {
            self.lapse_days = days;
        }
        if let Some(days) = parse_env_day_list("REMINDER_SCHEDULE")? {
            self.reminder_schedule = days;
        }
        if let Some(max) = parse_env_with_prefix("MAX_REMINDERS")? {
            self.max_reminders = max;
        }
        Ok(())
    }

    /// Validate the defaults.
    pub fn validate(&self) -> Result<(), BillingError> {
        ReminderSchedule::new(self.reminder_schedule.clone(), self.max_reminders)?;
        Ok(())
    }

    /// Merge the organization's overrides over these defaults.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidReminderSchedule` if the resulting
    /// schedule is malformed.
    pub fn resolve_for(&self, org: &Organization) -> Result<ResolvedBillingConfig, BillingError> {
        self.resolve_settings(&org.billing_settings)
    }

    fn resolve_settings(
        &self,
        settings: &OrgBillingSettings,
    ) -> Result<ResolvedBillingConfig, BillingError> {
        let days = settings
            .reminder_schedule
            .clone()
            .unwrap_or_else(|| self.reminder_schedule.clone());

        Ok(ResolvedBillingConfig {
            eligibility_months: settings.eligibility_months.unwrap_or(self.eligibility_months),
            lapse_days: settings.lapse_days.unwrap_or(self.lapse_days),
            reminder_schedule: ReminderSchedule::new(days, self.max_reminders)?,
        })
    }
}

/// Billing settings effective for one organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBillingConfig {
    pub eligibility_months: u32,
    pub lapse_days: u32,
    pub reminder_schedule: ReminderSchedule,
}
