//! Invoice numbers and billing period metadata.
//!
//! Invoice numbers have the form `INV-{code}-{YYYYMM}-{NNNN}` where `code`
//! is a two-letter organization code and `NNNN` comes from an atomic
//! per-organization, per-month counter.
//!
//! # Example
//!
//! ```rust,ignore
//! use duesledger::billing::{BillingFrequency, InvoiceGenerator};
//!
//! let generator = InvoiceGenerator::new(store);
//! let meta = generator
//!     .generate_invoice_metadata("org_1", Some(date), BillingFrequency::Monthly, None)
//!     .await?;
//! assert_eq!(meta.invoice_number, "INV-MM-202501-0001");
//! ```

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::anniversary::add_months_clamped;
use super::error::BillingError;
use super::storage::{InvoiceSequenceStore, OrganizationStore};
use super::types::{BillingFrequency, Organization};
use super::validation::validate_months_credited;
use crate::error::Result;
use crate::utils::{local_date, parse_timezone, Clock, SystemClock};

/// Leading phrases dropped before deriving an organization code, longest first.
const NAME_PREFIXES: &[&str] = &[
    "islamic center of",
    "islamic centre of",
    "islamic society of",
    "islamic center",
    "islamic centre",
    "islamic society",
];

const CONNECTOR_WORDS: &[&str] = &["of", "the", "and", "for", "&"];

/// Invoice number and period of one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceMetadata {
    pub invoice_number: String,
    pub period_start: NaiveDate,
    /// Last day of the period (the day before the next period starts).
    pub period_end: NaiveDate,
    pub period_label: String,
    pub months_credited: u32,
    /// `YYYYMM` key the sequence was reserved under.
    pub year_month: String,
}

/// Two-letter code derived from an organization name.
///
/// ```rust
/// use duesledger::billing::org_code;
///
/// assert_eq!(org_code("Masjid Muhajireen"), "MM");
/// assert_eq!(org_code("Islamic Center of Greater Austin"), "GA");
/// ```
#[must_use]
pub fn org_code(name: &str) -> String {
    let trimmed = name.trim();
    let mut rest = trimmed;
    for prefix in NAME_PREFIXES {
        if let Some(head) = rest.get(..prefix.len()) {
            let boundary = rest[prefix.len()..]
                .chars()
                .next()
                .map_or(true, char::is_whitespace);
            if head.eq_ignore_ascii_case(prefix) && boundary {
                rest = rest[prefix.len()..].trim_start();
                break;
            }
        }
    }

    let words: Vec<&str> = rest
        .split_whitespace()
        .filter(|w| !CONNECTOR_WORDS.iter().any(|c| w.eq_ignore_ascii_case(c)))
        .filter(|w| w.chars().any(|c| c.is_ascii_alphabetic()))
        .collect();

    let mut code: String = if words.len() >= 2 {
        words
            .iter()
            .take(2)
            .filter_map(|w| w.chars().find(char::is_ascii_alphabetic))
            .collect()
    } else {
        let source = words.first().copied().unwrap_or(trimmed);
        let letters: String = source.chars().filter(char::is_ascii_alphabetic).take(2).collect();
        if letters.len() == 2 {
            letters
        } else {
            trimmed.chars().filter(char::is_ascii_alphabetic).take(2).collect()
        }
    };

    while code.len() < 2 {
        code.push('X');
    }
    code.to_ascii_uppercase()
}

/// `YYYYMM` key for the month containing `date`.
#[must_use]
pub fn year_month_key(date: NaiveDate) -> String {
    format!("{:04}{:02}", date.year(), date.month())
}

#[must_use]
pub fn format_invoice_number(code: &str, year_month: &str, sequence: u32) -> String {
    format!("INV-{}-{}-{:04}", code, year_month, sequence)
}

/// Last day of a period of `months` starting on `start`.
#[must_use]
pub fn period_end(start: NaiveDate, months: u32) -> NaiveDate {
    let next = add_months_clamped(start, months);
    next.pred_opt().unwrap_or(next)
}

/// Label for a regular period: `"January 2025"`, `"Jan 2025 - Jun 2025"`
/// or `"2025-2026"`.
#[must_use]
pub fn frequency_period_label(start: NaiveDate, frequency: BillingFrequency) -> String {
    match frequency {
        BillingFrequency::Monthly => start.format("%B %Y").to_string(),
        BillingFrequency::Biannual => {
            let last_month = add_months_clamped(start, 5);
            format!("{} - {}", start.format("%b %Y"), last_month.format("%b %Y"))
        }
        BillingFrequency::Annual => format!("{}-{}", start.year(), start.year() + 1),
    }
}

/// Label for an ad-hoc period from its actual bounds.
#[must_use]
pub fn ad_hoc_period_label(start: NaiveDate, end: NaiveDate) -> String {
    if start.year() == end.year() && start.month() == end.month() {
        start.format("%b %Y").to_string()
    } else {
        format!("{} - {}", start.format("%b %Y"), end.format("%b %Y"))
    }
}

/// Generates invoice metadata, reserving sequence numbers from storage.
pub struct InvoiceGenerator<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: OrganizationStore + InvoiceSequenceStore> InvoiceGenerator<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` to resolve "today" when no billing date is given.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Metadata for a regular period at `frequency`.
    ///
    /// `billing_date` defaults to today in `timezone`, or in the
    /// organization's timezone when none is given.
    ///
    /// # Errors
    ///
    /// NotFound if the organization does not exist, Dependency (retryable)
    /// if the sequence cannot be reserved.
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub async fn generate_invoice_metadata(
        &self,
        organization_id: &str,
        billing_date: Option<NaiveDate>,
        frequency: BillingFrequency,
        timezone: Option<&str>,
    ) -> Result<InvoiceMetadata> {
        let months = frequency.months();
        let label = |start: NaiveDate, _end: NaiveDate| frequency_period_label(start, frequency);
        self.generate(organization_id, billing_date, months, timezone, label).await
    }

    /// Metadata for an ad-hoc payment covering `months_credited` months.
    ///
    /// # Errors
    ///
    /// Validation if `months_credited` is outside 1..=120, otherwise as
    /// [`generate_invoice_metadata`](Self::generate_invoice_metadata).
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub async fn generate_ad_hoc_invoice_metadata(
        &self,
        organization_id: &str,
        billing_date: Option<NaiveDate>,
        months_credited: u32,
        timezone: Option<&str>,
    ) -> Result<InvoiceMetadata> {
        validate_months_credited(months_credited)?;
        self.generate(organization_id, billing_date, months_credited, timezone, ad_hoc_period_label)
            .await
    }

    /// Reserve an invoice number dated `date` without period metadata.
    ///
    /// Used for payments that do not cover a billing period, such as
    /// enrollment fees.
    pub async fn reserve_invoice_number(&self, organization_id: &str, date: NaiveDate) -> Result<String> {
        let org = self
            .store
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| BillingError::OrganizationNotFound {
                organization_id: organization_id.to_string(),
            })?;
        let (invoice_number, _) = self.reserve_for(&org, date).await?;
        Ok(invoice_number)
    }

    async fn reserve_for(&self, org: &Organization, date: NaiveDate) -> Result<(String, String)> {
        let year_month = year_month_key(date);
        let sequence = self
            .store
            .reserve_invoice_sequence(&org.id, &year_month)
            .await
            .map_err(|e| BillingError::SequenceReservationFailed {
                organization_id: org.id.clone(),
                year_month: year_month.clone(),
                message: e.to_string(),
            })?;
        let invoice_number = format_invoice_number(&org_code(&org.name), &year_month, sequence);
        debug!(invoice_number = %invoice_number, "Reserved invoice number");
        Ok((invoice_number, year_month))
    }

    async fn generate<F>(
        &self,
        organization_id: &str,
        billing_date: Option<NaiveDate>,
        months: u32,
        timezone: Option<&str>,
        label: F,
    ) -> Result<InvoiceMetadata>
    where
        F: Fn(NaiveDate, NaiveDate) -> String + Send,
    {
        let org = self
            .store
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| BillingError::OrganizationNotFound {
                organization_id: organization_id.to_string(),
            })?;

        let start = match billing_date {
            Some(date) => date,
            None => {
                let tz = match timezone {
                    Some(name) => parse_timezone(name)?,
                    None => org.tz()?,
                };
                local_date(self.clock.now(), tz)
            }
        };

        let (invoice_number, year_month) = self.reserve_for(&org, start).await?;
        let end = period_end(start, months);

        Ok(InvoiceMetadata {
            invoice_number,
            period_start: start,
            period_end: end,
            period_label: label(start, end),
            months_credited: months,
            year_month,
        })
    }
}
