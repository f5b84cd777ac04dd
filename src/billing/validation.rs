//! Input validation for billing operations.
//!
//! Everything here runs before any mutation, so a rejected request leaves
//! storage untouched.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::error::BillingError;
use super::types::{Organization, Plan};
use crate::error::Result;

/// Maximum length for record IDs.
const MAX_ID_LENGTH: usize = 128;

/// Maximum months an ad-hoc payment may credit.
pub const MAX_MONTHS_CREDITED: u32 = 120;

/// Valid ISO 4217 currency codes (lowercase).
const VALID_CURRENCIES: &[&str] = &[
    "usd", "eur", "gbp", "cad", "aud", "nzd", "sgd", "myr", "idr", "inr",
    "pkr", "bdt", "aed", "sar", "qar", "kwd", "try", "egp", "zar", "ngn",
];

/// Validate a record ID.
///
/// IDs must be non-empty, at most 128 characters, and contain only
/// alphanumerics, underscores and hyphens.
///
/// # Errors
///
/// Returns `BillingError::InvalidId` if validation fails.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(BillingError::InvalidId {
            id: String::new(),
            reason: "id cannot be empty".to_string(),
        }
        .into());
    }

    if id.len() > MAX_ID_LENGTH {
        return Err(BillingError::InvalidId {
            id: sanitize_for_error(id),
            reason: format!("id exceeds maximum length of {}", MAX_ID_LENGTH),
        }
        .into());
    }

    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(BillingError::InvalidId {
            id: sanitize_for_error(id),
            reason: "id contains invalid characters (only alphanumeric, underscore, and hyphen allowed)".to_string(),
        }
        .into());
    }

    Ok(())
}

/// Validate an ad-hoc months-credited count (1..=120).
pub fn validate_months_credited(months: u32) -> Result<()> {
    if months == 0 || months > MAX_MONTHS_CREDITED {
        return Err(BillingError::InvalidMonthsCredited { months }.into());
    }
    Ok(())
}

/// Parse a `YYYY-MM-DD` calendar date.
///
/// ```rust
/// use duesledger::billing::parse_billing_date;
///
/// assert!(parse_billing_date("2025-01-31").is_ok());
/// assert!(parse_billing_date("2025-02-30").is_err());
/// ```
pub fn parse_billing_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        BillingError::InvalidDate {
            value: sanitize_for_error(value),
        }
        .into()
    })
}

/// Reject a record that belongs to another organization.
pub fn ensure_same_tenant(expected: &str, found: &str) -> Result<()> {
    if expected != found {
        return Err(BillingError::TenantMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Validate a plan's prices and ownership fields.
pub fn validate_plan(plan: &Plan) -> Result<()> {
    validate_id(&plan.id)?;
    validate_id(&plan.organization_id)?;

    let prices = [
        ("monthly_price_cents", plan.monthly_price_cents),
        ("biannual_price_cents", plan.biannual_price_cents),
        ("annual_price_cents", plan.annual_price_cents),
        ("enrollment_fee_cents", plan.enrollment_fee_cents),
    ];
    for (field, cents) in prices {
        if cents < 0 {
            return Err(BillingError::InvalidAmount {
                field: field.to_string(),
                reason: format!("must not be negative, got {}", cents),
            }
            .into());
        }
    }

    Ok(())
}

/// Validate an organization's billing configuration.
///
/// # Errors
///
/// Configuration errors for an unknown timezone, an unsupported currency
/// or a negative platform fee.
pub fn validate_organization(org: &Organization) -> Result<()> {
    validate_id(&org.id)?;
    org.tz()?;

    let currency = org.currency.to_lowercase();
    if !VALID_CURRENCIES.contains(&currency.as_str()) {
        return Err(BillingError::InvalidFeeSchedule {
            organization_id: org.id.clone(),
            reason: format!("unsupported currency '{}'", sanitize_for_error(&org.currency)),
        }
        .into());
    }

    let fees = &org.platform_fees;
    let entries = [
        ("monthly", fees.monthly),
        ("biannual", fees.biannual),
        ("annual", fees.annual),
        ("enrollment", fees.enrollment),
    ];
    for (name, fee) in entries {
        if fee < Decimal::ZERO {
            return Err(BillingError::InvalidFeeSchedule {
                organization_id: org.id.clone(),
                reason: format!("{} platform fee is negative", name),
            }
            .into());
        }
    }

    Ok(())
}

/// Sanitize a string for error messages to prevent log injection.
fn sanitize_for_error(s: &str) -> String {
    let sanitized: String = s
        .chars()
        .take(50)
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '?' })
        .collect();

    if s.chars().count() > 50 {
        format!("{}...", sanitized)
    } else {
        sanitized
    }
}
