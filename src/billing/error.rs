//! Billing-specific error types.
//!
//! Provides granular error types for billing operations so callers get
//! structured detail, while still converting into [`DuesError`] for the
//! coarse taxonomy.

use std::fmt;

use crate::error::DuesError;

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Validation errors
    /// An amount was negative or otherwise unusable.
    InvalidAmount { field: String, reason: String },
    /// An ad-hoc months-credited count outside the allowed range.
    InvalidMonthsCredited { months: u32 },
    /// A date string could not be parsed as YYYY-MM-DD.
    InvalidDate { value: String },
    /// An identifier failed validation.
    InvalidId { id: String, reason: String },
    /// Records from two organizations were combined.
    TenantMismatch { expected: String, found: String },
    /// The requested status change is not on the membership graph.
    InvalidStatusTransition { from: String, to: String },

    // Lookup errors
    /// Organization not found.
    OrganizationNotFound { organization_id: String },
    /// Plan not found.
    PlanNotFound { plan_id: String },
    /// Membership not found.
    MembershipNotFound { membership_id: String },
    /// Payment not found.
    PaymentNotFound { payment_id: String },
    /// Application not found.
    ApplicationNotFound { application_id: String },

    // Conflicts
    /// Another reviewer already approved or rejected the application.
    ApplicationAlreadyProcessed { application_id: String, status: String },
    /// The payment already succeeded and can no longer change.
    PaymentAlreadySettled { payment_id: String },

    // Dependency errors
    /// The invoice sequence counter could not be incremented.
    SequenceReservationFailed {
        organization_id: String,
        year_month: String,
        message: String,
    },
    /// A storage call failed.
    Storage { operation: String, message: String },

    // Configuration errors
    /// The organization's platform fee schedule is unusable.
    InvalidFeeSchedule { organization_id: String, reason: String },
    /// The reminder schedule is empty, unsorted or non-positive.
    InvalidReminderSchedule { reason: String },
    /// The organization's timezone is not a known IANA zone.
    InvalidTimezone { timezone: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAmount { field, reason } => {
                write!(f, "Invalid amount for '{}': {}", field, reason)
            }
            Self::InvalidMonthsCredited { months } => {
                write!(f, "Invalid months credited: {} (must be 1-120)", months)
            }
            Self::InvalidDate { value } => {
                write!(f, "Invalid date '{}': expected YYYY-MM-DD", value)
            }
            Self::InvalidId { id, reason } => {
                write!(f, "Invalid ID '{}': {}", id, reason)
            }
            Self::TenantMismatch { expected, found } => {
                write!(f, "Record belongs to organization '{}', expected '{}'", found, expected)
            }
            Self::InvalidStatusTransition { from, to } => {
                write!(f, "Cannot move membership from '{}' to '{}'", from, to)
            }
            Self::OrganizationNotFound { organization_id } => {
                write!(f, "Organization not found: {}", organization_id)
            }
            Self::PlanNotFound { plan_id } => {
                write!(f, "Plan not found: {}", plan_id)
            }
            Self::MembershipNotFound { membership_id } => {
                write!(f, "Membership not found: {}", membership_id)
            }
            Self::PaymentNotFound { payment_id } => {
                write!(f, "Payment not found: {}", payment_id)
            }
            Self::ApplicationNotFound { application_id } => {
                write!(f, "Application not found: {}", application_id)
            }
            Self::ApplicationAlreadyProcessed { application_id, status } => {
                write!(f, "Application '{}' was already {}", application_id, status)
            }
            Self::PaymentAlreadySettled { payment_id } => {
                write!(f, "Payment '{}' is already settled", payment_id)
            }
            Self::SequenceReservationFailed { organization_id, year_month, message } => {
                write!(
                    f,
                    "Could not reserve invoice sequence for '{}' in {}: {}",
                    organization_id, year_month, message
                )
            }
            Self::Storage { operation, message } => {
                write!(f, "Storage error during '{}': {}", operation, message)
            }
            Self::InvalidFeeSchedule { organization_id, reason } => {
                write!(f, "Invalid platform fee schedule for '{}': {}", organization_id, reason)
            }
            Self::InvalidReminderSchedule { reason } => {
                write!(f, "Invalid reminder schedule: {}", reason)
            }
            Self::InvalidTimezone { timezone } => {
                write!(f, "Invalid timezone: {}", timezone)
            }
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for DuesError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::InvalidAmount { .. }
            | BillingError::InvalidMonthsCredited { .. }
            | BillingError::InvalidDate { .. }
            | BillingError::InvalidId { .. }
            | BillingError::TenantMismatch { .. }
            | BillingError::InvalidStatusTransition { .. } => DuesError::Validation(err.to_string()),

            BillingError::OrganizationNotFound { .. }
            | BillingError::PlanNotFound { .. }
            | BillingError::MembershipNotFound { .. }
            | BillingError::PaymentNotFound { .. }
            | BillingError::ApplicationNotFound { .. } => DuesError::NotFound(err.to_string()),

            BillingError::ApplicationAlreadyProcessed { .. }
            | BillingError::PaymentAlreadySettled { .. } => DuesError::Conflict(err.to_string()),

            BillingError::SequenceReservationFailed { .. } | BillingError::Storage { .. } => {
                DuesError::Dependency(err.to_string())
            }

            BillingError::InvalidFeeSchedule { .. }
            | BillingError::InvalidReminderSchedule { .. }
            | BillingError::InvalidTimezone { .. } => DuesError::Configuration(err.to_string()),
        }
    }
}

impl BillingError {
    /// Check if this error was caused by the caller's input.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAmount { .. }
                | Self::InvalidMonthsCredited { .. }
                | Self::InvalidDate { .. }
                | Self::InvalidId { .. }
                | Self::TenantMismatch { .. }
                | Self::InvalidStatusTransition { .. }
                | Self::OrganizationNotFound { .. }
                | Self::PlanNotFound { .. }
                | Self::MembershipNotFound { .. }
                | Self::PaymentNotFound { .. }
                | Self::ApplicationNotFound { .. }
                | Self::ApplicationAlreadyProcessed { .. }
                | Self::PaymentAlreadySettled { .. }
        )
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SequenceReservationFailed { .. } | Self::Storage { .. }
        )
    }

    /// Shorthand for a storage failure during `operation`.
    pub fn storage(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BillingError::PaymentNotFound {
            payment_id: "pay_1".to_string(),
        };
        assert_eq!(err.to_string(), "Payment not found: pay_1");

        let err = BillingError::InvalidMonthsCredited { months: 0 };
        assert_eq!(err.to_string(), "Invalid months credited: 0 (must be 1-120)");
    }

    #[test]
    fn test_error_classification() {
        let err = BillingError::OrganizationNotFound {
            organization_id: "org_1".to_string(),
        };
        assert!(err.is_client_error());
        assert!(!err.is_retryable());

        let err = BillingError::SequenceReservationFailed {
            organization_id: "org_1".to_string(),
            year_month: "202501".to_string(),
            message: "connection reset".to_string(),
        };
        assert!(!err.is_client_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_convert_to_dues_error() {
        let err: DuesError = BillingError::MembershipNotFound {
            membership_id: "mem_1".to_string(),
        }
        .into();
        assert!(matches!(err, DuesError::NotFound(_)));

        let err: DuesError = BillingError::ApplicationAlreadyProcessed {
            application_id: "app_1".to_string(),
            status: "approved".to_string(),
        }
        .into();
        assert!(matches!(err, DuesError::Conflict(_)));

        let err: DuesError = BillingError::storage("reserve_invoice_sequence", "timeout").into();
        assert!(matches!(err, DuesError::Dependency(_)));
        assert!(err.is_retryable());

        let err: DuesError = BillingError::InvalidReminderSchedule {
            reason: "empty".to_string(),
        }
        .into();
        assert!(matches!(err, DuesError::Configuration(_)));
    }
}
