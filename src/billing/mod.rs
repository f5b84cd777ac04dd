//! Membership dues billing.
//!
//! Computes fees, numbers invoices, schedules reminders and settles
//! payments for many organizations sharing one deployment. Every service is
//! generic over a storage backend implementing [`BillingStore`];
//! [`InMemoryBillingStore`] ships for tests and small deployments.
//!
//! # Example
//!
//! ```rust,ignore
//! use duesledger::billing::{
//!     BillingConfig, BillingRun, FeeCalculator, InMemoryBillingStore, PaymentMethod,
//!     SettleRequest, SettlementService,
//! };
//!
//! let store = InMemoryBillingStore::new();
//! let config = BillingConfig::default();
//!
//! // Create pending dues payments for everyone due today
//! let run = BillingRun::new(store.clone(), config.clone(), FeeCalculator::default());
//! let report = run.run_for_organization("org_1", today).await?;
//!
//! // Settle one when the money arrives
//! let settlement = SettlementService::new(store.clone(), config);
//! let result = settlement
//!     .settle_payment(SettleRequest::new(&report.created[0], PaymentMethod::Cash, now))
//!     .await?;
//! ```

pub mod anniversary;
pub mod audit;
pub mod config;
pub mod error;
pub mod fees;
pub mod invoice;
pub mod memory;
pub mod onboarding;
pub mod reminders;
pub mod run;
pub mod settlement;
pub mod storage;
pub mod types;
pub mod validation;
pub mod webhook;

// Record exports
pub use types::{
    Application, ApplicationStatus, BillingFrequency, EnrollmentFeeStatus, Membership,
    MembershipStatus, OrgBillingSettings, Organization, ParseEnumError, Payment, PaymentMethod,
    PaymentStatus, PaymentType, Plan, PlatformFeeSchedule,
};

// Config exports
pub use config::{BillingConfig, ProcessorFeeConfig, ResolvedBillingConfig};

// Fee exports
pub use fees::{calculate_fees, platform_fee_for, FeeBreakdown, FeeCalculator};

// Date exports
pub use anniversary::{
    add_months_clamped, add_months_on_anniversary, calculate_next_billing_date,
    is_last_day_of_month, last_day_of_month, next_anniversary_date,
};

// Invoice exports
pub use invoice::{org_code, InvoiceGenerator, InvoiceMetadata};

// Reminder exports
pub use reminders::{
    is_reminder_due, record_reminder, ReminderDecision, ReminderNotifier, ReminderProcessor,
    ReminderRunReport, ReminderSchedule, ReminderState, TracingReminderNotifier,
};

// Settlement exports
pub use settlement::{
    lapse_recommendation, LapseReason, LapseRecommendation, SettleRequest, SettlementOutcome,
    SettlementResult, SettlementService,
};

// Billing run exports
pub use run::{BillingFailure, BillingRun, BillingRunReport, EnrollmentFeeOutcome};

// Onboarding exports
pub use onboarding::{
    OnboardingNotifier, OnboardingReport, OnboardingService, SideEffect, SideEffectResult,
    TracingOnboardingNotifier,
};

// Processor event exports
pub use webhook::{ProcessorEvent, ProcessorEventHandler, ProcessorEventKind, WebhookOutcome};

// Storage exports
pub use memory::InMemoryBillingStore;
pub use storage::{
    ApplicationDecision, ApplicationStore, BillingStore, InvoiceSequenceStore, MembershipStore,
    OrganizationStore, PaymentStore, PlanStore, ProcessedEventStore,
};

// Audit exports
pub use audit::{
    BillingAuditEvent, BillingAuditLogger, MemoryAuditLogger, NoOpAuditLogger, TracingAuditLogger,
};

// Error exports
pub use error::BillingError;

// Validation exports
pub use validation::{parse_billing_date, validate_organization, validate_plan};
