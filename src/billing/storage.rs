//! Storage traits for billing data.
//!
//! Implement these traits to persist billing state to your database.
//! [`InMemoryBillingStore`](super::memory::InMemoryBillingStore) implements
//! all of them for tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::types::{
    Application, ApplicationStatus, Membership, Organization, Payment, PaymentMethod, PaymentType,
    Plan,
};
use crate::error::Result;

/// Read and write access to organizations.
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn get_organization(&self, organization_id: &str) -> Result<Option<Organization>>;

    /// All organizations, used by the scheduler.
    async fn list_organizations(&self) -> Result<Vec<Organization>>;

    async fn save_organization(&self, organization: &Organization) -> Result<()>;
}

/// Read and write access to plans.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>>;

    async fn save_plan(&self, plan: &Plan) -> Result<()>;
}

/// Read and write access to memberships.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn get_membership(&self, membership_id: &str) -> Result<Option<Membership>>;

    /// All memberships of an organization, cancelled ones included.
    async fn list_memberships(&self, organization_id: &str) -> Result<Vec<Membership>>;

    async fn create_membership(&self, membership: &Membership) -> Result<()>;

    /// Replace a stored membership and bump its version. Fails with
    /// NotFound if it does not exist.
    async fn update_membership(&self, membership: &Membership) -> Result<()>;

    /// Replace a stored membership only if its stored version still equals
    /// `expected_version`, bumping the version on success.
    ///
    /// Returns `Ok(false)` if another writer got there first. Settlement uses
    /// this so two payments of one membership never overwrite each other's
    /// credit.
    ///
    /// # Example (PostgreSQL)
    ///
    /// ```sql
    /// UPDATE memberships
    /// SET status = $3, paid_months = $4, ..., version = version + 1
    /// WHERE id = $1 AND version = $2
    /// RETURNING id
    /// ```
    async fn update_membership_if_version(
        &self,
        membership: &Membership,
        expected_version: u64,
    ) -> Result<bool>;

    /// Hard delete. Only used to roll back a membership created by an
    /// approval that lost its race.
    async fn delete_membership(&self, membership_id: &str) -> Result<()>;
}

/// Read and write access to payments.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>>;

    async fn create_payment(&self, payment: &Payment) -> Result<()>;

    async fn list_payments_for_membership(&self, membership_id: &str) -> Result<Vec<Payment>>;

    /// Find a non-failed payment of `payment_type` covering the period that
    /// starts on `period_start`.
    async fn find_payment_for_period(
        &self,
        membership_id: &str,
        payment_type: PaymentType,
        period_start: NaiveDate,
    ) -> Result<Option<Payment>>;

    /// Insert a payment unless a non-failed payment of the same type already
    /// covers its period.
    ///
    /// Returns `Ok(true)` if the payment was inserted and `Ok(false)` if the
    /// period was already billed. The check and the insert must be one atomic
    /// step; concurrent billing runs rely on it to bill a period once.
    /// Payments without a `period_start` are always inserted.
    ///
    /// # Example (PostgreSQL)
    ///
    /// ```sql
    /// CREATE UNIQUE INDEX payments_one_per_period
    /// ON payments (membership_id, payment_type, period_start)
    /// WHERE status <> 'failed';
    ///
    /// INSERT INTO payments (...) VALUES (...)
    /// ON CONFLICT DO NOTHING
    /// RETURNING id
    /// ```
    async fn create_payment_for_period(&self, payment: &Payment) -> Result<bool>;

    /// Pending payments of an organization that are not flagged for review
    /// and are due on or before `due_on_or_before`.
    async fn list_open_payments(
        &self,
        organization_id: &str,
        due_on_or_before: NaiveDate,
    ) -> Result<Vec<Payment>>;

    /// Mark a payment succeeded unless it already is.
    ///
    /// Returns `Ok(true)` if this call performed the transition and
    /// `Ok(false)` if the payment was already succeeded. This must be a
    /// single atomic conditional update; settlement relies on it to apply
    /// membership effects exactly once.
    ///
    /// # Example (PostgreSQL)
    ///
    /// ```sql
    /// UPDATE payments
    /// SET status = 'succeeded', method = $2, paid_at = $3, processor_payment_id = $4
    /// WHERE id = $1 AND status <> 'succeeded'
    /// RETURNING id
    /// ```
    async fn mark_payment_succeeded(
        &self,
        payment_id: &str,
        method: PaymentMethod,
        paid_at: DateTime<Utc>,
        processor_payment_id: Option<&str>,
    ) -> Result<bool>;

    /// Mark a pending payment failed.
    ///
    /// Returns `Ok(false)` if the payment was not pending.
    async fn mark_payment_failed(&self, payment_id: &str, reason: &str) -> Result<bool>;

    /// Persist reminder bookkeeping for a payment.
    async fn update_reminder_state(
        &self,
        payment_id: &str,
        reminder_count: u32,
        reminder_sent_at: DateTime<Utc>,
        requires_review: bool,
    ) -> Result<()>;
}

/// Per-organization, per-month invoice counter.
#[async_trait]
pub trait InvoiceSequenceStore: Send + Sync {
    /// Atomically increment the counter for `(organization_id, year_month)`
    /// and return the new value. The first reservation of a month returns 1.
    ///
    /// Implementations must never read then write from application code;
    /// two concurrent callers must receive different values.
    ///
    /// # Example (PostgreSQL)
    ///
    /// ```sql
    /// INSERT INTO invoice_sequences (organization_id, year_month, value)
    /// VALUES ($1, $2, 1)
    /// ON CONFLICT (organization_id, year_month)
    /// DO UPDATE SET value = invoice_sequences.value + 1
    /// RETURNING value
    /// ```
    async fn reserve_invoice_sequence(&self, organization_id: &str, year_month: &str) -> Result<u32>;
}

/// Review outcome written by [`ApplicationStore::decide_application`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationDecision {
    pub status: ApplicationStatus,
    pub reviewed_by: String,
    pub reviewed_at: DateTime<Utc>,
    pub rejection_reason: Option<String>,
    pub membership_id: Option<String>,
}

/// Read and write access to membership applications.
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn get_application(&self, application_id: &str) -> Result<Option<Application>>;

    async fn save_application(&self, application: &Application) -> Result<()>;

    /// Apply `decision` only if the application is still pending.
    ///
    /// Returns `Ok(false)` when another reviewer got there first. Must be an
    /// atomic `UPDATE ... WHERE status = 'pending'`.
    async fn decide_application(
        &self,
        application_id: &str,
        decision: &ApplicationDecision,
    ) -> Result<bool>;
}

/// Processed processor event ids, for at-least-once delivery.
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;
}

/// Everything the billing services need from persistence.
///
/// Blanket-implemented for any type implementing the individual traits.
pub trait BillingStore:
    OrganizationStore
    + PlanStore
    + MembershipStore
    + PaymentStore
    + InvoiceSequenceStore
    + ApplicationStore
    + ProcessedEventStore
{
}

impl<T> BillingStore for T where
    T: OrganizationStore
        + PlanStore
        + MembershipStore
        + PaymentStore
        + InvoiceSequenceStore
        + ApplicationStore
        + ProcessedEventStore
{
}
