//! In-memory billing store.
//!
//! Implements every storage trait behind `RwLock`s. Conditional updates and
//! the invoice counter run under a single write lock, which gives them the
//! same atomicity a database would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::error::BillingError;
use super::storage::{
    ApplicationDecision, ApplicationStore, InvoiceSequenceStore, MembershipStore,
    OrganizationStore, PaymentStore, PlanStore, ProcessedEventStore,
};
use super::types::{
    Application, ApplicationStatus, Membership, Organization, Payment, PaymentMethod,
    PaymentStatus, PaymentType, Plan,
};
use crate::error::Result;

/// In-memory billing store.
///
/// Wraps data in Arc for cheap cloning; clones share state.
#[derive(Default, Clone)]
pub struct InMemoryBillingStore {
    inner: Arc<InMemoryBillingStoreInner>,
}

#[derive(Default)]
struct InMemoryBillingStoreInner {
    organizations: RwLock<HashMap<String, Organization>>,
    plans: RwLock<HashMap<String, Plan>>,
    memberships: RwLock<HashMap<String, Membership>>,
    payments: RwLock<HashMap<String, Payment>>,
    applications: RwLock<HashMap<String, Application>>,
    sequences: RwLock<HashMap<(String, String), u32>>,
    processed_events: RwLock<HashSet<String>>,
    failing_operations: RwLock<HashSet<String>>,
}

fn read<'a, T>(lock: &'a RwLock<T>, operation: &str) -> Result<RwLockReadGuard<'a, T>> {
    lock.read()
        .map_err(|_| BillingError::storage(operation, "lock poisoned").into())
}

fn write<'a, T>(lock: &'a RwLock<T>, operation: &str) -> Result<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| BillingError::storage(operation, "lock poisoned").into())
}

impl InMemoryBillingStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call to `operation` fail with a storage error.
    ///
    /// Operation names are the trait method names, e.g. `"update_membership"`.
    pub fn fail_on(&self, operation: &str) {
        if let Ok(mut failing) = self.inner.failing_operations.write() {
            failing.insert(operation.to_string());
        }
    }

    /// Undo all [`fail_on`](Self::fail_on) calls.
    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.inner.failing_operations.write() {
            failing.clear();
        }
    }

    /// All payments of an organization, oldest first.
    pub fn payments_for_organization(&self, organization_id: &str) -> Vec<Payment> {
        let mut payments: Vec<Payment> = self
            .inner
            .payments
            .read()
            .map(|p| {
                p.values()
                    .filter(|p| p.organization_id == organization_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        payments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        payments
    }

    /// Current counter value for an organization-month, 0 if never reserved.
    pub fn current_sequence(&self, organization_id: &str, year_month: &str) -> u32 {
        self.inner
            .sequences
            .read()
            .ok()
            .and_then(|s| {
                s.get(&(organization_id.to_string(), year_month.to_string()))
                    .copied()
            })
            .unwrap_or(0)
    }

    fn check(&self, operation: &str) -> Result<()> {
        let failing = read(&self.inner.failing_operations, operation)?;
        if failing.contains(operation) {
            return Err(BillingError::storage(operation, "injected failure").into());
        }
        Ok(())
    }
}

#[async_trait]
impl OrganizationStore for InMemoryBillingStore {
    async fn get_organization(&self, organization_id: &str) -> Result<Option<Organization>> {
        self.check("get_organization")?;
        Ok(read(&self.inner.organizations, "get_organization")?
            .get(organization_id)
            .cloned())
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>> {
        self.check("list_organizations")?;
        let mut orgs: Vec<Organization> = read(&self.inner.organizations, "list_organizations")?
            .values()
            .cloned()
            .collect();
        orgs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(orgs)
    }

    async fn save_organization(&self, organization: &Organization) -> Result<()> {
        self.check("save_organization")?;
        write(&self.inner.organizations, "save_organization")?
            .insert(organization.id.clone(), organization.clone());
        Ok(())
    }
}

#[async_trait]
impl PlanStore for InMemoryBillingStore {
    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        self.check("get_plan")?;
        Ok(read(&self.inner.plans, "get_plan")?.get(plan_id).cloned())
    }

    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        self.check("save_plan")?;
        write(&self.inner.plans, "save_plan")?.insert(plan.id.clone(), plan.clone());
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for InMemoryBillingStore {
    async fn get_membership(&self, membership_id: &str) -> Result<Option<Membership>> {
        self.check("get_membership")?;
        Ok(read(&self.inner.memberships, "get_membership")?
            .get(membership_id)
            .cloned())
    }

    async fn list_memberships(&self, organization_id: &str) -> Result<Vec<Membership>> {
        self.check("list_memberships")?;
        let mut memberships: Vec<Membership> = read(&self.inner.memberships, "list_memberships")?
            .values()
            .filter(|m| m.organization_id == organization_id)
            .cloned()
            .collect();
        memberships.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(memberships)
    }

    async fn create_membership(&self, membership: &Membership) -> Result<()> {
        self.check("create_membership")?;
        write(&self.inner.memberships, "create_membership")?
            .insert(membership.id.clone(), membership.clone());
        Ok(())
    }

    async fn update_membership(&self, membership: &Membership) -> Result<()> {
        self.check("update_membership")?;
        let mut memberships = write(&self.inner.memberships, "update_membership")?;
        match memberships.get_mut(&membership.id) {
            Some(existing) => {
                let version = existing.version + 1;
                *existing = membership.clone();
                existing.version = version;
                Ok(())
            }
            None => Err(BillingError::MembershipNotFound {
                membership_id: membership.id.clone(),
            }
            .into()),
        }
    }

    async fn update_membership_if_version(
        &self,
        membership: &Membership,
        expected_version: u64,
    ) -> Result<bool> {
        self.check("update_membership_if_version")?;
        let mut memberships = write(&self.inner.memberships, "update_membership_if_version")?;
        let existing = memberships.get_mut(&membership.id).ok_or_else(|| {
            BillingError::MembershipNotFound {
                membership_id: membership.id.clone(),
            }
        })?;
        if existing.version != expected_version {
            return Ok(false);
        }
        *existing = membership.clone();
        existing.version = expected_version + 1;
        Ok(true)
    }

    async fn delete_membership(&self, membership_id: &str) -> Result<()> {
        self.check("delete_membership")?;
        write(&self.inner.memberships, "delete_membership")?.remove(membership_id);
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for InMemoryBillingStore {
    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>> {
        self.check("get_payment")?;
        Ok(read(&self.inner.payments, "get_payment")?.get(payment_id).cloned())
    }

    async fn create_payment(&self, payment: &Payment) -> Result<()> {
        self.check("create_payment")?;
        write(&self.inner.payments, "create_payment")?.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn create_payment_for_period(&self, payment: &Payment) -> Result<bool> {
        self.check("create_payment_for_period")?;
        let mut payments = write(&self.inner.payments, "create_payment_for_period")?;
        if let Some(period_start) = payment.period_start {
            let taken = payments.values().any(|p| {
                p.membership_id == payment.membership_id
                    && p.payment_type == payment.payment_type
                    && p.period_start == Some(period_start)
                    && p.status != PaymentStatus::Failed
            });
            if taken {
                return Ok(false);
            }
        }
        payments.insert(payment.id.clone(), payment.clone());
        Ok(true)
    }

    async fn list_payments_for_membership(&self, membership_id: &str) -> Result<Vec<Payment>> {
        self.check("list_payments_for_membership")?;
        let mut payments: Vec<Payment> =
            read(&self.inner.payments, "list_payments_for_membership")?
                .values()
                .filter(|p| p.membership_id == membership_id)
                .cloned()
                .collect();
        payments.sort_by(|a, b| a.due_date.cmp(&b.due_date).then(a.id.cmp(&b.id)));
        Ok(payments)
    }

    async fn find_payment_for_period(
        &self,
        membership_id: &str,
        payment_type: PaymentType,
        period_start: NaiveDate,
    ) -> Result<Option<Payment>> {
        self.check("find_payment_for_period")?;
        Ok(read(&self.inner.payments, "find_payment_for_period")?
            .values()
            .find(|p| {
                p.membership_id == membership_id
                    && p.payment_type == payment_type
                    && p.period_start == Some(period_start)
                    && p.status != PaymentStatus::Failed
            })
            .cloned())
    }

    async fn list_open_payments(
        &self,
        organization_id: &str,
        due_on_or_before: NaiveDate,
    ) -> Result<Vec<Payment>> {
        self.check("list_open_payments")?;
        let mut payments: Vec<Payment> = read(&self.inner.payments, "list_open_payments")?
            .values()
            .filter(|p| {
                p.organization_id == organization_id
                    && p.is_open()
                    && p.due_date <= due_on_or_before
            })
            .cloned()
            .collect();
        payments.sort_by(|a, b| a.due_date.cmp(&b.due_date).then(a.id.cmp(&b.id)));
        Ok(payments)
    }

    async fn mark_payment_succeeded(
        &self,
        payment_id: &str,
        method: PaymentMethod,
        paid_at: DateTime<Utc>,
        processor_payment_id: Option<&str>,
    ) -> Result<bool> {
        self.check("mark_payment_succeeded")?;
        let mut payments = write(&self.inner.payments, "mark_payment_succeeded")?;
        let payment = payments.get_mut(payment_id).ok_or_else(|| BillingError::PaymentNotFound {
            payment_id: payment_id.to_string(),
        })?;

        if payment.status == PaymentStatus::Succeeded {
            return Ok(false);
        }

        payment.status = PaymentStatus::Succeeded;
        payment.method = method;
        payment.paid_at = Some(paid_at);
        payment.failure_reason = None;
        if let Some(id) = processor_payment_id {
            payment.processor_payment_id = Some(id.to_string());
        }
        Ok(true)
    }

    async fn mark_payment_failed(&self, payment_id: &str, reason: &str) -> Result<bool> {
        self.check("mark_payment_failed")?;
        let mut payments = write(&self.inner.payments, "mark_payment_failed")?;
        let payment = payments.get_mut(payment_id).ok_or_else(|| BillingError::PaymentNotFound {
            payment_id: payment_id.to_string(),
        })?;

        if payment.status != PaymentStatus::Pending {
            return Ok(false);
        }

        payment.status = PaymentStatus::Failed;
        payment.failure_reason = Some(reason.to_string());
        Ok(true)
    }

    async fn update_reminder_state(
        &self,
        payment_id: &str,
        reminder_count: u32,
        reminder_sent_at: DateTime<Utc>,
        requires_review: bool,
    ) -> Result<()> {
        self.check("update_reminder_state")?;
        let mut payments = write(&self.inner.payments, "update_reminder_state")?;
        let payment = payments.get_mut(payment_id).ok_or_else(|| BillingError::PaymentNotFound {
            payment_id: payment_id.to_string(),
        })?;
        payment.reminder_count = reminder_count;
        payment.reminder_sent_at = Some(reminder_sent_at);
        payment.requires_review = requires_review;
        Ok(())
    }
}

#[async_trait]
impl InvoiceSequenceStore for InMemoryBillingStore {
    async fn reserve_invoice_sequence(&self, organization_id: &str, year_month: &str) -> Result<u32> {
        self.check("reserve_invoice_sequence")?;
        let mut sequences = write(&self.inner.sequences, "reserve_invoice_sequence")?;
        let value = sequences
            .entry((organization_id.to_string(), year_month.to_string()))
            .or_insert(0);
        *value += 1;
        Ok(*value)
    }
}

#[async_trait]
impl ApplicationStore for InMemoryBillingStore {
    async fn get_application(&self, application_id: &str) -> Result<Option<Application>> {
        self.check("get_application")?;
        Ok(read(&self.inner.applications, "get_application")?
            .get(application_id)
            .cloned())
    }

    async fn save_application(&self, application: &Application) -> Result<()> {
        self.check("save_application")?;
        write(&self.inner.applications, "save_application")?
            .insert(application.id.clone(), application.clone());
        Ok(())
    }

    async fn decide_application(
        &self,
        application_id: &str,
        decision: &ApplicationDecision,
    ) -> Result<bool> {
        self.check("decide_application")?;
        let mut applications = write(&self.inner.applications, "decide_application")?;
        let application =
            applications
                .get_mut(application_id)
                .ok_or_else(|| BillingError::ApplicationNotFound {
                    application_id: application_id.to_string(),
                })?;

        if application.status != ApplicationStatus::Pending {
            return Ok(false);
        }

        application.status = decision.status;
        application.reviewed_by = Some(decision.reviewed_by.clone());
        application.reviewed_at = Some(decision.reviewed_at);
        application.rejection_reason = decision.rejection_reason.clone();
        application.membership_id = decision.membership_id.clone();
        Ok(true)
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryBillingStore {
    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        self.check("is_event_processed")?;
        Ok(read(&self.inner.processed_events, "is_event_processed")?.contains(event_id))
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        self.check("mark_event_processed")?;
        write(&self.inner.processed_events, "mark_event_processed")?.insert(event_id.to_string());
        Ok(())
    }
}
