//! Billing run: creates the payments members owe.
//!
//! A run bills each membership at most once per period. Payments stay
//! pending until [`SettlementService`](super::settlement::SettlementService)
//! settles them; the run never advances `next_payment_due` itself.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::anniversary::add_months_on_anniversary;
use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::config::BillingConfig;
use super::error::BillingError;
use super::fees::{platform_fee_for, FeeBreakdown, FeeCalculator};
use super::invoice::InvoiceGenerator;
use super::settlement::onboarding_target;
use super::storage::BillingStore;
use super::types::{
    new_id, EnrollmentFeeStatus, Membership, Organization, Payment, PaymentMethod,
    PaymentStatus, PaymentType, Plan,
};
use super::validation::{ensure_same_tenant, validate_id, validate_months_credited};
use crate::error::{DuesError, Result};
use crate::utils::Clock;

/// A membership the run could not bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillingFailure {
    pub membership_id: String,
    pub error: String,
}

/// Summary of one billing run over an organization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BillingRunReport {
    pub organization_id: String,
    /// Memberships with a due date on or before the run date.
    pub due: usize,
    /// Ids of the payments created.
    pub created: Vec<String>,
    /// Due memberships that already had a payment for the period.
    pub already_billed: usize,
    pub failures: Vec<BillingFailure>,
}

/// Outcome of [`BillingRun::create_enrollment_fee_payment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentFeeOutcome {
    /// A pending enrollment fee payment was created.
    Created(Payment),
    /// An enrollment fee payment already exists and has not failed.
    Existing(Payment),
    /// The plan charges no enrollment fee; the membership was marked waived.
    Waived(Membership),
    /// The fee was already paid or waived.
    AlreadyResolved,
}

/// Creates dues, enrollment fee and back dues payments.
pub struct BillingRun<S: BillingStore + Clone> {
    store: S,
    config: BillingConfig,
    fees: FeeCalculator,
    invoices: InvoiceGenerator<S>,
    audit: Arc<dyn BillingAuditLogger>,
}

impl<S: BillingStore + Clone> BillingRun<S> {
    #[must_use]
    pub fn new(store: S, config: BillingConfig, fees: FeeCalculator) -> Self {
        Self {
            invoices: InvoiceGenerator::new(store.clone()),
            store,
            config,
            fees,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.invoices = self.invoices.with_clock(clock);
        self
    }

    /// Create a pending dues payment for every membership due on or before
    /// `today`.
    ///
    /// Memberships that already have a payment for their current period are
    /// skipped, so running twice on the same day creates nothing new. A
    /// failure for one membership is recorded and the run continues.
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub async fn run_for_organization(
        &self,
        organization_id: &str,
        today: NaiveDate,
    ) -> Result<BillingRunReport> {
        let org = self.load_organization(organization_id).await?;
        let memberships = self.store.list_memberships(organization_id).await?;

        let mut report = BillingRunReport {
            organization_id: organization_id.to_string(),
            ..BillingRunReport::default()
        };

        for membership in memberships {
            if membership.status.is_terminal() {
                continue;
            }
            let Some(due_date) = membership.next_payment_due else {
                continue;
            };
            if due_date > today {
                continue;
            }

            report.due += 1;
            match self.bill_period(&org, &membership, due_date).await {
                Ok(Some(payment)) => report.created.push(payment.id),
                Ok(None) => report.already_billed += 1,
                Err(e) => {
                    warn!(membership_id = %membership.id, error = %e, "Billing failed");
                    report.failures.push(BillingFailure {
                        membership_id: membership.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            due = report.due,
            created = report.created.len(),
            already_billed = report.already_billed,
            failed = report.failures.len(),
            "Billing run complete"
        );
        Ok(report)
    }

    async fn bill_period(
        &self,
        org: &Organization,
        membership: &Membership,
        period_start: NaiveDate,
    ) -> Result<Option<Payment>> {
        if let Some(existing) = self
            .store
            .find_payment_for_period(&membership.id, PaymentType::Dues, period_start)
            .await?
        {
            debug!(payment_id = %existing.id, "Period already billed");
            return Ok(None);
        }

        let plan = self.load_plan(org, &membership.plan_id).await?;
        let frequency = membership.billing_frequency;
        let months = frequency.months();
        let platform_fee =
            platform_fee_for(&org.id, &org.platform_fees, PaymentType::Dues, frequency, months)?;
        let breakdown =
            self.fees
                .calculate(plan.price_for(frequency), platform_fee, org.pass_fees_to_member)?;

        let mut meta = self
            .invoices
            .generate_invoice_metadata(&org.id, Some(period_start), frequency, None)
            .await?;
        let next_start =
            add_months_on_anniversary(period_start, months, membership.billing_anniversary_day);
        meta.period_end = next_start.pred_opt().unwrap_or(next_start);

        let mut payment = pending_payment(membership, PaymentType::Dues, &breakdown, meta.invoice_number);
        payment.months_credited = months;
        payment.due_date = period_start;
        payment.period_start = Some(meta.period_start);
        payment.period_end = Some(meta.period_end);
        payment.period_label = Some(meta.period_label);

        // A concurrent run may have billed the period since the check above;
        // its reserved invoice number is then left unused.
        if !self.store.create_payment_for_period(&payment).await? {
            debug!(invoice_number = %payment.invoice_number, "Period billed concurrently");
            return Ok(None);
        }
        self.log_created(&payment).await;
        Ok(Some(payment))
    }

    /// Bill the membership's one-time enrollment fee.
    ///
    /// A plan without an enrollment fee marks the fee waived instead, which
    /// may complete onboarding.
    #[instrument(skip(self), fields(membership_id = %membership_id))]
    pub async fn create_enrollment_fee_payment(
        &self,
        membership_id: &str,
        today: NaiveDate,
    ) -> Result<EnrollmentFeeOutcome> {
        validate_id(membership_id)?;
        let mut membership = self.load_membership(membership_id).await?;
        if membership.enrollment_fee_status.is_resolved() {
            return Ok(EnrollmentFeeOutcome::AlreadyResolved);
        }

        let existing = self
            .store
            .list_payments_for_membership(membership_id)
            .await?
            .into_iter()
            .find(|p| p.payment_type == PaymentType::EnrollmentFee && p.status != PaymentStatus::Failed);
        if let Some(payment) = existing {
            return Ok(EnrollmentFeeOutcome::Existing(payment));
        }

        let org = self.load_organization(&membership.organization_id).await?;
        let plan = self.load_plan(&org, &membership.plan_id).await?;

        if plan.enrollment_fee_cents == 0 {
            let resolved = self.config.resolve_for(&org)?;
            let previous = membership.status;
            membership.enrollment_fee_status = EnrollmentFeeStatus::Waived;
            if let Some(next) = onboarding_target(&membership, resolved.eligibility_months) {
                if membership.status.can_transition_to(next) {
                    membership.status = next;
                }
            }
            membership.updated_at = Utc::now();
            self.store.update_membership(&membership).await?;

            self.audit
                .log(BillingAuditEvent::EnrollmentFeeWaived {
                    organization_id: org.id.clone(),
                    membership_id: membership.id.clone(),
                })
                .await;
            if previous != membership.status {
                self.audit
                    .log(BillingAuditEvent::MembershipStatusChanged {
                        organization_id: org.id.clone(),
                        membership_id: membership.id.clone(),
                        from: previous.to_string(),
                        to: membership.status.to_string(),
                        actor: None,
                    })
                    .await;
            }
            return Ok(EnrollmentFeeOutcome::Waived(membership));
        }

        let platform_fee = platform_fee_for(
            &org.id,
            &org.platform_fees,
            PaymentType::EnrollmentFee,
            membership.billing_frequency,
            0,
        )?;
        let breakdown =
            self.fees
                .calculate(plan.enrollment_fee_cents, platform_fee, org.pass_fees_to_member)?;
        let invoice_number = self.invoices.reserve_invoice_number(&org.id, today).await?;

        let mut payment =
            pending_payment(&membership, PaymentType::EnrollmentFee, &breakdown, invoice_number);
        payment.due_date = today;
        payment.period_label = Some("Enrollment fee".to_string());

        self.store.create_payment(&payment).await?;
        self.log_created(&payment).await;
        Ok(EnrollmentFeeOutcome::Created(payment))
    }

    /// Bill `months` of back dues starting at `start`.
    ///
    /// The base amount is the plan's monthly price times `months`.
    #[instrument(skip(self), fields(membership_id = %membership_id))]
    pub async fn create_back_dues_payment(
        &self,
        membership_id: &str,
        start: NaiveDate,
        months: u32,
    ) -> Result<Payment> {
        validate_id(membership_id)?;
        validate_months_credited(months)?;
        let membership = self.load_membership(membership_id).await?;
        if membership.status.is_terminal() {
            return Err(DuesError::conflict(format!(
                "membership {} is cancelled",
                membership.id
            )));
        }
        let org = self.load_organization(&membership.organization_id).await?;
        let plan = self.load_plan(&org, &membership.plan_id).await?;

        let base = plan
            .monthly_price_cents
            .checked_mul(i64::from(months))
            .ok_or_else(|| BillingError::InvalidAmount {
                field: "back_dues".to_string(),
                reason: "amount out of range".to_string(),
            })?;
        let platform_fee = platform_fee_for(
            &org.id,
            &org.platform_fees,
            PaymentType::BackDues,
            membership.billing_frequency,
            months,
        )?;
        let breakdown = self.fees.calculate(base, platform_fee, org.pass_fees_to_member)?;
        let meta = self
            .invoices
            .generate_ad_hoc_invoice_metadata(&org.id, Some(start), months, None)
            .await?;

        let mut payment = pending_payment(&membership, PaymentType::BackDues, &breakdown, meta.invoice_number);
        payment.months_credited = months;
        payment.due_date = start;
        payment.period_start = Some(meta.period_start);
        payment.period_end = Some(meta.period_end);
        payment.period_label = Some(meta.period_label);

        self.store.create_payment(&payment).await?;
        self.log_created(&payment).await;
        Ok(payment)
    }

    async fn log_created(&self, payment: &Payment) {
        info!(
            payment_id = %payment.id,
            invoice_number = %payment.invoice_number,
            amount_cents = payment.amount_cents,
            "Payment created"
        );
        self.audit
            .log(BillingAuditEvent::PaymentCreated {
                organization_id: payment.organization_id.clone(),
                membership_id: payment.membership_id.clone(),
                payment_id: payment.id.clone(),
                invoice_number: payment.invoice_number.clone(),
                payment_type: payment.payment_type.to_string(),
                amount_cents: payment.amount_cents,
            })
            .await;
    }

    async fn load_organization(&self, organization_id: &str) -> Result<Organization> {
        self.store
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| {
                BillingError::OrganizationNotFound {
                    organization_id: organization_id.to_string(),
                }
                .into()
            })
    }

    async fn load_membership(&self, membership_id: &str) -> Result<Membership> {
        self.store
            .get_membership(membership_id)
            .await?
            .ok_or_else(|| {
                BillingError::MembershipNotFound {
                    membership_id: membership_id.to_string(),
                }
                .into()
            })
    }

    async fn load_plan(&self, org: &Organization, plan_id: &str) -> Result<Plan> {
        let plan = self.store.get_plan(plan_id).await?.ok_or_else(|| BillingError::PlanNotFound {
            plan_id: plan_id.to_string(),
        })?;
        ensure_same_tenant(&org.id, &plan.organization_id)?;
        Ok(plan)
    }
}

/// A pending payment carrying `breakdown`. Callers fill in the period.
fn pending_payment(
    membership: &Membership,
    payment_type: PaymentType,
    breakdown: &FeeBreakdown,
    invoice_number: String,
) -> Payment {
    let today = Utc::now();
    Payment {
        id: new_id("pay"),
        organization_id: membership.organization_id.clone(),
        membership_id: membership.id.clone(),
        payment_type,
        method: PaymentMethod::Processor,
        status: PaymentStatus::Pending,
        amount_cents: breakdown.base_amount_cents,
        processor_fee_cents: breakdown.processor_fee_cents,
        platform_fee_cents: breakdown.platform_fee_cents,
        total_charged_cents: breakdown.charge_amount_cents,
        net_amount_cents: breakdown.net_amount_cents,
        months_credited: 0,
        invoice_number,
        due_date: today.date_naive(),
        period_start: None,
        period_end: None,
        period_label: None,
        reminder_count: 0,
        reminder_sent_at: None,
        requires_review: false,
        processor_payment_id: None,
        paid_at: None,
        failure_reason: None,
        created_at: today,
    }
}
