//! Payment settlement and the membership lifecycle.
//!
//! Settlement marks a payment succeeded with a single conditional update and
//! only then applies its effects to the membership, so a retried webhook or
//! double-clicked "record payment" credits months exactly once.
//!
//! Lapsing is never automatic. [`lapse_recommendation`] surfaces memberships
//! an operator should look at; the operator applies the change through
//! [`SettlementService::admin_override_status`].

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::anniversary::add_months_on_anniversary;
use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::config::{BillingConfig, ResolvedBillingConfig};
use super::error::BillingError;
use super::reminders::days_between;
use super::storage::BillingStore;
use super::types::{
    EnrollmentFeeStatus, Membership, MembershipStatus, Organization, Payment, PaymentMethod,
    PaymentStatus, PaymentType,
};
use super::validation::{ensure_same_tenant, validate_id};
use crate::error::Result;
use crate::utils::local_date;

/// Request to settle one payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleRequest {
    pub payment_id: String,
    pub method: PaymentMethod,
    pub paid_at: DateTime<Utc>,
    pub processor_payment_id: Option<String>,
}

impl SettleRequest {
    #[must_use]
    pub fn new(payment_id: impl Into<String>, method: PaymentMethod, paid_at: DateTime<Utc>) -> Self {
        Self {
            payment_id: payment_id.into(),
            method,
            paid_at,
            processor_payment_id: None,
        }
    }

    #[must_use]
    pub fn with_processor_payment_id(mut self, id: impl Into<String>) -> Self {
        self.processor_payment_id = Some(id.into());
        self
    }
}

/// Membership state after a successful settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementOutcome {
    pub payment_id: String,
    pub membership_id: String,
    pub previous_status: MembershipStatus,
    pub new_status: MembershipStatus,
    pub new_paid_months: u32,
    pub became_eligible: bool,
    pub next_payment_due: Option<NaiveDate>,
}

/// Result of [`SettlementService::settle_payment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SettlementResult {
    /// Payment marked succeeded and membership updated.
    Settled(SettlementOutcome),
    /// The payment had already been settled; nothing changed.
    AlreadySettled {
        payment_id: String,
        membership_id: String,
        paid_months: u32,
        status: MembershipStatus,
    },
    /// The payment is marked succeeded but the membership update failed.
    /// Needs manual reconciliation; retrying settlement will not fix it.
    PartiallySettled {
        payment_id: String,
        membership_id: String,
        reason: String,
    },
}

impl SettlementResult {
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Settled(_))
    }

    #[must_use]
    pub fn requires_reconciliation(&self) -> bool {
        matches!(self, Self::PartiallySettled { .. })
    }
}

/// Changes applied to a membership by one payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedPayment {
    pub previous_status: MembershipStatus,
    pub became_eligible: bool,
}

/// Status a not-yet-onboarded membership should move to, if any.
///
/// Onboarding finishes once the agreement is signed and the enrollment fee
/// is paid or waived. A pending member who has paid but not signed waits
/// for the signature.
#[must_use]
pub fn onboarding_target(membership: &Membership, eligibility_months: u32) -> Option<MembershipStatus> {
    match membership.status {
        MembershipStatus::Pending | MembershipStatus::AwaitingSignature => {
            if membership.onboarding_complete() {
                Some(eligibility_status(membership.paid_months, eligibility_months))
            } else if membership.status == MembershipStatus::Pending
                && membership.enrollment_fee_status.is_resolved()
            {
                Some(MembershipStatus::AwaitingSignature)
            } else {
                None
            }
        }
        MembershipStatus::WaitingPeriod
        | MembershipStatus::Current
        | MembershipStatus::Lapsed
        | MembershipStatus::Cancelled => None,
    }
}

fn eligibility_status(paid_months: u32, eligibility_months: u32) -> MembershipStatus {
    if paid_months >= eligibility_months {
        MembershipStatus::Current
    } else {
        MembershipStatus::WaitingPeriod
    }
}

/// Apply a succeeded payment to `membership`.
///
/// Dues credit months and push `next_payment_due` past the paid period
/// (never backwards). Enrollment fees mark the fee paid. The status moves
/// forward where the graph allows, a lapsed member paying dues is
/// reinstated, and the eligibility date is set the first time the paid
/// months reach `eligibility_months`.
pub fn apply_payment(
    membership: &mut Membership,
    payment: &Payment,
    eligibility_months: u32,
    paid_on: NaiveDate,
) -> AppliedPayment {
    let previous_status = membership.status;

    match payment.payment_type {
        PaymentType::Dues | PaymentType::BackDues => {
            membership.paid_months = membership.paid_months.saturating_add(payment.months_credited);
            let covered_until = match (payment.period_start, payment.period_end) {
                (Some(start), _) => Some(add_months_on_anniversary(
                    start,
                    payment.months_credited,
                    membership.billing_anniversary_day,
                )),
                (None, Some(end)) => end.succ_opt(),
                (None, None) => None,
            };
            if let Some(next) = covered_until {
                membership.next_payment_due = Some(match membership.next_payment_due {
                    Some(current) => current.max(next),
                    None => next,
                });
            }
        }
        PaymentType::EnrollmentFee => {
            membership.enrollment_fee_status = EnrollmentFeeStatus::Paid;
        }
    }

    let target = match membership.status {
        MembershipStatus::WaitingPeriod if membership.paid_months >= eligibility_months => {
            Some(MembershipStatus::Current)
        }
        MembershipStatus::Lapsed if payment.payment_type.credits_months() => {
            Some(eligibility_status(membership.paid_months, eligibility_months))
        }
        _ => onboarding_target(membership, eligibility_months),
    };
    if let Some(next) = target {
        if membership.status.can_transition_to(next) {
            membership.status = next;
        }
    }

    let mut became_eligible = false;
    if membership.status != MembershipStatus::Cancelled
        && membership.paid_months >= eligibility_months
        && membership.eligible_since.is_none()
    {
        membership.eligible_since = Some(paid_on);
        became_eligible = true;
    }

    membership.updated_at = Utc::now();
    AppliedPayment {
        previous_status,
        became_eligible,
    }
}

/// Why a lapse is recommended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LapseReason {
    /// A payment exhausted its reminders.
    FlaggedForReview { payment_id: String },
    /// A payment failed and nothing has paid that period since.
    PaymentFailed { payment_id: String },
    /// A payment has been unpaid for longer than the lapse window.
    Overdue { payment_id: String, days_overdue: i64 },
}

/// Advisory: this membership should probably be lapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LapseRecommendation {
    pub membership_id: String,
    pub reason: LapseReason,
}

/// Check whether a `Current` membership should be lapsed. Mutates nothing.
#[must_use]
pub fn lapse_recommendation(
    membership: &Membership,
    payments: &[Payment],
    today: NaiveDate,
    config: &ResolvedBillingConfig,
) -> Option<LapseRecommendation> {
    if membership.status != MembershipStatus::Current {
        return None;
    }

    let owned = payments.iter().filter(|p| p.membership_id == membership.id);
    let mut sorted: Vec<&Payment> = owned.collect();
    sorted.sort_by_key(|p| p.due_date);

    let superseded = |failed: &Payment| {
        payments.iter().any(|p| {
            p.membership_id == membership.id
                && p.status == PaymentStatus::Succeeded
                && p.payment_type == failed.payment_type
                && p.period_start == failed.period_start
        })
    };

    let reason = sorted.into_iter().find_map(|p| match p.status {
        PaymentStatus::Pending if p.requires_review => Some(LapseReason::FlaggedForReview {
            payment_id: p.id.clone(),
        }),
        PaymentStatus::Pending => {
            let days_overdue = days_between(p.due_date, today);
            (days_overdue > i64::from(config.lapse_days)).then(|| LapseReason::Overdue {
                payment_id: p.id.clone(),
                days_overdue,
            })
        }
        PaymentStatus::Failed if !superseded(p) => Some(LapseReason::PaymentFailed {
            payment_id: p.id.clone(),
        }),
        PaymentStatus::Failed | PaymentStatus::Succeeded => None,
    })?;

    Some(LapseRecommendation {
        membership_id: membership.id.clone(),
        reason,
    })
}

/// Re-reads of a membership that changed between read and write before
/// settlement gives up and reports a partial settlement.
const MEMBERSHIP_WRITE_ATTEMPTS: u32 = 5;

/// Settles payments and drives membership status changes.
pub struct SettlementService<S: BillingStore> {
    store: S,
    config: BillingConfig,
    audit: Arc<dyn BillingAuditLogger>,
}

impl<S: BillingStore> SettlementService<S> {
    #[must_use]
    pub fn new(store: S, config: BillingConfig) -> Self {
        Self {
            store,
            config,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Settle a payment and apply it to its membership.
    ///
    /// Safe to call repeatedly for the same payment: only the first call
    /// that flips the payment to succeeded mutates the membership.
    ///
    /// # Errors
    ///
    /// Validation for a malformed id or cross-tenant records, NotFound for
    /// missing records, Dependency if marking the payment fails. A failure
    /// after the payment is marked is reported as
    /// [`SettlementResult::PartiallySettled`], not as an error.
    #[instrument(skip(self, request), fields(payment_id = %request.payment_id, method = %request.method))]
    pub async fn settle_payment(&self, request: SettleRequest) -> Result<SettlementResult> {
        validate_id(&request.payment_id)?;

        let payment = self.load_payment(&request.payment_id).await?;
        let mut membership = self.load_membership(&payment.membership_id).await?;
        ensure_same_tenant(&payment.organization_id, &membership.organization_id)?;
        let org = self.load_organization(&payment.organization_id).await?;
        let resolved = self.config.resolve_for(&org)?;
        let tz = org.tz()?;

        let applied = self
            .store
            .mark_payment_succeeded(
                &payment.id,
                request.method,
                request.paid_at,
                request.processor_payment_id.as_deref(),
            )
            .await?;

        if !applied {
            info!(membership_id = %membership.id, "Payment already settled");
            return Ok(SettlementResult::AlreadySettled {
                payment_id: payment.id,
                membership_id: membership.id,
                paid_months: membership.paid_months,
                status: membership.status,
            });
        }

        let paid_on = local_date(request.paid_at, tz);
        let mut conflicts = 0;
        let effects = loop {
            let expected_version = membership.version;
            let effects =
                apply_payment(&mut membership, &payment, resolved.eligibility_months, paid_on);
            let reason = match self
                .store
                .update_membership_if_version(&membership, expected_version)
                .await
            {
                Ok(true) => {
                    membership.version = expected_version + 1;
                    break effects;
                }
                Ok(false) if conflicts < MEMBERSHIP_WRITE_ATTEMPTS => {
                    conflicts += 1;
                    debug!(
                        membership_id = %membership.id,
                        conflicts,
                        "Membership changed concurrently, reapplying payment"
                    );
                    match self.load_membership(&payment.membership_id).await {
                        Ok(current) => {
                            membership = current;
                            continue;
                        }
                        Err(e) => e.to_string(),
                    }
                }
                Ok(false) => "membership kept changing concurrently".to_string(),
                Err(e) => e.to_string(),
            };
            return Ok(self.report_partial(&org, &payment, &membership.id, reason).await);
        };

        self.audit
            .log(BillingAuditEvent::PaymentSettled {
                organization_id: org.id.clone(),
                membership_id: membership.id.clone(),
                payment_id: payment.id.clone(),
                paid_months: membership.paid_months,
                status: membership.status.to_string(),
            })
            .await;
        self.log_status_change(&org, &membership, effects.previous_status, None).await;
        if effects.became_eligible {
            self.audit
                .log(BillingAuditEvent::MembershipBecameEligible {
                    organization_id: org.id.clone(),
                    membership_id: membership.id.clone(),
                    eligible_since: paid_on.to_string(),
                })
                .await;
        }

        info!(
            membership_id = %membership.id,
            paid_months = membership.paid_months,
            status = %membership.status,
            became_eligible = effects.became_eligible,
            "Payment settled"
        );

        Ok(SettlementResult::Settled(SettlementOutcome {
            payment_id: payment.id,
            membership_id: membership.id,
            previous_status: effects.previous_status,
            new_status: membership.status,
            new_paid_months: membership.paid_months,
            became_eligible: effects.became_eligible,
            next_payment_due: membership.next_payment_due,
        }))
    }

    /// Mark a pending payment failed.
    ///
    /// Returns `Ok(false)` if it had already failed.
    ///
    /// # Errors
    ///
    /// Conflict if the payment already succeeded.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn mark_payment_failed(&self, payment_id: &str, reason: &str) -> Result<bool> {
        validate_id(payment_id)?;
        let payment = self.load_payment(payment_id).await?;
        if payment.is_settled() {
            return Err(BillingError::PaymentAlreadySettled {
                payment_id: payment_id.to_string(),
            }
            .into());
        }

        if !self.store.mark_payment_failed(payment_id, reason).await? {
            // Lost a race with settlement, or it had already failed.
            let current = self.load_payment(payment_id).await?;
            if current.is_settled() {
                return Err(BillingError::PaymentAlreadySettled {
                    payment_id: payment_id.to_string(),
                }
                .into());
            }
            return Ok(false);
        }

        warn!(reason = %reason, "Payment failed");
        self.audit
            .log(BillingAuditEvent::PaymentFailed {
                organization_id: payment.organization_id.clone(),
                payment_id: payment_id.to_string(),
                reason: reason.to_string(),
            })
            .await;
        Ok(true)
    }

    /// Record the membership agreement signature and advance onboarding.
    #[instrument(skip(self), fields(membership_id = %membership_id))]
    pub async fn record_agreement_signed(
        &self,
        membership_id: &str,
        signed_at: DateTime<Utc>,
    ) -> Result<Membership> {
        validate_id(membership_id)?;
        let mut membership = self.load_membership(membership_id).await?;
        if membership.status.is_terminal() {
            return Err(BillingError::InvalidStatusTransition {
                from: membership.status.to_string(),
                to: MembershipStatus::AwaitingSignature.to_string(),
            }
            .into());
        }
        let org = self.load_organization(&membership.organization_id).await?;
        let resolved = self.config.resolve_for(&org)?;

        let previous = membership.status;
        if membership.agreement_signed_at.is_none() {
            membership.agreement_signed_at = Some(signed_at);
        }
        if let Some(next) = onboarding_target(&membership, resolved.eligibility_months) {
            if membership.status.can_transition_to(next) {
                membership.status = next;
            }
        }
        membership.updated_at = Utc::now();

        self.store.update_membership(&membership).await?;
        self.log_status_change(&org, &membership, previous, None).await;
        Ok(membership)
    }

    /// Set a membership's status directly.
    ///
    /// Bypasses the forward graph (an admin may lapse or reinstate anyone)
    /// but never leaves `Cancelled`.
    #[instrument(skip(self), fields(membership_id = %membership_id, status = %status))]
    pub async fn admin_override_status(
        &self,
        membership_id: &str,
        status: MembershipStatus,
        actor: &str,
    ) -> Result<Membership> {
        validate_id(membership_id)?;
        let mut membership = self.load_membership(membership_id).await?;
        if membership.status.is_terminal() && status != membership.status {
            return Err(BillingError::InvalidStatusTransition {
                from: membership.status.to_string(),
                to: status.to_string(),
            }
            .into());
        }
        let org = self.load_organization(&membership.organization_id).await?;

        let previous = membership.status;
        membership.status = status;
        membership.updated_at = Utc::now();
        self.store.update_membership(&membership).await?;
        self.log_status_change(&org, &membership, previous, Some(actor)).await;
        Ok(membership)
    }

    /// Lapse recommendations for every membership of an organization.
    pub async fn lapse_recommendations(
        &self,
        organization_id: &str,
        today: NaiveDate,
    ) -> Result<Vec<LapseRecommendation>> {
        let org = self.load_organization(organization_id).await?;
        let resolved = self.config.resolve_for(&org)?;

        let mut recommendations = Vec::new();
        for membership in self.store.list_memberships(organization_id).await? {
            if membership.status != MembershipStatus::Current {
                continue;
            }
            let payments = self.store.list_payments_for_membership(&membership.id).await?;
            if let Some(rec) = lapse_recommendation(&membership, &payments, today, &resolved) {
                recommendations.push(rec);
            }
        }
        Ok(recommendations)
    }

    async fn report_partial(
        &self,
        org: &Organization,
        payment: &Payment,
        membership_id: &str,
        reason: String,
    ) -> SettlementResult {
        warn!(
            membership_id = %membership_id,
            error = %reason,
            "Payment marked paid but membership update failed"
        );
        self.audit
            .log(BillingAuditEvent::SettlementIncomplete {
                organization_id: org.id.clone(),
                membership_id: membership_id.to_string(),
                payment_id: payment.id.clone(),
                reason: reason.clone(),
            })
            .await;
        SettlementResult::PartiallySettled {
            payment_id: payment.id.clone(),
            membership_id: membership_id.to_string(),
            reason,
        }
    }

    async fn log_status_change(
        &self,
        org: &Organization,
        membership: &Membership,
        previous: MembershipStatus,
        actor: Option<&str>,
    ) {
        if previous == membership.status {
            return;
        }
        self.audit
            .log(BillingAuditEvent::MembershipStatusChanged {
                organization_id: org.id.clone(),
                membership_id: membership.id.clone(),
                from: previous.to_string(),
                to: membership.status.to_string(),
                actor: actor.map(str::to_string),
            })
            .await;
    }

    async fn load_payment(&self, payment_id: &str) -> Result<Payment> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| {
                BillingError::PaymentNotFound {
                    payment_id: payment_id.to_string(),
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
}
