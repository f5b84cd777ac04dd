//! Membership application review.
//!
//! Approval creates the membership first and then claims the application
//! with a conditional update. Two reviewers approving at once both create a
//! membership, but only one claim succeeds; the loser removes its membership
//! and gets a conflict.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::error::BillingError;
use super::storage::{ApplicationDecision, BillingStore};
use super::types::{Application, ApplicationStatus, Membership, Organization};
use super::validation::{ensure_same_tenant, validate_id};
use crate::error::{DuesError, Result};

/// Best-effort notifications sent after an application is approved.
#[async_trait]
pub trait OnboardingNotifier: Send + Sync {
    /// Tell the applicant they were accepted.
    async fn send_welcome(
        &self,
        org: &Organization,
        application: &Application,
        membership: &Membership,
    ) -> Result<()>;

    /// Open a processor checkout session for the first payment.
    ///
    /// Returns the session URL, or `None` if the deployment has no processor.
    async fn create_checkout_session(
        &self,
        org: &Organization,
        membership: &Membership,
    ) -> Result<Option<String>>;
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOnboardingNotifier;

#[async_trait]
impl OnboardingNotifier for TracingOnboardingNotifier {
    async fn send_welcome(
        &self,
        org: &Organization,
        application: &Application,
        membership: &Membership,
    ) -> Result<()> {
        info!(
            target: "duesledger::billing::onboarding",
            organization_id = %org.id,
            application_id = %application.id,
            membership_id = %membership.id,
            "Welcome notification"
        );
        Ok(())
    }

    async fn create_checkout_session(
        &self,
        _org: &Organization,
        _membership: &Membership,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

/// A side effect attempted after approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    WelcomeNotification,
    CheckoutSession,
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WelcomeNotification => f.write_str("welcome_notification"),
            Self::CheckoutSession => f.write_str("checkout_session"),
        }
    }
}

/// How one side effect went. Failures never undo the approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SideEffectResult {
    pub effect: SideEffect,
    pub succeeded: bool,
    /// Extra output, e.g. the checkout URL.
    pub detail: Option<String>,
    pub error: Option<String>,
}

impl SideEffectResult {
    fn ok(effect: SideEffect, detail: Option<String>) -> Self {
        Self {
            effect,
            succeeded: true,
            detail,
            error: None,
        }
    }

    fn failed(effect: SideEffect, error: &DuesError) -> Self {
        Self {
            effect,
            succeeded: false,
            detail: None,
            error: Some(error.to_string()),
        }
    }
}

/// Result of an approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardingReport {
    pub application_id: String,
    pub membership: Membership,
    pub side_effects: Vec<SideEffectResult>,
}

impl OnboardingReport {
    /// Side effects that failed and may need a retry.
    pub fn failed_side_effects(&self) -> impl Iterator<Item = &SideEffectResult> {
        self.side_effects.iter().filter(|r| !r.succeeded)
    }
}

/// Approves and rejects membership applications.
pub struct OnboardingService<S: BillingStore> {
    store: S,
    notifier: Arc<dyn OnboardingNotifier>,
    audit: Arc<dyn BillingAuditLogger>,
}

impl<S: BillingStore> OnboardingService<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            notifier: Arc::new(TracingOnboardingNotifier),
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn OnboardingNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Approve a pending application and create its membership.
    ///
    /// # Errors
    ///
    /// NotFound for a missing application or plan, Conflict
    /// (`ApplicationAlreadyProcessed`) if the application was already
    /// decided, including by a concurrent reviewer.
    #[instrument(skip(self), fields(application_id = %application_id))]
    pub async fn approve_application(
        &self,
        application_id: &str,
        reviewer: &str,
    ) -> Result<OnboardingReport> {
        validate_id(application_id)?;
        let reviewer = require_reviewer(reviewer)?;
        let application = self.load_pending(application_id).await?;

        let org = self
            .store
            .get_organization(&application.organization_id)
            .await?
            .ok_or_else(|| BillingError::OrganizationNotFound {
                organization_id: application.organization_id.clone(),
            })?;
        let plan = self
            .store
            .get_plan(&application.plan_id)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound {
                plan_id: application.plan_id.clone(),
            })?;
        ensure_same_tenant(&org.id, &plan.organization_id)?;

        let membership = Membership::new(
            org.id.clone(),
            plan.id.clone(),
            application.billing_frequency,
            application.requested_start,
        );
        self.store.create_membership(&membership).await?;

        let decision = ApplicationDecision {
            status: ApplicationStatus::Approved,
            reviewed_by: reviewer.to_string(),
            reviewed_at: Utc::now(),
            rejection_reason: None,
            membership_id: Some(membership.id.clone()),
        };
        let claimed = match self.store.decide_application(application_id, &decision).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.discard_membership(&membership).await;
                return Err(e);
            }
        };
        if !claimed {
            self.discard_membership(&membership).await;
            return Err(self.already_processed(application_id).await);
        }

        info!(membership_id = %membership.id, reviewer, "Application approved");
        self.audit
            .log(BillingAuditEvent::ApplicationApproved {
                organization_id: org.id.clone(),
                application_id: application_id.to_string(),
                membership_id: membership.id.clone(),
                reviewer: reviewer.to_string(),
            })
            .await;

        let side_effects = self.run_side_effects(&org, &application, &membership).await;

        Ok(OnboardingReport {
            application_id: application_id.to_string(),
            membership,
            side_effects,
        })
    }

    /// Reject a pending application.
    ///
    /// # Errors
    ///
    /// Conflict if the application was already decided.
    #[instrument(skip(self, reason), fields(application_id = %application_id))]
    pub async fn reject_application(
        &self,
        application_id: &str,
        reviewer: &str,
        reason: &str,
    ) -> Result<Application> {
        validate_id(application_id)?;
        let reviewer = require_reviewer(reviewer)?;
        let mut application = self.load_pending(application_id).await?;

        let decision = ApplicationDecision {
            status: ApplicationStatus::Rejected,
            reviewed_by: reviewer.to_string(),
            reviewed_at: Utc::now(),
            rejection_reason: Some(reason.trim().to_string()).filter(|r| !r.is_empty()),
            membership_id: None,
        };
        if !self.store.decide_application(application_id, &decision).await? {
            return Err(self.already_processed(application_id).await);
        }

        application.status = decision.status;
        application.reviewed_by = Some(decision.reviewed_by);
        application.reviewed_at = Some(decision.reviewed_at);
        application.rejection_reason = decision.rejection_reason;

        info!(reviewer, "Application rejected");
        self.audit
            .log(BillingAuditEvent::ApplicationRejected {
                organization_id: application.organization_id.clone(),
                application_id: application_id.to_string(),
                reviewer: reviewer.to_string(),
            })
            .await;

        Ok(application)
    }

    async fn run_side_effects(
        &self,
        org: &Organization,
        application: &Application,
        membership: &Membership,
    ) -> Vec<SideEffectResult> {
        let welcome = match self.notifier.send_welcome(org, application, membership).await {
            Ok(()) => SideEffectResult::ok(SideEffect::WelcomeNotification, None),
            Err(e) => {
                warn!(membership_id = %membership.id, error = %e, "Welcome notification failed");
                SideEffectResult::failed(SideEffect::WelcomeNotification, &e)
            }
        };

        let checkout = match self.notifier.create_checkout_session(org, membership).await {
            Ok(url) => SideEffectResult::ok(SideEffect::CheckoutSession, url),
            Err(e) => {
                warn!(membership_id = %membership.id, error = %e, "Checkout session failed");
                SideEffectResult::failed(SideEffect::CheckoutSession, &e)
            }
        };

        vec![welcome, checkout]
    }

    async fn load_pending(&self, application_id: &str) -> Result<Application> {
        let application = self
            .store
            .get_application(application_id)
            .await?
            .ok_or_else(|| BillingError::ApplicationNotFound {
                application_id: application_id.to_string(),
            })?;
        if application.status != ApplicationStatus::Pending {
            return Err(BillingError::ApplicationAlreadyProcessed {
                application_id: application_id.to_string(),
                status: application.status.to_string(),
            }
            .into());
        }
        Ok(application)
    }

    async fn already_processed(&self, application_id: &str) -> DuesError {
        let status = match self.store.get_application(application_id).await {
            Ok(Some(app)) => app.status.to_string(),
            _ => "processed".to_string(),
        };
        BillingError::ApplicationAlreadyProcessed {
            application_id: application_id.to_string(),
            status,
        }
        .into()
    }

    async fn discard_membership(&self, membership: &Membership) {
        if let Err(e) = self.store.delete_membership(&membership.id).await {
            warn!(
                membership_id = %membership.id,
                error = %e,
                "Could not remove membership from lost approval"
            );
        }
    }
}

fn require_reviewer(reviewer: &str) -> Result<&str> {
    let reviewer = reviewer.trim();
    if reviewer.is_empty() {
        return Err(DuesError::validation("reviewer is required"));
    }
    Ok(reviewer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::memory::InMemoryBillingStore;
    use crate::billing::storage::{ApplicationStore, MembershipStore, OrganizationStore, PlanStore};
    use crate::billing::types::{BillingFrequency, MembershipStatus, Plan};
    use chrono::NaiveDate;

    struct FailingCheckout;

    #[async_trait]
    impl OnboardingNotifier for FailingCheckout {
        async fn send_welcome(&self, _: &Organization, _: &Application, _: &Membership) -> Result<()> {
            Ok(())
        }

        async fn create_checkout_session(
            &self,
            _: &Organization,
            _: &Membership,
        ) -> Result<Option<String>> {
            Err(DuesError::dependency("processor unavailable"))
        }
    }

    async fn setup() -> InMemoryBillingStore {
        let store = InMemoryBillingStore::new();
        store
            .save_organization(&Organization::new("org_1", "Masjid Muhajireen"))
            .await
            .unwrap();
        store
            .save_plan(&Plan {
                id: "plan_1".to_string(),
                organization_id: "org_1".to_string(),
                name: "Individual".to_string(),
                monthly_price_cents: 5000,
                biannual_price_cents: 28000,
                annual_price_cents: 54000,
                enrollment_fee_cents: 2500,
                is_active: true,
            })
            .await
            .unwrap();
        store
            .save_application(&Application {
                id: "app_1".to_string(),
                organization_id: "org_1".to_string(),
                plan_id: "plan_1".to_string(),
                applicant_name: "Amina Yusuf".to_string(),
                email: "amina@example.org".to_string(),
                billing_frequency: BillingFrequency::Monthly,
                requested_start: NaiveDate::from_ymd_opt(2025, 3, 15).unwrap(),
                status: ApplicationStatus::Pending,
                reviewed_by: None,
                reviewed_at: None,
                rejection_reason: None,
                membership_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_approve_creates_pending_membership() {
        let store = setup().await;
        let report = OnboardingService::new(store.clone())
            .approve_application("app_1", "admin_1")
            .await
            .unwrap();

        assert_eq!(report.membership.status, MembershipStatus::Pending);
        assert_eq!(report.membership.billing_anniversary_day, 15);
        assert_eq!(report.side_effects.len(), 2);
        assert!(report.side_effects.iter().all(|r| r.succeeded));

        let app = store.get_application("app_1").await.unwrap().unwrap();
        assert_eq!(app.status, ApplicationStatus::Approved);
        assert_eq!(app.membership_id.as_deref(), Some(report.membership.id.as_str()));
        assert_eq!(store.list_memberships("org_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_approval_conflicts() {
        let store = setup().await;
        let service = OnboardingService::new(store.clone());
        service.approve_application("app_1", "admin_1").await.unwrap();

        let err = service.approve_application("app_1", "admin_2").await.unwrap_err();
        assert!(matches!(err, DuesError::Conflict(_)));
        assert_eq!(store.list_memberships("org_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_side_effect_failure_keeps_approval() {
        let store = setup().await;
        let report = OnboardingService::new(store.clone())
            .with_notifier(Arc::new(FailingCheckout))
            .approve_application("app_1", "admin_1")
            .await
            .unwrap();

        let failed: Vec<_> = report.failed_side_effects().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].effect, SideEffect::CheckoutSession);
        assert!(store.get_membership(&report.membership.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_failure_removes_membership() {
        let store = setup().await;
        store.fail_on("decide_application");
        let err = OnboardingService::new(store.clone())
            .approve_application("app_1", "admin_1")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.list_memberships("org_1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject() {
        let store = setup().await;
        let service = OnboardingService::new(store.clone());
        let app = service
            .reject_application("app_1", "admin_1", "incomplete form")
            .await
            .unwrap();
        assert_eq!(app.status, ApplicationStatus::Rejected);
        assert_eq!(app.rejection_reason.as_deref(), Some("incomplete form"));

        let err = service.approve_application("app_1", "admin_1").await.unwrap_err();
        assert!(matches!(err, DuesError::Conflict(_)));

        let err = service.reject_application("app_1", " ", "dup").await.unwrap_err();
        assert!(matches!(err, DuesError::Validation(_)));
    }
}
