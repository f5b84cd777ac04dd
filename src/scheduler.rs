//! Background billing scheduler
//!
//! Every interval the scheduler walks all organizations and, for each one,
//! runs the billing pass and then the reminder pass for the organization's
//! local date.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::billing::{
    BillingAuditLogger, BillingRun, BillingStore, FeeCalculator, NoOpAuditLogger, Organization,
    ReminderNotifier, ReminderProcessor, TracingReminderNotifier,
};
use crate::config::{Config, SchedulerConfig};
use crate::error::Result;
use crate::utils::{local_date, Clock, SystemClock};

/// What one pass did for one organization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizationPass {
    pub organization_id: String,
    pub payments_created: usize,
    pub billing_failures: usize,
    pub reminders_sent: usize,
    pub flagged_for_review: usize,
    pub reminder_failures: usize,
}

/// Periodically runs billing and reminders for every organization
pub struct BillingScheduler<S: BillingStore + Clone> {
    store: S,
    run: BillingRun<S>,
    reminders: ReminderProcessor<S>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    shutdown_tx: mpsc::Sender<()>,
}

impl<S: BillingStore + Clone + 'static> BillingScheduler<S> {
    /// Create a scheduler and the receiver to pass to [`start`](Self::start)
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the processor fee settings are invalid.
    pub fn new(store: S, config: &Config) -> Result<(Self, mpsc::Receiver<()>)> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let fees = FeeCalculator::new(config.processor.clone())?;
        let audit: Arc<dyn BillingAuditLogger> = Arc::new(NoOpAuditLogger);
        let notifier: Arc<dyn ReminderNotifier> = Arc::new(TracingReminderNotifier);

        Ok((
            Self {
                run: BillingRun::new(store.clone(), config.billing.clone(), fees)
                    .with_audit_logger(audit.clone()),
                reminders: ReminderProcessor::new(store.clone(), config.billing.clone())
                    .with_notifier(notifier)
                    .with_audit_logger(audit),
                store,
                config: config.scheduler.clone(),
                clock: Arc::new(SystemClock),
                shutdown_tx,
            },
            shutdown_rx,
        ))
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.run = self.run.with_audit_logger(audit.clone());
        self.reminders = self.reminders.with_audit_logger(audit);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn ReminderNotifier>) -> Self {
        self.reminders = self.reminders.with_notifier(notifier);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.run = self.run.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// Sender that stops a running scheduler
    #[must_use]
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run passes until shutdown is requested via the shutdown channel
    pub async fn start(self, mut shutdown_rx: mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Billing scheduler disabled");
            return;
        }
        info!(interval_seconds = self.config.interval_seconds, "Billing scheduler started");

        loop {
            let (result, stopping) = self.run_pass(Some(&mut shutdown_rx)).await;
            match result {
                Ok(passes) => debug!(organizations = passes.len(), "Billing pass complete"),
                Err(e) => error!(error = %e, "Billing pass failed"),
            }
            if stopping {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = sleep(self.config.interval()) => {},
            }
        }

        info!("Billing scheduler stopped");
    }

    /// Run one pass over every organization
    ///
    /// An organization that fails is logged and skipped.
    pub async fn run_once(&self) -> Result<Vec<OrganizationPass>> {
        self.run_pass(None).await.0
    }

    /// One pass, checking for shutdown between organizations. An
    /// organization already started is always finished.
    async fn run_pass(
        &self,
        mut shutdown_rx: Option<&mut mpsc::Receiver<()>>,
    ) -> (Result<Vec<OrganizationPass>>, bool) {
        let organizations = match self.store.list_organizations().await {
            Ok(organizations) => organizations,
            Err(e) => return (Err(e), false),
        };
        let mut passes = Vec::with_capacity(organizations.len());

        for org in organizations {
            if let Some(rx) = shutdown_rx.as_deref_mut() {
                if rx.try_recv().is_ok() {
                    info!(
                        completed = passes.len(),
                        "Shutdown signal received, stopping after current organization"
                    );
                    return (Ok(passes), true);
                }
            }

            match self.run_organization(&org).await {
                Ok(pass) => {
                    info!(
                        organization_id = %pass.organization_id,
                        payments_created = pass.payments_created,
                        reminders_sent = pass.reminders_sent,
                        flagged_for_review = pass.flagged_for_review,
                        "Organization pass complete"
                    );
                    passes.push(pass);
                }
                Err(e) => {
                    warn!(organization_id = %org.id, error = %e, "Organization pass failed");
                }
            }
        }

        (Ok(passes), false)
    }

    async fn run_organization(&self, org: &Organization) -> Result<OrganizationPass> {
        let tz = org.tz()?;
        let today = local_date(self.clock.now(), tz);

        let billing = self.run.run_for_organization(&org.id, today).await?;
        let reminders = self.reminders.process_organization(&org.id, today).await?;

        Ok(OrganizationPass {
            organization_id: org.id.clone(),
            payments_created: billing.created.len(),
            billing_failures: billing.failures.len(),
            reminders_sent: reminders.sent,
            flagged_for_review: reminders.flagged_for_review,
            reminder_failures: reminders.failures.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{
        BillingFrequency, InMemoryBillingStore, Membership, MembershipStore, OrganizationStore,
        Payment, PaymentMethod, PaymentStatus, PaymentStore, PaymentType, Plan, PlanStore,
    };
    use crate::utils::FixedClock;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::time::Duration;

    async fn seeded_store() -> InMemoryBillingStore {
        let store = InMemoryBillingStore::new();
        let mut org = Organization::new("org_1", "Masjid Muhajireen");
        org.timezone = "America/Chicago".to_string();
        store.save_organization(&org).await.unwrap();
        store
            .save_plan(&Plan {
                id: "plan_1".to_string(),
                organization_id: "org_1".to_string(),
                name: "Individual".to_string(),
                monthly_price_cents: 5000,
                biannual_price_cents: 28000,
                annual_price_cents: 54000,
                enrollment_fee_cents: 0,
                is_active: true,
            })
            .await
            .unwrap();
        let membership = Membership::new(
            "org_1",
            "plan_1",
            BillingFrequency::Monthly,
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
        );
        store.create_membership(&membership).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_run_once_uses_local_date() {
        let store = seeded_store().await;
        // 2025-02-01 03:00 UTC is still January 31 in Chicago.
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2025, 2, 1, 3, 0, 0).unwrap()));
        let (scheduler, _rx) = BillingScheduler::new(store.clone(), &Config::default()).unwrap();
        let scheduler = scheduler.with_clock(clock);

        let passes = scheduler.run_once().await.unwrap();
        assert_eq!(passes.len(), 1);
        assert_eq!(passes[0].payments_created, 0);

        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2025, 2, 1, 18, 0, 0).unwrap()));
        let scheduler = scheduler.with_clock(clock);
        let passes = scheduler.run_once().await.unwrap();
        assert_eq!(passes[0].payments_created, 1);
        assert_eq!(store.payments_for_organization("org_1").len(), 1);
    }

    #[tokio::test]
    async fn test_bad_timezone_skips_organization() {
        let store = seeded_store().await;
        let mut broken = Organization::new("org_2", "Dar Al-Hijrah");
        broken.timezone = "Mars/Olympus".to_string();
        store.save_organization(&broken).await.unwrap();

        let (scheduler, _rx) = BillingScheduler::new(store, &Config::default()).unwrap();
        let passes = scheduler.run_once().await.unwrap();
        assert_eq!(passes.len(), 1);
        assert_eq!(passes[0].organization_id, "org_1");
    }

    /// Requests shutdown from inside a reminder delivery.
    struct ShutdownDuringDelivery {
        shutdown: mpsc::Sender<()>,
    }

    #[async_trait::async_trait]
    impl ReminderNotifier for ShutdownDuringDelivery {
        async fn send_reminder(
            &self,
            _organization: &Organization,
            _payment: &Payment,
            _reminder_number: u32,
        ) -> Result<()> {
            let _ = self.shutdown.send(()).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    }

    fn overdue_payment(org: &str, id: &str) -> Payment {
        Payment {
            id: id.to_string(),
            organization_id: org.to_string(),
            membership_id: "mem_x".to_string(),
            payment_type: PaymentType::Dues,
            method: PaymentMethod::Processor,
            status: PaymentStatus::Pending,
            amount_cents: 5000,
            processor_fee_cents: 175,
            platform_fee_cents: 0,
            total_charged_cents: 5000,
            net_amount_cents: 4825,
            months_credited: 1,
            invoice_number: format!("INV-MM-202501-{}", &id[4..]),
            due_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            period_start: None,
            period_end: None,
            period_label: None,
            reminder_count: 0,
            reminder_sent_at: None,
            requires_review: false,
            processor_payment_id: None,
            paid_at: None,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_shutdown_finishes_current_organization() {
        let store = seeded_store().await;
        let mut second = Organization::new("org_2", "Dar Al-Hijrah");
        second.timezone = "America/Chicago".to_string();
        store.save_organization(&second).await.unwrap();
        store.create_payment(&overdue_payment("org_1", "pay_1")).await.unwrap();
        store.create_payment(&overdue_payment("org_2", "pay_2")).await.unwrap();

        // 2025-01-04 noon in Chicago: three days overdue, first reminder due.
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2025, 1, 4, 18, 0, 0).unwrap()));
        let (scheduler, rx) = BillingScheduler::new(store.clone(), &Config::default()).unwrap();
        let notifier = ShutdownDuringDelivery {
            shutdown: scheduler.shutdown_handle(),
        };
        let scheduler = scheduler.with_clock(clock).with_notifier(Arc::new(notifier));

        tokio::time::timeout(Duration::from_secs(5), scheduler.start(rx))
            .await
            .unwrap();

        // Organizations run in id order. The delivery that requested shutdown
        // is recorded and org_2 is left for the next run.
        let delivered = store.get_payment("pay_1").await.unwrap().unwrap();
        let skipped = store.get_payment("pay_2").await.unwrap().unwrap();
        assert_eq!(delivered.reminder_count, 1);
        assert_eq!(skipped.reminder_count, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let store = seeded_store().await;
        let mut config = Config::default();
        config.scheduler.interval_seconds = 3600;
        let (scheduler, rx) = BillingScheduler::new(store, &config).unwrap();
        let shutdown = scheduler.shutdown_handle();

        let handle = tokio::spawn(scheduler.start(rx));
        shutdown.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
