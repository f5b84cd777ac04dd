//! Payment reminder scheduling.
//!
//! [`is_reminder_due`] and [`record_reminder`] are pure functions over a
//! [`ReminderState`] snapshot and an explicit `today`. [`ReminderProcessor`]
//! applies them to every open payment of an organization.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::config::BillingConfig;
use super::error::BillingError;
use super::storage::BillingStore;
use super::types::{Organization, Payment};
use crate::error::Result;
use crate::utils::local_date;

/// Ascending day offsets after the due date plus a reminder cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderSchedule {
    days: Vec<u32>,
    max_reminders: u32,
}

impl ReminderSchedule {
    /// Build a schedule.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidReminderSchedule` if `days` is empty,
    /// contains zero, is not strictly ascending, or `max_reminders` is zero.
    pub fn new(days: Vec<u32>, max_reminders: u32) -> std::result::Result<Self, BillingError> {
        if days.is_empty() {
            return Err(BillingError::InvalidReminderSchedule {
                reason: "schedule must contain at least one day".to_string(),
            });
        }
        if days.iter().any(|d| *d == 0) {
            return Err(BillingError::InvalidReminderSchedule {
                reason: "day offsets must be positive".to_string(),
            });
        }
        if days.windows(2).any(|w| w[0] >= w[1]) {
            return Err(BillingError::InvalidReminderSchedule {
                reason: format!("day offsets must be strictly ascending, got {:?}", days),
            });
        }
        if max_reminders == 0 {
            return Err(BillingError::InvalidReminderSchedule {
                reason: "max reminders must be at least 1".to_string(),
            });
        }
        Ok(Self { days, max_reminders })
    }

    #[must_use]
    pub fn days(&self) -> &[u32] {
        &self.days
    }

    /// Reminders that can actually fire: the cap, or fewer if the schedule
    /// has fewer entries.
    #[must_use]
    pub fn max_reminders(&self) -> u32 {
        let len = u32::try_from(self.days.len()).unwrap_or(u32::MAX);
        self.max_reminders.min(len)
    }

    /// Offset for the reminder following `reminder_count` sent ones.
    #[must_use]
    pub fn offset_for(&self, reminder_count: u32) -> Option<u32> {
        self.days.get(reminder_count as usize).copied()
    }
}

impl Default for ReminderSchedule {
    fn default() -> Self {
        Self {
            days: vec![3, 7, 14],
            max_reminders: 3,
        }
    }
}

/// Reminder bookkeeping of one payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderState {
    pub due_date: NaiveDate,
    pub reminder_count: u32,
    /// Local calendar day the last reminder went out.
    pub last_sent_on: Option<NaiveDate>,
    pub requires_review: bool,
}

impl ReminderState {
    /// Snapshot a payment's reminder fields, reading the last-sent instant
    /// as a calendar day in `tz`.
    #[must_use]
    pub fn from_payment(payment: &Payment, tz: Tz) -> Self {
        Self {
            due_date: payment.due_date,
            reminder_count: payment.reminder_count,
            last_sent_on: payment.reminder_sent_at.map(|at| local_date(at, tz)),
            requires_review: payment.requires_review,
        }
    }
}

/// Outcome of [`record_reminder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReminderDecision {
    NotDue,
    Send {
        /// 1-based number of the reminder being sent.
        reminder_number: u32,
        /// This reminder reached the cap.
        flagged_for_review: bool,
    },
}

/// Whole days from `from` to `to`, measured between the two noons.
#[must_use]
pub fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN);
    (to.and_time(noon) - from.and_time(noon)).num_days()
}

/// Whether a reminder should go out for `state` on `today`.
///
/// True when the cap is not reached, at least `schedule[reminder_count]`
/// days have passed since the due date, and at least one day has passed
/// since the previous reminder.
#[must_use]
pub fn is_reminder_due(state: &ReminderState, schedule: &ReminderSchedule, today: NaiveDate) -> bool {
    if state.requires_review || state.reminder_count >= schedule.max_reminders() {
        return false;
    }

    let Some(offset) = schedule.offset_for(state.reminder_count) else {
        return false;
    };

    if days_between(state.due_date, today) < i64::from(offset) {
        return false;
    }

    match state.last_sent_on {
        Some(last) => days_between(last, today) >= 1,
        None => true,
    }
}

/// Apply a reminder to `state` if one is due.
///
/// On [`ReminderDecision::Send`] the count is incremented, `last_sent_on`
/// becomes `today`, and reaching the cap sets `requires_review`.
pub fn record_reminder(
    state: &mut ReminderState,
    schedule: &ReminderSchedule,
    today: NaiveDate,
) -> ReminderDecision {
    if !is_reminder_due(state, schedule, today) {
        return ReminderDecision::NotDue;
    }

    state.reminder_count += 1;
    state.last_sent_on = Some(today);
    let flagged_for_review = state.reminder_count >= schedule.max_reminders();
    if flagged_for_review {
        state.requires_review = true;
    }

    ReminderDecision::Send {
        reminder_number: state.reminder_count,
        flagged_for_review,
    }
}

/// Delivers reminder messages (email, SMS, ...).
#[async_trait]
pub trait ReminderNotifier: Send + Sync {
    async fn send_reminder(
        &self,
        organization: &Organization,
        payment: &Payment,
        reminder_number: u32,
    ) -> Result<()>;
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReminderNotifier;

#[async_trait]
impl ReminderNotifier for TracingReminderNotifier {
    async fn send_reminder(
        &self,
        organization: &Organization,
        payment: &Payment,
        reminder_number: u32,
    ) -> Result<()> {
        info!(
            organization_id = %organization.id,
            payment_id = %payment.id,
            invoice_number = %payment.invoice_number,
            reminder_number,
            "Payment reminder"
        );
        Ok(())
    }
}

/// A payment whose reminder check failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReminderFailure {
    pub payment_id: String,
    pub error: String,
}

/// Summary of one reminder pass over an organization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderRunReport {
    pub organization_id: String,
    pub checked: usize,
    pub sent: usize,
    pub flagged_for_review: usize,
    pub failures: Vec<ReminderFailure>,
}

/// Runs reminder decisions over an organization's open payments.
pub struct ReminderProcessor<S: BillingStore> {
    store: S,
    config: BillingConfig,
    notifier: Arc<dyn ReminderNotifier>,
    audit: Arc<dyn BillingAuditLogger>,
}

impl<S: BillingStore> ReminderProcessor<S> {
    /// Create a processor that logs reminders instead of sending them.
    #[must_use]
    pub fn new(store: S, config: BillingConfig) -> Self {
        Self {
            store,
            config,
            notifier: Arc::new(TracingReminderNotifier),
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn ReminderNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Check every open payment of the organization and send due reminders.
    ///
    /// Per-payment failures are collected in the report; only failing to
    /// load the organization or its payments aborts the pass.
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub async fn process_organization(
        &self,
        organization_id: &str,
        today: NaiveDate,
    ) -> Result<ReminderRunReport> {
        let org = self
            .store
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| BillingError::OrganizationNotFound {
                organization_id: organization_id.to_string(),
            })?;
        let tz = org.tz()?;
        let resolved = self.config.resolve_for(&org)?;
        let payments = self.store.list_open_payments(organization_id, today).await?;

        let mut report = ReminderRunReport {
            organization_id: organization_id.to_string(),
            ..ReminderRunReport::default()
        };

        for payment in payments {
            report.checked += 1;
            match self
                .process_payment(&org, &payment, &resolved.reminder_schedule, tz, today)
                .await
            {
                Ok(ReminderDecision::NotDue) => {}
                Ok(ReminderDecision::Send { flagged_for_review, .. }) => {
                    report.sent += 1;
                    if flagged_for_review {
                        report.flagged_for_review += 1;
                    }
                }
                Err(e) => {
                    warn!(payment_id = %payment.id, error = %e, "Reminder processing failed");
                    report.failures.push(ReminderFailure {
                        payment_id: payment.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            checked = report.checked,
            sent = report.sent,
            flagged = report.flagged_for_review,
            failed = report.failures.len(),
            "Reminder pass complete"
        );
        Ok(report)
    }

    async fn process_payment(
        &self,
        org: &Organization,
        payment: &Payment,
        schedule: &ReminderSchedule,
        tz: Tz,
        today: NaiveDate,
    ) -> Result<ReminderDecision> {
        let mut state = ReminderState::from_payment(payment, tz);
        let decision = record_reminder(&mut state, schedule, today);

        let ReminderDecision::Send { reminder_number, flagged_for_review } = decision else {
            debug!(payment_id = %payment.id, "No reminder due");
            return Ok(decision);
        };

        // Bookkeeping is only written after delivery so a failed send is retried.
        self.notifier.send_reminder(org, payment, reminder_number).await?;

        self.store
            .update_reminder_state(
                &payment.id,
                state.reminder_count,
                noon_instant(today, tz),
                state.requires_review,
            )
            .await?;

        self.audit
            .log(BillingAuditEvent::ReminderSent {
                organization_id: org.id.clone(),
                payment_id: payment.id.clone(),
                reminder_number,
            })
            .await;

        if flagged_for_review {
            self.audit
                .log(BillingAuditEvent::PaymentFlaggedForReview {
                    organization_id: org.id.clone(),
                    payment_id: payment.id.clone(),
                    reminder_count: state.reminder_count,
                })
                .await;
        }

        Ok(decision)
    }
}

/// Noon of `day` in `tz`, as a UTC instant.
fn noon_instant(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN);
    let local = day.and_time(noon);
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn state(count: u32, last: Option<NaiveDate>) -> ReminderState {
        ReminderState {
            due_date: date(2025, 1, 1),
            reminder_count: count,
            last_sent_on: last,
            requires_review: false,
        }
    }

    #[test]
    fn test_schedule_validation() {
        assert!(ReminderSchedule::new(vec![3, 7, 14], 3).is_ok());
        assert!(ReminderSchedule::new(vec![], 3).is_err());
        assert!(ReminderSchedule::new(vec![0, 7], 3).is_err());
        assert!(ReminderSchedule::new(vec![7, 7], 3).is_err());
        assert!(ReminderSchedule::new(vec![3], 0).is_err());
    }

    #[test]
    fn test_effective_max_is_bounded_by_schedule() {
        let schedule = ReminderSchedule::new(vec![5, 10], 3).unwrap();
        assert_eq!(schedule.max_reminders(), 2);
    }

    #[test]
    fn test_not_due_before_first_offset() {
        let schedule = ReminderSchedule::default();
        assert!(!is_reminder_due(&state(0, None), &schedule, date(2025, 1, 3)));
        assert!(is_reminder_due(&state(0, None), &schedule, date(2025, 1, 4)));
    }

    #[test]
    fn test_cooldown_after_firing() {
        let schedule = ReminderSchedule::default();
        let mut s = state(0, None);
        let today = date(2025, 1, 20);

        assert_eq!(
            record_reminder(&mut s, &schedule, today),
            ReminderDecision::Send { reminder_number: 1, flagged_for_review: false }
        );
        // Day 19 is past every offset, but the same-day cooldown holds.
        assert!(!is_reminder_due(&s, &schedule, today));
        assert!(is_reminder_due(&s, &schedule, date(2025, 1, 21)));
    }

    #[test]
    fn test_cap_reached_never_due() {
        let schedule = ReminderSchedule::default();
        let s = state(3, Some(date(2025, 1, 15)));
        assert!(!is_reminder_due(&s, &schedule, date(2025, 3, 1)));
    }

    #[test]
    fn test_full_escalation() {
        let schedule = ReminderSchedule::default();
        let mut s = state(0, None);

        assert!(matches!(
            record_reminder(&mut s, &schedule, date(2025, 1, 4)),
            ReminderDecision::Send { reminder_number: 1, .. }
        ));
        assert_eq!(record_reminder(&mut s, &schedule, date(2025, 1, 7)), ReminderDecision::NotDue);
        assert!(matches!(
            record_reminder(&mut s, &schedule, date(2025, 1, 8)),
            ReminderDecision::Send { reminder_number: 2, .. }
        ));
        assert_eq!(
            record_reminder(&mut s, &schedule, date(2025, 1, 15)),
            ReminderDecision::Send { reminder_number: 3, flagged_for_review: true }
        );
        assert!(s.requires_review);
        assert_eq!(record_reminder(&mut s, &schedule, date(2025, 1, 31)), ReminderDecision::NotDue);
    }

    #[test]
    fn test_days_between() {
        assert_eq!(days_between(date(2025, 1, 1), date(2025, 1, 4)), 3);
        assert_eq!(days_between(date(2025, 3, 8), date(2025, 3, 10)), 2);
        assert_eq!(days_between(date(2025, 1, 4), date(2025, 1, 1)), -3);
    }

    #[test]
    fn test_noon_instant_uses_local_noon() {
        let tz: Tz = "America/Chicago".parse().unwrap();
        let instant = noon_instant(date(2025, 1, 4), tz);
        assert_eq!(instant.to_rfc3339(), "2025-01-04T18:00:00+00:00");
        assert_eq!(local_date(instant, tz), date(2025, 1, 4));
    }
}
