//! Audit trail for dues billing.
//!
//! Provides a trait-based audit trail for money movement and membership
//! status changes. Useful for reconciliation and dispute handling.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Something an operator may need to reconstruct later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingAuditEvent {
    /// A payment row was created by a billing run or manual action.
    PaymentCreated {
        organization_id: String,
        membership_id: String,
        payment_id: String,
        invoice_number: String,
        payment_type: String,
        amount_cents: i64,
    },
    /// A payment was settled and its effects applied.
    PaymentSettled {
        organization_id: String,
        membership_id: String,
        payment_id: String,
        paid_months: u32,
        status: String,
    },
    /// The payment is paid but the membership update did not land.
    SettlementIncomplete {
        organization_id: String,
        membership_id: String,
        payment_id: String,
        reason: String,
    },
    /// A payment was marked failed.
    PaymentFailed {
        organization_id: String,
        payment_id: String,
        reason: String,
    },
    /// Membership moved between states.
    MembershipStatusChanged {
        organization_id: String,
        membership_id: String,
        from: String,
        to: String,
        actor: Option<String>,
    },
    /// Membership crossed the eligibility threshold.
    MembershipBecameEligible {
        organization_id: String,
        membership_id: String,
        eligible_since: String,
    },
    /// Enrollment fee waived because the plan charges none.
    EnrollmentFeeWaived {
        organization_id: String,
        membership_id: String,
    },
    /// Payment reminder sent.
    ReminderSent {
        organization_id: String,
        payment_id: String,
        reminder_number: u32,
    },
    /// Payment exhausted its reminders and needs manual handling.
    PaymentFlaggedForReview {
        organization_id: String,
        payment_id: String,
        reminder_count: u32,
    },
    /// Application approved and membership created.
    ApplicationApproved {
        organization_id: String,
        application_id: String,
        membership_id: String,
        reviewer: String,
    },
    /// Application rejected.
    ApplicationRejected {
        organization_id: String,
        application_id: String,
        reviewer: String,
    },
    /// Processor event received.
    WebhookReceived {
        event_id: String,
        event_type: String,
    },
    /// Processor event processed.
    WebhookProcessed {
        event_id: String,
        event_type: String,
        outcome: String,
    },
}

impl fmt::Display for BillingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PaymentCreated { organization_id, membership_id, payment_id, invoice_number, payment_type, amount_cents } => {
                write!(f, "Payment created: org={}, membership={}, payment={}, invoice={}, type={}, amount={}", organization_id, membership_id, payment_id, invoice_number, payment_type, amount_cents)
            }
            Self::PaymentSettled { organization_id, membership_id, payment_id, paid_months, status } => {
                write!(f, "Payment settled: org={}, membership={}, payment={}, paid_months={}, status={}", organization_id, membership_id, payment_id, paid_months, status)
            }
            Self::SettlementIncomplete { organization_id, membership_id, payment_id, reason } => {
                write!(f, "Settlement incomplete: org={}, membership={}, payment={}, reason={}", organization_id, membership_id, payment_id, reason)
            }
            Self::PaymentFailed { organization_id, payment_id, reason } => {
                write!(f, "Payment failed: org={}, payment={}, reason={}", organization_id, payment_id, reason)
            }
            Self::MembershipStatusChanged { organization_id, membership_id, from, to, actor } => {
                write!(f, "Membership status changed: org={}, membership={}, {} -> {}, actor={}", organization_id, membership_id, from, to, actor.as_deref().unwrap_or("system"))
            }
            Self::MembershipBecameEligible { organization_id, membership_id, eligible_since } => {
                write!(f, "Membership eligible: org={}, membership={}, since={}", organization_id, membership_id, eligible_since)
            }
            Self::EnrollmentFeeWaived { organization_id, membership_id } => {
                write!(f, "Enrollment fee waived: org={}, membership={}", organization_id, membership_id)
            }
            Self::ReminderSent { organization_id, payment_id, reminder_number } => {
                write!(f, "Reminder sent: org={}, payment={}, reminder={}", organization_id, payment_id, reminder_number)
            }
            Self::PaymentFlaggedForReview { organization_id, payment_id, reminder_count } => {
                write!(f, "Payment flagged for review: org={}, payment={}, reminders={}", organization_id, payment_id, reminder_count)
            }
            Self::ApplicationApproved { organization_id, application_id, membership_id, reviewer } => {
                write!(f, "Application approved: org={}, application={}, membership={}, reviewer={}", organization_id, application_id, membership_id, reviewer)
            }
            Self::ApplicationRejected { organization_id, application_id, reviewer } => {
                write!(f, "Application rejected: org={}, application={}, reviewer={}", organization_id, application_id, reviewer)
            }
            Self::WebhookReceived { event_id, event_type } => {
                write!(f, "Webhook received: event={}, type={}", event_id, event_type)
            }
            Self::WebhookProcessed { event_id, event_type, outcome } => {
                write!(f, "Webhook processed: event={}, type={}, outcome={}", event_id, event_type, outcome)
            }
        }
    }
}

/// Destination for audit events (database table, log shipper, ...).
#[async_trait]
pub trait BillingAuditLogger: Send + Sync {
    /// Record one event. Failures stay inside the implementation.
    async fn log(&self, event: BillingAuditEvent);
}

/// Discards every event. The default for all services.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl BillingAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: BillingAuditEvent) {}
}

/// Writes events at INFO on the `billing::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl BillingAuditLogger for TracingAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        tracing::info!(
            target: "billing::audit",
            event_type = %event_kind(&event),
            "{}", event
        );
    }
}

/// Audit logger that keeps events in memory.
///
/// Cloning shares the underlying buffer, so a clone handed to a service can
/// be inspected afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLogger {
    events: Arc<Mutex<Vec<BillingAuditEvent>>>,
}

impl MemoryAuditLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events logged so far.
    pub async fn events(&self) -> Vec<BillingAuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl BillingAuditLogger for MemoryAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        self.events.lock().await.push(event);
    }
}

/// Stable snake_case name of the event, used as the `event_type` log field.
pub fn event_kind(event: &BillingAuditEvent) -> &'static str {
    match event {
        BillingAuditEvent::PaymentCreated { .. } => "payment_created",
        BillingAuditEvent::PaymentSettled { .. } => "payment_settled",
        BillingAuditEvent::SettlementIncomplete { .. } => "settlement_incomplete",
        BillingAuditEvent::PaymentFailed { .. } => "payment_failed",
        BillingAuditEvent::MembershipStatusChanged { .. } => "membership_status_changed",
        BillingAuditEvent::MembershipBecameEligible { .. } => "membership_became_eligible",
        BillingAuditEvent::EnrollmentFeeWaived { .. } => "enrollment_fee_waived",
        BillingAuditEvent::ReminderSent { .. } => "reminder_sent",
        BillingAuditEvent::PaymentFlaggedForReview { .. } => "payment_flagged_for_review",
        BillingAuditEvent::ApplicationApproved { .. } => "application_approved",
        BillingAuditEvent::ApplicationRejected { .. } => "application_rejected",
        BillingAuditEvent::WebhookReceived { .. } => "webhook_received",
        BillingAuditEvent::WebhookProcessed { .. } => "webhook_processed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_logger() {
        let logger = NoOpAuditLogger;
        logger.log(BillingAuditEvent::ReminderSent {
            organization_id: "org_1".to_string(),
            payment_id: "pay_1".to_string(),
            reminder_number: 1,
        }).await;
    }

    #[tokio::test]
    async fn test_memory_logger_shares_buffer() {
        let logger = MemoryAuditLogger::new();
        let handle = logger.clone();

        logger.log(BillingAuditEvent::PaymentFailed {
            organization_id: "org_1".to_string(),
            payment_id: "pay_1".to_string(),
            reason: "card_declined".to_string(),
        }).await;

        logger.log(BillingAuditEvent::PaymentFlaggedForReview {
            organization_id: "org_1".to_string(),
            payment_id: "pay_1".to_string(),
            reminder_count: 3,
        }).await;

        let events = handle.events().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], BillingAuditEvent::PaymentFailed { .. }));
        assert!(matches!(events[1], BillingAuditEvent::PaymentFlaggedForReview { .. }));
    }

    #[test]
    fn test_event_display() {
        let event = BillingAuditEvent::MembershipStatusChanged {
            organization_id: "org_1".to_string(),
            membership_id: "mem_1".to_string(),
            from: "pending".to_string(),
            to: "waiting_period".to_string(),
            actor: None,
        };
        let display = format!("{}", event);
        assert!(display.contains("mem_1"));
        assert!(display.contains("pending -> waiting_period"));
        assert!(display.contains("actor=system"));
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(event_kind(&BillingAuditEvent::WebhookProcessed {
            event_id: String::new(),
            event_type: String::new(),
            outcome: String::new(),
        }), "webhook_processed");

        assert_eq!(event_kind(&BillingAuditEvent::EnrollmentFeeWaived {
            organization_id: String::new(),
            membership_id: String::new(),
        }), "enrollment_fee_waived");
    }
}
