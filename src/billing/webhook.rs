//! Payment processor event handling.
//!
//! Events are delivered at least once. Each event id is recorded after it is
//! handled and redeliveries are skipped. Signature verification belongs to
//! the HTTP layer in front of this handler.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::config::BillingConfig;
use super::settlement::{SettleRequest, SettlementOutcome, SettlementResult, SettlementService};
use super::storage::BillingStore;
use super::types::PaymentMethod;
use crate::error::{DuesError, Result};

/// What a processor event reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorEventKind {
    PaymentSucceeded,
    PaymentFailed,
    /// Any event type this handler does not act on.
    Other(String),
}

impl ProcessorEventKind {
    /// Map a processor event type string.
    #[must_use]
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type {
            "payment_intent.succeeded" | "charge.succeeded" | "checkout.session.completed" => {
                Self::PaymentSucceeded
            }
            "payment_intent.payment_failed" | "charge.failed" => Self::PaymentFailed,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ProcessorEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PaymentSucceeded => f.write_str("payment_succeeded"),
            Self::PaymentFailed => f.write_str("payment_failed"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

/// A normalized processor event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    pub kind: ProcessorEventKind,
    /// Our payment id, carried in the processor object's metadata.
    pub payment_id: Option<String>,
    pub processor_payment_id: Option<String>,
    pub failure_reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

impl ProcessorEvent {
    /// Parse a processor event body.
    ///
    /// The payment id is read from `data.object.metadata.payment_id`.
    ///
    /// # Errors
    ///
    /// Validation error for malformed JSON or an out-of-range timestamp.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| DuesError::validation(format!("invalid processor event: {}", e)))?;

        let occurred_at = DateTime::from_timestamp(raw.created, 0).ok_or_else(|| {
            DuesError::validation(format!("invalid event timestamp: {}", raw.created))
        })?;

        let object = &raw.data.object;
        let text = |value: Option<&serde_json::Value>| {
            value.and_then(|v| v.as_str()).map(str::to_string)
        };

        Ok(Self {
            kind: ProcessorEventKind::from_event_type(&raw.event_type),
            payment_id: text(object.get("metadata").and_then(|m| m.get("payment_id"))),
            processor_payment_id: text(object.get("id")),
            failure_reason: text(
                object
                    .get("last_payment_error")
                    .and_then(|e| e.get("message")),
            )
            .or_else(|| text(object.get("failure_message"))),
            occurred_at,
            id: raw.id,
        })
    }
}

/// Outcome of [`ProcessorEventHandler::handle_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event id was seen before.
    AlreadyProcessed,
    /// Not an event this handler acts on.
    Ignored,
    /// The payment was settled.
    Settled(SettlementOutcome),
    /// The payment had been settled by an earlier call.
    AlreadySettled { payment_id: String },
    /// The payment is paid but its membership needs manual reconciliation.
    PartiallySettled {
        payment_id: String,
        membership_id: String,
        reason: String,
    },
    /// The payment was marked failed.
    Failed { payment_id: String },
    /// A failure event arrived for a payment that had already failed or
    /// succeeded.
    Stale { payment_id: String },
}

impl WebhookOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyProcessed => "already_processed",
            Self::Ignored => "ignored",
            Self::Settled(_) => "settled",
            Self::AlreadySettled { .. } => "already_settled",
            Self::PartiallySettled { .. } => "partially_settled",
            Self::Failed { .. } => "failed",
            Self::Stale { .. } => "stale",
        }
    }
}

/// Routes processor events to settlement.
pub struct ProcessorEventHandler<S: BillingStore> {
    store: S,
    settlement: SettlementService<S>,
    audit: Arc<dyn BillingAuditLogger>,
}

impl<S: BillingStore + Clone> ProcessorEventHandler<S> {
    #[must_use]
    pub fn new(store: S, config: BillingConfig) -> Self {
        Self {
            settlement: SettlementService::new(store.clone(), config),
            store,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.settlement = self.settlement.with_audit_logger(audit.clone());
        self.audit = audit;
        self
    }

    /// Handle one processor event.
    ///
    /// Ignored events are not recorded, so a later version of the handler
    /// can still act on them if redelivered.
    ///
    /// # Errors
    ///
    /// Storage failures and missing payments are returned so the processor
    /// retries delivery.
    #[instrument(skip(self, event), fields(event_id = %event.id, kind = %event.kind))]
    pub async fn handle_event(&self, event: ProcessorEvent) -> Result<WebhookOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            info!("Event already processed");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        self.audit
            .log(BillingAuditEvent::WebhookReceived {
                event_id: event.id.clone(),
                event_type: event.kind.to_string(),
            })
            .await;

        let outcome = match (&event.kind, event.payment_id.as_deref()) {
            (ProcessorEventKind::Other(_), _) => WebhookOutcome::Ignored,
            (_, None) => {
                warn!("Event has no payment id");
                WebhookOutcome::Ignored
            }
            (ProcessorEventKind::PaymentSucceeded, Some(payment_id)) => {
                self.handle_succeeded(&event, payment_id).await?
            }
            (ProcessorEventKind::PaymentFailed, Some(payment_id)) => {
                self.handle_failed(&event, payment_id).await?
            }
        };

        if outcome != WebhookOutcome::Ignored {
            self.store.mark_event_processed(&event.id).await?;
        }

        self.audit
            .log(BillingAuditEvent::WebhookProcessed {
                event_id: event.id.clone(),
                event_type: event.kind.to_string(),
                outcome: outcome.as_str().to_string(),
            })
            .await;

        Ok(outcome)
    }

    async fn handle_succeeded(&self, event: &ProcessorEvent, payment_id: &str) -> Result<WebhookOutcome> {
        let mut request = SettleRequest::new(payment_id, PaymentMethod::Processor, event.occurred_at);
        if let Some(processor_id) = &event.processor_payment_id {
            request = request.with_processor_payment_id(processor_id.clone());
        }

        Ok(match self.settlement.settle_payment(request).await? {
            SettlementResult::Settled(outcome) => WebhookOutcome::Settled(outcome),
            SettlementResult::AlreadySettled { payment_id, .. } => {
                WebhookOutcome::AlreadySettled { payment_id }
            }
            SettlementResult::PartiallySettled {
                payment_id,
                membership_id,
                reason,
            } => WebhookOutcome::PartiallySettled {
                payment_id,
                membership_id,
                reason,
            },
        })
    }

    async fn handle_failed(&self, event: &ProcessorEvent, payment_id: &str) -> Result<WebhookOutcome> {
        let reason = event
            .failure_reason
            .as_deref()
            .unwrap_or("payment declined by processor");

        match self.settlement.mark_payment_failed(payment_id, reason).await {
            Ok(true) => Ok(WebhookOutcome::Failed {
                payment_id: payment_id.to_string(),
            }),
            Ok(false) | Err(DuesError::Conflict(_)) => Ok(WebhookOutcome::Stale {
                payment_id: payment_id.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::MemoryAuditLogger;
    use crate::billing::memory::InMemoryBillingStore;
    use crate::billing::storage::{
        MembershipStore, OrganizationStore, PaymentStore, ProcessedEventStore,
    };
    use crate::billing::types::{
        BillingFrequency, Membership, Organization, Payment, PaymentStatus, PaymentType,
    };
    use chrono::NaiveDate;

    fn event(id: &str, kind: ProcessorEventKind, payment_id: &str) -> ProcessorEvent {
        ProcessorEvent {
            id: id.to_string(),
            kind,
            payment_id: Some(payment_id.to_string()),
            processor_payment_id: Some("pi_123".to_string()),
            failure_reason: None,
            occurred_at: Utc::now(),
        }
    }

    async fn setup() -> (InMemoryBillingStore, Payment) {
        let store = InMemoryBillingStore::new();
        store
            .save_organization(&Organization::new("org_1", "Masjid Muhajireen"))
            .await
            .unwrap();
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let membership = Membership::new("org_1", "plan_1", BillingFrequency::Monthly, start);
        store.create_membership(&membership).await.unwrap();

        let payment = Payment {
            id: "pay_1".to_string(),
            organization_id: "org_1".to_string(),
            membership_id: membership.id.clone(),
            payment_type: PaymentType::Dues,
            method: PaymentMethod::Processor,
            status: PaymentStatus::Pending,
            amount_cents: 5000,
            processor_fee_cents: 175,
            platform_fee_cents: 0,
            total_charged_cents: 5000,
            net_amount_cents: 4825,
            months_credited: 1,
            invoice_number: "INV-MM-202501-0001".to_string(),
            due_date: start,
            period_start: Some(start),
            period_end: NaiveDate::from_ymd_opt(2025, 1, 31),
            period_label: Some("January 2025".to_string()),
            reminder_count: 0,
            reminder_sent_at: None,
            requires_review: false,
            processor_payment_id: None,
            paid_at: None,
            failure_reason: None,
            created_at: Utc::now(),
        };
        store.create_payment(&payment).await.unwrap();
        (store, payment)
    }

    #[test]
    fn test_parse_event() {
        let body = br#"{
            "id": "evt_1",
            "type": "payment_intent.payment_failed",
            "created": 1735689600,
            "data": {"object": {
                "id": "pi_9",
                "metadata": {"payment_id": "pay_1"},
                "last_payment_error": {"message": "card declined"}
            }}
        }"#;
        let event = ProcessorEvent::from_json(body).unwrap();
        assert_eq!(event.kind, ProcessorEventKind::PaymentFailed);
        assert_eq!(event.payment_id.as_deref(), Some("pay_1"));
        assert_eq!(event.processor_payment_id.as_deref(), Some("pi_9"));
        assert_eq!(event.failure_reason.as_deref(), Some("card declined"));
        assert_eq!(event.occurred_at.to_rfc3339(), "2025-01-01T00:00:00+00:00");

        assert!(ProcessorEvent::from_json(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_success_settles_once() {
        let (store, payment) = setup().await;
        let handler = ProcessorEventHandler::new(store.clone(), BillingConfig::default());

        let outcome = handler
            .handle_event(event("evt_1", ProcessorEventKind::PaymentSucceeded, &payment.id))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Settled(ref o) if o.new_paid_months == 1));

        let outcome = handler
            .handle_event(event("evt_1", ProcessorEventKind::PaymentSucceeded, &payment.id))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::AlreadyProcessed);

        let outcome = handler
            .handle_event(event("evt_2", ProcessorEventKind::PaymentSucceeded, &payment.id))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::AlreadySettled { .. }));

        let stored = store.get_payment(&payment.id).await.unwrap().unwrap();
        assert_eq!(stored.processor_payment_id.as_deref(), Some("pi_123"));
    }

    #[tokio::test]
    async fn test_failure_then_late_failure() {
        let (store, payment) = setup().await;
        let audit = MemoryAuditLogger::new();
        let handler = ProcessorEventHandler::new(store.clone(), BillingConfig::default())
            .with_audit_logger(Arc::new(audit.clone()));

        let outcome = handler
            .handle_event(event("evt_1", ProcessorEventKind::PaymentFailed, &payment.id))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Failed { .. }));

        let outcome = handler
            .handle_event(event("evt_2", ProcessorEventKind::PaymentFailed, &payment.id))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Stale { .. }));

        let events = audit.events().await;
        assert!(events
            .iter()
            .any(|e| matches!(e, BillingAuditEvent::PaymentFailed { .. })));
    }

    #[tokio::test]
    async fn test_other_events_are_not_recorded() {
        let (store, payment) = setup().await;
        let handler = ProcessorEventHandler::new(store.clone(), BillingConfig::default());
        let outcome = handler
            .handle_event(event(
                "evt_1",
                ProcessorEventKind::Other("customer.created".to_string()),
                &payment.id,
            ))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert!(!store.is_event_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_payment_is_an_error() {
        let (store, _) = setup().await;
        let handler = ProcessorEventHandler::new(store.clone(), BillingConfig::default());
        let err = handler
            .handle_event(event("evt_1", ProcessorEventKind::PaymentSucceeded, "pay_missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, DuesError::NotFound(_)));
        assert!(!store.is_event_processed("evt_1").await.unwrap());
    }
}
