//! Notification sink for ledger state changes.
//!
//! Events are dispatched after the owning transaction commits. Delivery is
//! fire-and-forget: failures are logged and counted, never returned to the
//! ledger caller.

use crate::services::metrics::record_notification_failure;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::observability::trace_headers;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Instrument};

/// Names of the events emitted by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LedgerEventName {
    #[serde(rename = "period:created")]
    PeriodCreated,
    #[serde(rename = "period:deleted")]
    PeriodDeleted,
    #[serde(rename = "payment:created")]
    PaymentCreated,
    #[serde(rename = "obligation:updated")]
    ObligationUpdated,
    #[serde(rename = "advance_credit:updated")]
    AdvanceCreditUpdated,
}

impl LedgerEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEventName::PeriodCreated => "period:created",
            LedgerEventName::PeriodDeleted => "period:deleted",
            LedgerEventName::PaymentCreated => "payment:created",
            LedgerEventName::ObligationUpdated => "obligation:updated",
            LedgerEventName::AdvanceCreditUpdated => "advance_credit:updated",
        }
    }
}

/// One event: the updated entity plus its foreign keys.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEvent {
    pub event: LedgerEventName,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl LedgerEvent {
    /// Build an event from any serializable entity. An entity that fails to
    /// serialize is sent with a null payload rather than dropped.
    pub fn new<T: Serialize>(event: LedgerEventName, payload: &T) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or_else(|e| {
            warn!(event = event.as_str(), error = %e, "Failed to serialize event payload");
            serde_json::Value::Null
        });
        Self {
            event,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &LedgerEvent) -> anyhow::Result<()>;
}

/// Writes events to the structured log.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, event: &LedgerEvent) -> anyhow::Result<()> {
        info!(
            event = event.event.as_str(),
            occurred_at = %event.occurred_at,
            payload = %event.payload,
            "Ledger event"
        );
        Ok(())
    }
}

/// POSTs events as JSON to a webhook, propagating the W3C trace context.
#[derive(Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build webhook client: {}", e))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, event: &LedgerEvent) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .headers(trace_headers(None))
            .json(event)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Webhook request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Webhook returned {}", status);
        }
        Ok(())
    }
}

/// Hands committed events to the configured sink on a background task.
#[derive(Clone)]
pub struct EventPublisher {
    sink: Arc<dyn NotificationSink>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Dispatch events in order without waiting for delivery.
    pub fn publish(&self, events: Vec<LedgerEvent>) {
        if events.is_empty() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        tokio::spawn(
            async move {
                for event in &events {
                    if let Err(e) = sink.deliver(event).await {
                        warn!(event = event.event.as_str(), error = %e, "Notification delivery failed");
                        record_notification_failure(event.event.as_str());
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, event: &LedgerEvent) -> anyhow::Result<()> {
            self.delivered.lock().await.push(event.event.as_str());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn deliver(&self, _event: &LedgerEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    #[test]
    fn event_names_serialize_with_colon() {
        let event = LedgerEvent::new(
            LedgerEventName::AdvanceCreditUpdated,
            &serde_json::json!({"payer_id": "p1"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "advance_credit:updated");
        assert_eq!(json["payload"]["payer_id"], "p1");
    }

    #[tokio::test]
    async fn publish_delivers_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = EventPublisher::new(sink.clone());

        publisher.publish(vec![
            LedgerEvent::new(LedgerEventName::PaymentCreated, &serde_json::json!({})),
            LedgerEvent::new(LedgerEventName::ObligationUpdated, &serde_json::json!({})),
        ]);

        for _ in 0..50 {
            if sink.delivered.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *sink.delivered.lock().await,
            vec!["payment:created", "obligation:updated"]
        );
    }

    #[tokio::test]
    async fn failing_sink_does_not_panic_publisher() {
        let publisher = EventPublisher::new(Arc::new(FailingSink));
        publisher.publish(vec![LedgerEvent::new(
            LedgerEventName::PeriodCreated,
            &serde_json::json!({}),
        )]);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
