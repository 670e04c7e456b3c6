use async_trait::async_trait;

use crate::types::{Connection, OrderPayload};

/// Delay cap once the schedule has climbed past its fourth step.
const MAX_RETRY_DELAY_SECS: i64 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Worth retrying: timeouts, connection failures, 408, 429, 5xx.
    Transient(String),
    /// The receiver rejected the payload; retrying cannot help.
    Permanent(String),
}

/// Delivery seam so the poll cycle can run against a stub in tests.
#[async_trait]
pub trait WebhookDelivery: Send + Sync {
    async fn deliver(&self, connection: &Connection, payload: &OrderPayload) -> DeliveryOutcome;
}

pub struct WebhookSender {
    http: reqwest::Client,
}

impl WebhookSender {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl WebhookDelivery for WebhookSender {
    async fn deliver(&self, connection: &Connection, payload: &OrderPayload) -> DeliveryOutcome {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(err) => return DeliveryOutcome::Permanent(format!("payload serialization: {err}")),
        };

        let result = self
            .http
            .post(&connection.webhook_url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Secret", &connection.webhook_secret)
            .header("X-Odoo-Connection-Id", connection.id.to_string())
            .header(
                "X-Idempotency-Key",
                idempotency_key(connection.id, payload.order_id, &payload.write_date),
            )
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) => classify_status(response.status().as_u16()),
            Err(err) => DeliveryOutcome::Transient(format!("transport: {err}")),
        }
    }
}

pub fn idempotency_key(connection_id: i64, order_id: i64, write_date: &str) -> String {
    format!("{connection_id}:{order_id}:{write_date}")
}

pub fn classify_status(status: u16) -> DeliveryOutcome {
    match status {
        200..=299 => DeliveryOutcome::Delivered,
        408 | 429 => DeliveryOutcome::Transient(format!("http {status}")),
        500..=599 => DeliveryOutcome::Transient(format!("http {status}")),
        other => DeliveryOutcome::Permanent(format!("http {other}")),
    }
}

/// Backoff schedule by attempt count: 30, 60, 120, 240, then 600 capped.
pub fn retry_delay_secs(attempts: i64) -> i64 {
    match attempts {
        i64::MIN..=1 => 30,
        2 => 60,
        3 => 120,
        4 => 240,
        _ => MAX_RETRY_DELAY_SECS,
    }
}
