use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RetryItem {
    pub id: Uuid,
    pub connection_id: i64,
    pub odoo_order_id: i64,
    /// Serialized payload as it would have been delivered. Retries re-send
    /// this snapshot rather than re-fetching from Odoo.
    pub payload: String,
    pub attempts: i64,
    pub next_attempt_at: String,
    pub last_error: Option<String>,
    pub status: RetryStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Exhausted,
    Discarded,
}
