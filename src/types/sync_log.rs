use uuid::Uuid;

/// Append-only ledger row, one per completed poll cycle. Cycles that were
/// short-circuited by the breaker still get a row with zero counts and an
/// explanatory message.
#[derive(Debug, Clone)]
pub struct SyncLog {
    pub id: Uuid,
    pub connection_id: i64,
    pub started_at: String,
    pub finished_at: String,
    pub orders_found: i64,
    pub orders_sent: i64,
    pub orders_failed: i64,
    pub error_message: Option<String>,
}
