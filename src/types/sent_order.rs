/// Dedup record marking one `(connection, order, write_date)` identity as
/// delivered. Inserted once after a 2xx acknowledgement, never mutated.
#[derive(Debug, Clone)]
pub struct SentOrder {
    pub connection_id: i64,
    pub odoo_order_id: i64,
    pub write_date: String,
    pub payload_hash: String,
    pub sent_at: String,
}
