use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized webhook body for one sales order.
///
/// Monetary fields are carried as raw JSON numbers so values pass through to
/// the receiver exactly as Odoo reported them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPayload {
    pub connection_id: i64,
    pub order_id: i64,
    pub order_name: String,
    pub write_date: String,
    pub partner: PartnerPayload,
    pub currency: String,
    pub amount_total: Value,
    pub lines: Vec<OrderLinePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerPayload {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub vat: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLinePayload {
    pub sku: String,
    pub product_name: String,
    pub quantity: Value,
    pub unit_price: Value,
    pub subtotal: Value,
}
