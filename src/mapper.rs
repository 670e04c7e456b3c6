use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value, json};
use sqlx::SqlitePool;
use tracing::warn;

use crate::error::PollerError;
use crate::odoo::OdooApi;
use crate::store::sent_orders;
use crate::types::{Connection, OrderLinePayload, OrderPayload, PartnerPayload};

const ORDER_FIELDS: &[&str] = &[
    "id",
    "name",
    "partner_id",
    "order_line",
    "amount_total",
    "currency_id",
    "write_date",
];
const PARTNER_FIELDS: &[&str] = &["id", "name", "email", "vat"];
const LINE_FIELDS: &[&str] = &[
    "id",
    "product_id",
    "name",
    "product_uom_qty",
    "price_unit",
    "price_subtotal",
];
const PRODUCT_FIELDS: &[&str] = &["id", "name", "default_code", "barcode", "product_tmpl_id"];
const TEMPLATE_FIELDS: &[&str] = &["id", "default_code", "barcode"];

#[derive(Debug, Default)]
pub struct MappedOrders {
    pub payloads: Vec<OrderPayload>,
    /// Orders returned by the search, including ones dropped by dedup.
    pub found: i64,
    pub deduped: i64,
    /// Orders whose record shape could not be mapped; counted as failed.
    pub failed: i64,
    /// Max `write_date` across everything found, for the cursor bump.
    pub max_write_date: Option<String>,
}

/// Fetch confirmed orders newer than `since` and normalize them into webhook
/// payloads. Related entities are read in four batched calls (partners,
/// lines, products, templates) regardless of order count.
pub async fn map_connection_orders(
    api: &dyn OdooApi,
    pool: &SqlitePool,
    connection: &Connection,
    since: Option<&str>,
) -> Result<MappedOrders, PollerError> {
    let mut domain = vec![json!(["state", "in", ["sale", "done"]])];
    if let Some(since) = since {
        domain.push(json!(["write_date", ">", since]));
    }

    let orders = api
        .search_read(
            "sale.order",
            Value::Array(domain),
            ORDER_FIELDS,
            None,
            Some("write_date asc"),
        )
        .await?;

    let mut mapped = MappedOrders {
        found: orders.len() as i64,
        ..MappedOrders::default()
    };

    let order_ids: Vec<i64> = orders.iter().filter_map(|rec| rec_i64(rec, "id")).collect();
    let already_sent = sent_orders::sent_keys(pool, connection.id, &order_ids).await?;

    let mut fresh = Vec::with_capacity(orders.len());
    for order in orders {
        let Some(write_date) = rec_str(&order, "write_date") else {
            mapped.failed += 1;
            warn!(connection_id = connection.id, "order record has no write_date, skipping");
            continue;
        };
        track_max(&mut mapped.max_write_date, write_date);

        let Some(id) = rec_i64(&order, "id") else {
            mapped.failed += 1;
            warn!(connection_id = connection.id, "order record has no id, skipping");
            continue;
        };

        if already_sent.contains(&(id, write_date.to_string())) {
            mapped.deduped += 1;
            continue;
        }
        fresh.push(order);
    }

    if fresh.is_empty() {
        return Ok(mapped);
    }

    let partner_ids = collect_many2one_ids(&fresh, "partner_id");
    let line_ids: Vec<i64> = fresh
        .iter()
        .flat_map(|order| id_list(order, "order_line"))
        .collect();

    let partners = index_by_id(api.read("res.partner", &partner_ids, PARTNER_FIELDS).await?);
    let lines = index_by_id(api.read("sale.order.line", &line_ids, LINE_FIELDS).await?);

    let product_ids: Vec<i64> = {
        let mut seen = HashSet::new();
        lines
            .values()
            .filter_map(|line| many2one_id(line, "product_id"))
            .filter(|id| seen.insert(*id))
            .collect()
    };
    let products = index_by_id(api.read("product.product", &product_ids, PRODUCT_FIELDS).await?);

    let template_ids: Vec<i64> = {
        let mut seen = HashSet::new();
        products
            .values()
            .filter_map(|product| many2one_id(product, "product_tmpl_id"))
            .filter(|id| seen.insert(*id))
            .collect()
    };
    let templates = index_by_id(
        api.read("product.template", &template_ids, TEMPLATE_FIELDS)
            .await?,
    );

    for order in &fresh {
        match build_payload(connection, order, &partners, &lines, &products, &templates) {
            Ok(payload) => mapped.payloads.push(payload),
            Err(reason) => {
                mapped.failed += 1;
                warn!(
                    connection_id = connection.id,
                    order_id = rec_i64(order, "id").unwrap_or(-1),
                    reason,
                    "could not map order, skipping"
                );
            }
        }
    }

    Ok(mapped)
}

fn build_payload(
    connection: &Connection,
    order: &Map<String, Value>,
    partners: &HashMap<i64, Map<String, Value>>,
    lines: &HashMap<i64, Map<String, Value>>,
    products: &HashMap<i64, Map<String, Value>>,
    templates: &HashMap<i64, Map<String, Value>>,
) -> Result<OrderPayload, String> {
    let order_id = rec_i64(order, "id").ok_or("missing order id")?;
    let order_name = rec_str(order, "name")
        .ok_or("missing order name")?
        .to_string();
    let write_date = rec_str(order, "write_date")
        .ok_or("missing write_date")?
        .to_string();

    let partner_id = many2one_id(order, "partner_id").ok_or("missing partner")?;
    let partner = partners
        .get(&partner_id)
        .ok_or("partner record missing from batch read")?;
    let partner = PartnerPayload {
        id: partner_id,
        name: rec_str(partner, "name")
            .ok_or("missing partner name")?
            .to_string(),
        email: opt_str(partner, "email"),
        vat: opt_str(partner, "vat"),
    };

    let currency = many2one_name(order, "currency_id").ok_or("missing currency")?;
    let amount_total = order
        .get("amount_total")
        .cloned()
        .ok_or("missing amount_total")?;

    let mut payload_lines = Vec::new();
    for line_id in id_list(order, "order_line") {
        let line = lines
            .get(&line_id)
            .ok_or("order line missing from batch read")?;

        let quantity = line
            .get("product_uom_qty")
            .cloned()
            .ok_or("missing line quantity")?;
        if quantity.as_f64() == Some(0.0) {
            continue;
        }

        // Section and note lines carry no product; they are not stock
        // movements, so they never reach the receiver.
        let Some(product_id) = many2one_id(line, "product_id") else {
            continue;
        };
        let product = products.get(&product_id);
        let template = product
            .and_then(|p| many2one_id(p, "product_tmpl_id"))
            .and_then(|id| templates.get(&id));

        let product_name = product
            .and_then(|p| rec_str(p, "name"))
            .map(str::to_string)
            .or_else(|| rec_str(line, "name").map(str::to_string))
            .ok_or("missing product name")?;

        payload_lines.push(OrderLinePayload {
            sku: resolve_sku(product, template, &connection.db_name, product_id),
            product_name,
            quantity,
            unit_price: line
                .get("price_unit")
                .cloned()
                .ok_or("missing line price_unit")?,
            subtotal: line
                .get("price_subtotal")
                .cloned()
                .ok_or("missing line price_subtotal")?,
        });
    }

    Ok(OrderPayload {
        connection_id: connection.id,
        order_id,
        order_name,
        write_date,
        partner,
        currency,
        amount_total,
        lines: payload_lines,
    })
}

/// SKU fallback chain: product `default_code`, product `barcode`, template
/// `default_code`, template `barcode`, then a synthetic stable identifier.
pub fn resolve_sku(
    product: Option<&Map<String, Value>>,
    template: Option<&Map<String, Value>>,
    db: &str,
    product_id: i64,
) -> String {
    product
        .and_then(|p| opt_str(p, "default_code"))
        .or_else(|| product.and_then(|p| opt_str(p, "barcode")))
        .or_else(|| template.and_then(|t| opt_str(t, "default_code")))
        .or_else(|| template.and_then(|t| opt_str(t, "barcode")))
        .unwrap_or_else(|| format!("ODOO-{db}-{product_id}"))
}

fn track_max(current: &mut Option<String>, candidate: &str) {
    if current.as_deref().is_none_or(|value| value < candidate) {
        *current = Some(candidate.to_string());
    }
}

fn collect_many2one_ids(records: &[Map<String, Value>], field: &str) -> Vec<i64> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter_map(|rec| many2one_id(rec, field))
        .filter(|id| seen.insert(*id))
        .collect()
}

fn index_by_id(records: Vec<Map<String, Value>>) -> HashMap<i64, Map<String, Value>> {
    records
        .into_iter()
        .filter_map(|rec| rec_i64(&rec, "id").map(|id| (id, rec)))
        .collect()
}

fn rec_i64(rec: &Map<String, Value>, field: &str) -> Option<i64> {
    rec.get(field).and_then(Value::as_i64)
}

fn rec_str<'a>(rec: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    rec.get(field).and_then(Value::as_str)
}

/// Text field that may be absent, `false`, or empty; Odoo uses all three
/// interchangeably for "no value".
fn opt_str(rec: &Map<String, Value>, field: &str) -> Option<String> {
    rec.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Many2one fields arrive as `[id, display_name]`, or `false` when unset.
fn many2one_id(rec: &Map<String, Value>, field: &str) -> Option<i64> {
    rec.get(field)
        .and_then(Value::as_array)
        .and_then(|pair| pair.first())
        .and_then(Value::as_i64)
}

fn many2one_name(rec: &Map<String, Value>, field: &str) -> Option<String> {
    rec.get(field)
        .and_then(Value::as_array)
        .and_then(|pair| pair.get(1))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn id_list(rec: &Map<String, Value>, field: &str) -> Vec<i64> {
    rec.get(field)
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}
