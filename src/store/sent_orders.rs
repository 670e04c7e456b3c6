use std::collections::HashSet;

use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool};

use crate::store::{StoreError, format_utc};
use crate::types::SentOrder;

/// Record a delivered order identity. Idempotent: replaying the same
/// `(connection, order, write_date)` after a crash is a no-op.
pub async fn insert(
    pool: &SqlitePool,
    connection_id: i64,
    odoo_order_id: i64,
    write_date: &str,
    payload_hash: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO sent_orders (
            connection_id,
            odoo_order_id,
            write_date,
            payload_hash,
            sent_at
        )
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(connection_id, odoo_order_id, write_date) DO NOTHING
        "#,
    )
    .bind(connection_id)
    .bind(odoo_order_id)
    .bind(write_date)
    .bind(payload_hash)
    .bind(format_utc(Utc::now()))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn exists(
    pool: &SqlitePool,
    connection_id: i64,
    odoo_order_id: i64,
    write_date: &str,
) -> Result<bool, StoreError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM sent_orders
        WHERE connection_id = ?
          AND odoo_order_id = ?
          AND write_date = ?
        "#,
    )
    .bind(connection_id)
    .bind(odoo_order_id)
    .bind(write_date)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

/// Fetch the already-delivered `(order_id, write_date)` identities among the
/// given order ids, for one bulk dedup check per cycle.
pub async fn sent_keys(
    pool: &SqlitePool,
    connection_id: i64,
    order_ids: &[i64],
) -> Result<HashSet<(i64, String)>, StoreError> {
    if order_ids.is_empty() {
        return Ok(HashSet::new());
    }

    let mut query = QueryBuilder::new(
        "SELECT odoo_order_id, write_date FROM sent_orders WHERE connection_id = ",
    );
    query.push_bind(connection_id);
    query.push(" AND odoo_order_id IN (");
    let mut ids = query.separated(", ");
    for id in order_ids {
        ids.push_bind(id);
    }
    ids.push_unseparated(")");

    let rows: Vec<(i64, String)> = query.build_query_as().fetch_all(pool).await?;

    Ok(rows.into_iter().collect())
}

pub async fn list_for_connection(
    pool: &SqlitePool,
    connection_id: i64,
) -> Result<Vec<SentOrder>, StoreError> {
    let rows: Vec<SentOrderRow> = sqlx::query_as(
        r#"
        SELECT connection_id, odoo_order_id, write_date, payload_hash, sent_at
        FROM sent_orders
        WHERE connection_id = ?
        ORDER BY sent_at ASC
        "#,
    )
    .bind(connection_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(SentOrder::from).collect())
}

#[derive(sqlx::FromRow)]
struct SentOrderRow {
    connection_id: i64,
    odoo_order_id: i64,
    write_date: String,
    payload_hash: String,
    sent_at: String,
}

impl From<SentOrderRow> for SentOrder {
    fn from(row: SentOrderRow) -> Self {
        Self {
            connection_id: row.connection_id,
            odoo_order_id: row.odoo_order_id,
            write_date: row.write_date,
            payload_hash: row.payload_hash,
            sent_at: row.sent_at,
        }
    }
}
