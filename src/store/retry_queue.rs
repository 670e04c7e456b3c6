use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool};
use uuid::Uuid;

use crate::store::{StoreError, format_utc};
use crate::types::{RetryItem, RetryStatus};

/// Queue a failed delivery for redelivery. Returns the new item id.
pub async fn insert(
    pool: &SqlitePool,
    connection_id: i64,
    odoo_order_id: i64,
    payload: &str,
    attempts: i64,
    next_attempt_at: DateTime<Utc>,
    last_error: &str,
) -> Result<Uuid, StoreError> {
    let id = Uuid::new_v4();
    let now = format_utc(Utc::now());

    sqlx::query(
        r#"
        INSERT INTO retry_queue (
            id,
            connection_id,
            odoo_order_id,
            payload,
            attempts,
            next_attempt_at,
            last_error,
            status,
            created_at,
            updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(connection_id)
    .bind(odoo_order_id)
    .bind(payload)
    .bind(attempts)
    .bind(format_utc(next_attempt_at))
    .bind(last_error)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(id)
}

#[derive(Debug, Clone, Default)]
pub struct RetryFilter {
    pub connection_id: Option<i64>,
    pub status: Option<RetryStatus>,
    pub due_before: Option<DateTime<Utc>>,
}

pub async fn list(pool: &SqlitePool, filter: &RetryFilter) -> Result<Vec<RetryItem>, StoreError> {
    let mut query = QueryBuilder::new(
        "SELECT \
            id, \
            connection_id, \
            odoo_order_id, \
            payload, \
            attempts, \
            next_attempt_at, \
            last_error, \
            status, \
            created_at, \
            updated_at \
        FROM retry_queue \
        WHERE 1 = 1",
    );

    if let Some(connection_id) = filter.connection_id {
        query.push(" AND connection_id = ");
        query.push_bind(connection_id);
    }

    if let Some(status) = filter.status {
        query.push(" AND status = ");
        query.push_bind(retry_status_to_str(status));
    }

    if let Some(due_before) = filter.due_before {
        query.push(" AND next_attempt_at <= ");
        query.push_bind(format_utc(due_before));
    }

    query.push(" ORDER BY created_at ASC, id ASC");

    let rows: Vec<RetryItemRow> = query.build_query_as().fetch_all(pool).await?;

    rows.into_iter().map(RetryItemRow::try_into).collect()
}

/// Pending items for one connection whose `next_attempt_at` has passed.
pub async fn list_due(
    pool: &SqlitePool,
    connection_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<RetryItem>, StoreError> {
    list(
        pool,
        &RetryFilter {
            connection_id: Some(connection_id),
            status: Some(RetryStatus::Pending),
            due_before: Some(now),
        },
    )
    .await
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<RetryItem, StoreError> {
    let row: RetryItemRow = sqlx::query_as(
        r#"
        SELECT
            id,
            connection_id,
            odoo_order_id,
            payload,
            attempts,
            next_attempt_at,
            last_error,
            status,
            created_at,
            updated_at
        FROM retry_queue
        WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("retry item {id} not found")))?;

    row.try_into()
}

pub async fn reschedule(
    pool: &SqlitePool,
    id: Uuid,
    attempts: i64,
    next_attempt_at: DateTime<Utc>,
    last_error: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE retry_queue
        SET attempts = ?,
            next_attempt_at = ?,
            last_error = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(attempts)
    .bind(format_utc(next_attempt_at))
    .bind(last_error)
    .bind(format_utc(Utc::now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_exhausted(
    pool: &SqlitePool,
    id: Uuid,
    attempts: i64,
    last_error: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE retry_queue
        SET status = 'exhausted',
            attempts = ?,
            last_error = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(attempts)
    .bind(last_error)
    .bind(format_utc(Utc::now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Operator command: make an item immediately due again. Attempt count is
/// preserved so the backoff stays at its cap.
pub async fn mark_pending_now(pool: &SqlitePool, id: Uuid) -> Result<(), StoreError> {
    let now = format_utc(Utc::now());
    let result = sqlx::query(
        r#"
        UPDATE retry_queue
        SET status = 'pending',
            next_attempt_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("retry item {id} not found")));
    }

    Ok(())
}

/// Operator command: drop an item from redelivery without deleting its record.
pub async fn mark_discarded(pool: &SqlitePool, id: Uuid) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE retry_queue
        SET status = 'discarded',
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(format_utc(Utc::now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("retry item {id} not found")));
    }

    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM retry_queue WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct RetryItemRow {
    id: String,
    connection_id: i64,
    odoo_order_id: i64,
    payload: String,
    attempts: i64,
    next_attempt_at: String,
    last_error: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<RetryItemRow> for RetryItem {
    type Error = StoreError;

    fn try_from(row: RetryItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)
                .map_err(|err| StoreError::Parse(format!("invalid retry item id: {err}")))?,
            connection_id: row.connection_id,
            odoo_order_id: row.odoo_order_id,
            payload: row.payload,
            attempts: row.attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            status: parse_retry_status(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_retry_status(status: &str) -> Result<RetryStatus, StoreError> {
    match status {
        "pending" => Ok(RetryStatus::Pending),
        "exhausted" => Ok(RetryStatus::Exhausted),
        "discarded" => Ok(RetryStatus::Discarded),
        other => Err(StoreError::Parse(format!("unknown retry status: {other}"))),
    }
}

fn retry_status_to_str(status: RetryStatus) -> &'static str {
    match status {
        RetryStatus::Pending => "pending",
        RetryStatus::Exhausted => "exhausted",
        RetryStatus::Discarded => "discarded",
    }
}
