use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::store::{StoreError, format_utc};
use crate::types::SyncLog;

pub struct NewSyncLog<'a> {
    pub connection_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub orders_found: i64,
    pub orders_sent: i64,
    pub orders_failed: i64,
    pub error_message: Option<&'a str>,
}

pub async fn append(pool: &SqlitePool, log: &NewSyncLog<'_>) -> Result<Uuid, StoreError> {
    let id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO sync_logs (
            id,
            connection_id,
            started_at,
            finished_at,
            orders_found,
            orders_sent,
            orders_failed,
            error_message
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(log.connection_id)
    .bind(format_utc(log.started_at))
    .bind(format_utc(log.finished_at))
    .bind(log.orders_found)
    .bind(log.orders_sent)
    .bind(log.orders_failed)
    .bind(log.error_message)
    .execute(pool)
    .await?;

    Ok(id)
}

pub async fn list_recent(
    pool: &SqlitePool,
    connection_id: i64,
    limit: i64,
) -> Result<Vec<SyncLog>, StoreError> {
    let rows: Vec<SyncLogRow> = sqlx::query_as(
        r#"
        SELECT
            id,
            connection_id,
            started_at,
            finished_at,
            orders_found,
            orders_sent,
            orders_failed,
            error_message
        FROM sync_logs
        WHERE connection_id = ?
        ORDER BY started_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(connection_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(SyncLogRow::try_into).collect()
}

#[derive(sqlx::FromRow)]
struct SyncLogRow {
    id: String,
    connection_id: i64,
    started_at: String,
    finished_at: String,
    orders_found: i64,
    orders_sent: i64,
    orders_failed: i64,
    error_message: Option<String>,
}

impl TryFrom<SyncLogRow> for SyncLog {
    type Error = StoreError;

    fn try_from(row: SyncLogRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)
                .map_err(|err| StoreError::Parse(format!("invalid sync log id: {err}")))?,
            connection_id: row.connection_id,
            started_at: row.started_at,
            finished_at: row.finished_at,
            orders_found: row.orders_found,
            orders_sent: row.orders_sent,
            orders_failed: row.orders_failed,
            error_message: row.error_message,
        })
    }
}
