use chrono::Utc;
use sqlx::SqlitePool;

use crate::crypto::FieldCipher;
use crate::store::{StoreError, format_utc, parse_utc};
use crate::types::{CircuitSnapshot, CircuitState, Connection, NewConnection};

/// Insert a connection row. Creation is normally the operator CLI's job; the
/// engine exposes this for that surface and for test seeding. Credential
/// fields are encrypted before they touch the database.
pub async fn insert(
    pool: &SqlitePool,
    cipher: &FieldCipher,
    new: &NewConnection,
) -> Result<(), StoreError> {
    let now = format_utc(Utc::now());
    let api_key = cipher.encrypt(&new.api_key)?;
    let webhook_secret = cipher.encrypt(&new.webhook_secret)?;

    sqlx::query(
        r#"
        INSERT INTO connections (
            id,
            name,
            base_url,
            db_name,
            login,
            api_key,
            webhook_secret,
            webhook_url,
            poll_interval_seconds,
            enabled,
            circuit_state,
            consecutive_failures,
            open_until,
            half_open_successes,
            created_at,
            updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'closed', 0, NULL, 0, ?, ?)
        "#,
    )
    .bind(new.id)
    .bind(&new.name)
    .bind(&new.base_url)
    .bind(&new.db_name)
    .bind(&new.login)
    .bind(&api_key)
    .bind(&webhook_secret)
    .bind(&new.webhook_url)
    .bind(new.poll_interval_seconds)
    .bind(new.enabled)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_enabled(
    pool: &SqlitePool,
    cipher: &FieldCipher,
) -> Result<Vec<Connection>, StoreError> {
    let rows: Vec<ConnectionRow> = sqlx::query_as(
        r#"
        SELECT
            id,
            name,
            base_url,
            db_name,
            login,
            api_key,
            webhook_secret,
            webhook_url,
            poll_interval_seconds,
            enabled,
            last_sync_at,
            last_success_at,
            circuit_state,
            consecutive_failures,
            open_until,
            half_open_successes,
            created_at,
            updated_at
        FROM connections
        WHERE enabled = 1
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| connection_from_row(row, cipher))
        .collect()
}

pub async fn get(
    pool: &SqlitePool,
    cipher: &FieldCipher,
    id: i64,
) -> Result<Connection, StoreError> {
    let row: ConnectionRow = sqlx::query_as(
        r#"
        SELECT
            id,
            name,
            base_url,
            db_name,
            login,
            api_key,
            webhook_secret,
            webhook_url,
            poll_interval_seconds,
            enabled,
            last_sync_at,
            last_success_at,
            circuit_state,
            consecutive_failures,
            open_until,
            half_open_successes,
            created_at,
            updated_at
        FROM connections
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("connection {id} not found")))?;

    connection_from_row(row, cipher)
}

/// Advance the freshness cursor. The guard keeps `last_sync_at` monotonically
/// non-decreasing even if the row was touched concurrently; Odoo `write_date`
/// strings compare correctly as text.
pub async fn advance_last_sync_at(
    pool: &SqlitePool,
    id: i64,
    candidate: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE connections
        SET last_sync_at = CASE
                WHEN last_sync_at IS NULL OR last_sync_at < ?1 THEN ?1
                ELSE last_sync_at
            END,
            updated_at = ?2
        WHERE id = ?3
        "#,
    )
    .bind(candidate)
    .bind(format_utc(Utc::now()))
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_success(pool: &SqlitePool, id: i64) -> Result<(), StoreError> {
    let now = format_utc(Utc::now());
    sqlx::query(
        r#"
        UPDATE connections
        SET last_success_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn save_circuit(
    pool: &SqlitePool,
    id: i64,
    circuit: &CircuitSnapshot,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE connections
        SET circuit_state = ?,
            consecutive_failures = ?,
            open_until = ?,
            half_open_successes = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(circuit_state_to_str(circuit.state))
    .bind(circuit.consecutive_failures)
    .bind(circuit.open_until.map(format_utc))
    .bind(circuit.half_open_successes)
    .bind(format_utc(Utc::now()))
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Operator command: force the breaker back to CLOSED with zeroed counters.
pub async fn reset_circuit(pool: &SqlitePool, id: i64) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE connections
        SET circuit_state = 'closed',
            consecutive_failures = 0,
            open_until = NULL,
            half_open_successes = 0,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(format_utc(Utc::now()))
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("connection {id} not found")));
    }

    Ok(())
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    id: i64,
    name: String,
    base_url: String,
    db_name: String,
    login: String,
    api_key: String,
    webhook_secret: String,
    webhook_url: String,
    poll_interval_seconds: i64,
    enabled: i64,
    last_sync_at: Option<String>,
    last_success_at: Option<String>,
    circuit_state: String,
    consecutive_failures: i64,
    open_until: Option<String>,
    half_open_successes: i64,
    created_at: String,
    updated_at: String,
}

fn connection_from_row(row: ConnectionRow, cipher: &FieldCipher) -> Result<Connection, StoreError> {
    let open_until = match row.open_until.as_deref() {
        Some(value) => Some(parse_utc("open_until", value)?),
        None => None,
    };

    Ok(Connection {
        id: row.id,
        name: row.name,
        base_url: row.base_url,
        db_name: row.db_name,
        login: row.login,
        api_key: cipher.decrypt(&row.api_key)?,
        webhook_secret: cipher.decrypt(&row.webhook_secret)?,
        webhook_url: row.webhook_url,
        poll_interval_seconds: row.poll_interval_seconds,
        enabled: row.enabled != 0,
        last_sync_at: row.last_sync_at,
        last_success_at: row.last_success_at,
        circuit: CircuitSnapshot {
            state: parse_circuit_state(&row.circuit_state)?,
            consecutive_failures: row.consecutive_failures,
            open_until,
            half_open_successes: row.half_open_successes,
        },
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn parse_circuit_state(state: &str) -> Result<CircuitState, StoreError> {
    match state {
        "closed" => Ok(CircuitState::Closed),
        "open" => Ok(CircuitState::Open),
        "half_open" => Ok(CircuitState::HalfOpen),
        other => Err(StoreError::Parse(format!("unknown circuit state: {other}"))),
    }
}

fn circuit_state_to_str(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}
