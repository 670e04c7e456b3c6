use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A configured Odoo instance with its delivery target.
///
/// Credential fields hold decrypted plaintext: the connections store
/// decrypts on read and encrypts on write. `last_sync_at` is the freshness
/// cursor in Odoo's own `write_date` format and never moves backwards.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub db_name: String,
    pub login: String,
    pub api_key: String,
    pub webhook_secret: String,
    pub webhook_url: String,
    pub poll_interval_seconds: i64,
    pub enabled: bool,
    pub last_sync_at: Option<String>,
    pub last_success_at: Option<String>,
    pub circuit: CircuitSnapshot,
    pub created_at: String,
    pub updated_at: String,
}

/// Insert parameters for a connection row. Rows are normally created by the
/// operator CLI; the engine only ever reads and updates them.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub db_name: String,
    pub login: String,
    pub api_key: String,
    pub webhook_secret: String,
    pub webhook_url: String,
    pub poll_interval_seconds: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit-breaker fields persisted on the connection row so that gating
/// survives restarts and stays visible to operator commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: i64,
    pub open_until: Option<DateTime<Utc>>,
    pub half_open_successes: i64,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
            half_open_successes: 0,
        }
    }
}
