pub mod connections;
pub mod retry_queue;
pub mod sent_orders;
pub mod sync_logs;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crypto::CryptoError;

#[derive(Debug)]
pub enum StoreError {
    Db(sqlx::Error),
    Crypto(CryptoError),
    NotFound(String),
    Parse(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err)
    }
}

impl From<CryptoError> for StoreError {
    fn from(err: CryptoError) -> Self {
        Self::Crypto(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "database error: {err}"),
            Self::Crypto(err) => write!(f, "crypto error: {err}"),
            Self::NotFound(message) => write!(f, "not found: {message}"),
            Self::Parse(message) => write!(f, "parse error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Crypto(err) => Some(err),
            _ => None,
        }
    }
}

pub(crate) fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_utc(field: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Parse(format!("invalid {field}: {err}")))
}
