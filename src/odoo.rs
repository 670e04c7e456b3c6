use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::types::Connection;

#[derive(Debug, thiserror::Error)]
pub enum OdooError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by odoo")]
    RateLimited,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The two call shapes the engine needs from Odoo. A trait seam so the poll
/// cycle can run against a stub in tests.
#[async_trait]
pub trait OdooApi: Send + Sync {
    async fn search_read(
        &self,
        model: &str,
        domain: Value,
        fields: &[&str],
        limit: Option<i64>,
        order: Option<&str>,
    ) -> Result<Vec<Map<String, Value>>, OdooError>;

    async fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: &[&str],
    ) -> Result<Vec<Map<String, Value>>, OdooError>;
}

/// JSON-RPC client for one Odoo instance.
///
/// Authentication is lazy: the first `execute_kw` call obtains a `uid` and
/// caches it. A response indicating an invalidated session triggers exactly
/// one transparent re-authentication and replay; a second failure surfaces.
pub struct OdooClient {
    http: reqwest::Client,
    base_url: String,
    db: String,
    login: String,
    api_key: String,
    uid: Mutex<Option<i64>>,
    next_id: AtomicU64,
}

impl OdooClient {
    pub fn new(http: reqwest::Client, connection: &Connection) -> Self {
        Self {
            http,
            base_url: connection.base_url.trim_end_matches('/').to_string(),
            db: connection.db_name.clone(),
            login: connection.login.clone(),
            api_key: connection.api_key.clone(),
            uid: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn authenticate(&self) -> Result<i64, OdooError> {
        let result = self
            .call(
                "common",
                "authenticate",
                json!([self.db, self.login, self.api_key, {}]),
            )
            .await?;

        match result.as_i64() {
            Some(uid) if uid > 0 => Ok(uid),
            // Odoo reports invalid credentials as a literal `false` result.
            _ => Err(OdooError::Auth(format!(
                "credentials rejected for {} on {}",
                self.login, self.db
            ))),
        }
    }

    async fn ensure_uid(&self) -> Result<i64, OdooError> {
        let mut guard = self.uid.lock().await;
        if let Some(uid) = *guard {
            return Ok(uid);
        }
        let uid = self.authenticate().await?;
        *guard = Some(uid);
        Ok(uid)
    }

    async fn reauthenticate(&self) -> Result<i64, OdooError> {
        let mut guard = self.uid.lock().await;
        *guard = None;
        let uid = self.authenticate().await?;
        *guard = Some(uid);
        Ok(uid)
    }

    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        positional: Value,
        kwargs: Value,
    ) -> Result<Value, OdooError> {
        let uid = self.ensure_uid().await?;

        match self
            .call_object(uid, model, method, &positional, &kwargs)
            .await
        {
            Err(OdooError::Auth(_)) => {
                let uid = self.reauthenticate().await?;
                self.call_object(uid, model, method, &positional, &kwargs)
                    .await
            }
            other => other,
        }
    }

    async fn call_object(
        &self,
        uid: i64,
        model: &str,
        method: &str,
        positional: &Value,
        kwargs: &Value,
    ) -> Result<Value, OdooError> {
        self.call(
            "object",
            "execute_kw",
            json!([
                self.db,
                uid,
                self.api_key,
                model,
                method,
                positional,
                kwargs
            ]),
        )
        .await
    }

    async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value, OdooError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {
                "service": service,
                "method": method,
                "args": args,
            },
            "id": id,
        });

        let response = self
            .http
            .post(format!("{}/jsonrpc", self.base_url))
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(OdooError::RateLimited);
        }
        let response = response.error_for_status()?;

        let envelope: Value = response.json().await?;
        if let Some(fault) = envelope.get("error") {
            return Err(fault_to_error(fault));
        }

        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| OdooError::Protocol("response has neither result nor error".to_string()))
    }
}

#[async_trait]
impl OdooApi for OdooClient {
    async fn search_read(
        &self,
        model: &str,
        domain: Value,
        fields: &[&str],
        limit: Option<i64>,
        order: Option<&str>,
    ) -> Result<Vec<Map<String, Value>>, OdooError> {
        let kwargs = search_kwargs(fields, limit, order);
        let result = self
            .execute_kw(model, "search_read", json!([domain]), Value::Object(kwargs))
            .await?;

        into_records(result)
    }

    async fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: &[&str],
    ) -> Result<Vec<Map<String, Value>>, OdooError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let result = self
            .execute_kw(
                model,
                "read",
                json!([ids]),
                json!({ "fields": fields }),
            )
            .await?;

        into_records(result)
    }
}

/// Keyword args for `search_read`. Odoo rejects null `limit`/`order`, so the
/// keys are present only when they carry a value.
fn search_kwargs(fields: &[&str], limit: Option<i64>, order: Option<&str>) -> Map<String, Value> {
    let mut kwargs = Map::new();
    kwargs.insert("fields".to_string(), json!(fields));
    if let Some(limit) = limit
        && limit > 0
    {
        kwargs.insert("limit".to_string(), json!(limit));
    }
    if let Some(order) = order
        && !order.is_empty()
    {
        kwargs.insert("order".to_string(), json!(order));
    }
    kwargs
}

fn fault_to_error(fault: &Value) -> OdooError {
    let name = fault
        .pointer("/data/name")
        .and_then(Value::as_str)
        .unwrap_or("");
    let message = fault
        .pointer("/data/message")
        .and_then(Value::as_str)
        .or_else(|| fault.get("message").and_then(Value::as_str))
        .unwrap_or("unknown odoo fault");

    if name.ends_with("AccessDenied") || name.ends_with("SessionExpired") {
        OdooError::Auth(message.to_string())
    } else {
        OdooError::Protocol(message.to_string())
    }
}

fn into_records(value: Value) -> Result<Vec<Map<String, Value>>, OdooError> {
    let Value::Array(items) = value else {
        return Err(OdooError::Protocol(
            "expected an array of records".to_string(),
        ));
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            other => Err(OdooError::Protocol(format!(
                "expected a record object, got {other}"
            ))),
        })
        .collect()
}
