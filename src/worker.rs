use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::breaker::{BreakerPolicy, CircuitBreaker};
use crate::config::PollerConfig;
use crate::crypto::{FieldCipher, sha256_hex};
use crate::error::PollerError;
use crate::mapper;
use crate::odoo::OdooApi;
use crate::store::{connections, retry_queue, sent_orders, sync_logs};
use crate::types::{Connection, OrderPayload};
use crate::webhook::{DeliveryOutcome, WebhookDelivery, retry_delay_secs};

#[derive(Debug, Default)]
pub struct CycleReport {
    pub connection_id: i64,
    /// Interval read from the fresh connection row, so interval edits take
    /// effect on the caller's next sleep.
    pub poll_interval_seconds: i64,
    pub orders_found: i64,
    pub orders_sent: i64,
    pub orders_failed: i64,
    pub retries_enqueued: i64,
    pub retries_resolved: i64,
    pub short_circuited: bool,
    /// Set when cancellation interrupted the cycle after an in-flight
    /// delivery; rows written so far are idempotent, no sync log is emitted.
    pub cancelled: bool,
    pub error_message: Option<String>,
}

/// One end-to-end polling cycle for one connection.
///
/// Everything that can go wrong mid-cycle is absorbed into the report, the
/// breaker and the sync log; the returned `Err` is reserved for the
/// persistence layer itself failing. With `dry_run` set the cycle still
/// talks to Odoo and the webhook receiver but writes nothing.
pub async fn run_cycle(
    pool: &SqlitePool,
    config: &PollerConfig,
    cipher: &FieldCipher,
    api: &dyn OdooApi,
    sender: &dyn WebhookDelivery,
    connection_id: i64,
    cancel: &CancellationToken,
    dry_run: bool,
) -> Result<CycleReport, PollerError> {
    let started_at = Utc::now();

    // Fresh snapshot every cycle: the operator CLI may have edited the row.
    let mut connection = connections::get(pool, cipher, connection_id).await?;
    if connection.webhook_url.is_empty()
        && let Some(url) = &config.default_webhook_url
    {
        connection.webhook_url = url.clone();
    }

    let mut report = CycleReport {
        connection_id,
        poll_interval_seconds: connection.poll_interval_seconds,
        ..CycleReport::default()
    };

    let mut breaker = CircuitBreaker::new(
        connection.circuit.clone(),
        BreakerPolicy::from_config(config),
    );
    if !breaker.allow_request(started_at) {
        report.short_circuited = true;
        report.error_message = Some("circuit open".to_string());
        if !dry_run {
            sync_logs::append(
                pool,
                &sync_logs::NewSyncLog {
                    connection_id,
                    started_at,
                    finished_at: Utc::now(),
                    orders_found: 0,
                    orders_sent: 0,
                    orders_failed: 0,
                    error_message: Some("circuit open"),
                },
            )
            .await?;
        }
        return Ok(report);
    }

    let cycle_ok = match execute_cycle(
        pool, config, api, sender, &connection, cancel, dry_run, &mut report,
    )
    .await
    {
        Ok(webhook_down) => {
            if webhook_down {
                report.error_message = Some("webhook endpoint unreachable".to_string());
            }
            !webhook_down
        }
        Err(PollerError::Store(err)) => return Err(PollerError::Store(err)),
        Err(err) => {
            report.error_message = Some(err.to_string());
            false
        }
    };

    // An interrupted cycle leaves only idempotent rows behind; the breaker
    // and the ledger only record completed cycles.
    if report.cancelled {
        return Ok(report);
    }

    if cycle_ok {
        breaker.record_success();
    } else {
        breaker.record_failure(Utc::now());
    }

    if !dry_run {
        connections::save_circuit(pool, connection_id, breaker.snapshot()).await?;
        sync_logs::append(
            pool,
            &sync_logs::NewSyncLog {
                connection_id,
                started_at,
                finished_at: Utc::now(),
                orders_found: report.orders_found,
                orders_sent: report.orders_sent,
                orders_failed: report.orders_failed,
                error_message: report.error_message.as_deref(),
            },
        )
        .await?;
    }

    Ok(report)
}

/// Returns whether the webhook endpoint looked down for the whole cycle
/// (every attempted delivery failed transiently), which is the one per-order
/// condition that counts against the breaker.
async fn execute_cycle(
    pool: &SqlitePool,
    config: &PollerConfig,
    api: &dyn OdooApi,
    sender: &dyn WebhookDelivery,
    connection: &Connection,
    cancel: &CancellationToken,
    dry_run: bool,
    report: &mut CycleReport,
) -> Result<bool, PollerError> {
    let mapped = mapper::map_connection_orders(
        api,
        pool,
        connection,
        connection.last_sync_at.as_deref(),
    )
    .await?;
    report.orders_found = mapped.found;
    report.orders_failed += mapped.failed;

    let mut delivered_any = false;
    let mut attempted = 0_i64;
    let mut transient_failures = 0_i64;

    // Deliveries happen in the order Odoo returned the orders; one failure
    // never blocks the rest of the batch.
    for payload in &mapped.payloads {
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(false);
        }
        attempted += 1;
        match sender.deliver(connection, payload).await {
            DeliveryOutcome::Delivered => {
                report.orders_sent += 1;
                delivered_any = true;
                if !dry_run {
                    let body = serialize_payload(payload)?;
                    sent_orders::insert(
                        pool,
                        connection.id,
                        payload.order_id,
                        &payload.write_date,
                        &sha256_hex(body.as_bytes()),
                    )
                    .await?;
                }
            }
            DeliveryOutcome::Transient(reason) => {
                transient_failures += 1;
                debug!(
                    connection_id = connection.id,
                    order_id = payload.order_id,
                    reason,
                    "delivery failed transiently, queueing retry"
                );
                if !dry_run {
                    let body = serialize_payload(payload)?;
                    let next_attempt_at = Utc::now() + Duration::seconds(retry_delay_secs(1));
                    retry_queue::insert(
                        pool,
                        connection.id,
                        payload.order_id,
                        &body,
                        1,
                        next_attempt_at,
                        &reason,
                    )
                    .await?;
                    report.retries_enqueued += 1;
                }
            }
            DeliveryOutcome::Permanent(reason) => {
                report.orders_failed += 1;
                warn!(
                    connection_id = connection.id,
                    order_id = payload.order_id,
                    reason,
                    "delivery rejected permanently"
                );
            }
        }
    }

    let due = retry_queue::list_due(pool, connection.id, Utc::now()).await?;
    for item in due {
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(false);
        }
        let payload: OrderPayload = match serde_json::from_str(&item.payload) {
            Ok(payload) => payload,
            Err(err) => {
                report.orders_failed += 1;
                if !dry_run {
                    retry_queue::mark_exhausted(
                        pool,
                        item.id,
                        item.attempts,
                        &format!("unreadable payload snapshot: {err}"),
                    )
                    .await?;
                }
                continue;
            }
        };

        attempted += 1;
        match sender.deliver(connection, &payload).await {
            DeliveryOutcome::Delivered => {
                report.orders_sent += 1;
                report.retries_resolved += 1;
                delivered_any = true;
                if !dry_run {
                    sent_orders::insert(
                        pool,
                        connection.id,
                        item.odoo_order_id,
                        &payload.write_date,
                        &sha256_hex(item.payload.as_bytes()),
                    )
                    .await?;
                    retry_queue::delete(pool, item.id).await?;
                }
            }
            DeliveryOutcome::Transient(reason) => {
                transient_failures += 1;
                if !dry_run {
                    let attempts = item.attempts + 1;
                    if attempts >= i64::from(config.retry_max_attempts) {
                        retry_queue::mark_exhausted(pool, item.id, attempts, &reason).await?;
                    } else {
                        let next_attempt_at =
                            Utc::now() + Duration::seconds(retry_delay_secs(attempts));
                        retry_queue::reschedule(pool, item.id, attempts, next_attempt_at, &reason)
                            .await?;
                    }
                }
            }
            DeliveryOutcome::Permanent(reason) => {
                report.orders_failed += 1;
                if !dry_run {
                    retry_queue::mark_exhausted(pool, item.id, item.attempts + 1, &reason).await?;
                }
            }
        }
    }

    if !dry_run {
        // The dedup index absorbs any replay, so the cursor advances over
        // found-but-undelivered orders as well; SentOrder inserts above
        // always land before this bump.
        if let Some(max_write_date) = &mapped.max_write_date {
            connections::advance_last_sync_at(pool, connection.id, max_write_date).await?;
        }
        if delivered_any {
            connections::mark_success(pool, connection.id).await?;
        }
    }

    Ok(attempted > 0 && transient_failures == attempted)
}

fn serialize_payload(payload: &OrderPayload) -> Result<String, PollerError> {
    serde_json::to_string(payload).map_err(|err| PollerError::Mapping(err.to_string()))
}
