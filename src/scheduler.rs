use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PollerConfig;
use crate::crypto::FieldCipher;
use crate::odoo::OdooClient;
use crate::store::connections;
use crate::types::Connection;
use crate::webhook::WebhookSender;
use crate::worker;

/// Backoff when the store itself is unavailable.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(10);

struct WorkerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fans the engine out: one long-lived task per enabled connection, each with
/// its own HTTP client so a stalled remote cannot starve its peers.
pub struct Scheduler {
    pool: SqlitePool,
    config: Arc<PollerConfig>,
    cipher: FieldCipher,
}

impl Scheduler {
    pub fn new(pool: SqlitePool, config: PollerConfig, cipher: FieldCipher) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            cipher,
        }
    }

    /// Runs until `shutdown` fires. The connection list is re-read at a
    /// coarse interval: new connections get tasks, removed or disabled ones
    /// are cancelled, interval edits apply on each task's next sleep.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut workers: HashMap<i64, WorkerHandle> = HashMap::new();

        loop {
            match connections::list_enabled(&self.pool, &self.cipher).await {
                Ok(current) => self.reconcile(&mut workers, current),
                Err(err) => {
                    warn!(error = %err, "could not load connections, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(STORE_RETRY_DELAY) => continue,
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(self.config.reconcile_seconds)) => {}
            }
        }

        self.drain(workers).await;
    }

    fn reconcile(&self, workers: &mut HashMap<i64, WorkerHandle>, current: Vec<Connection>) {
        let current_ids: HashSet<i64> = current.iter().map(|c| c.id).collect();

        let stale: Vec<i64> = workers
            .keys()
            .copied()
            .filter(|id| !current_ids.contains(id))
            .collect();
        for id in stale {
            if let Some(stopped) = workers.remove(&id) {
                info!(connection_id = id, "connection removed or disabled, stopping its task");
                stopped.token.cancel();
            }
        }

        for connection in current {
            if workers.contains_key(&connection.id) {
                continue;
            }
            info!(
                connection_id = connection.id,
                name = %connection.name,
                interval = connection.poll_interval_seconds,
                "starting polling task"
            );
            let id = connection.id;
            let token = CancellationToken::new();
            let handle = tokio::spawn(connection_task(
                self.pool.clone(),
                self.config.clone(),
                self.cipher.clone(),
                id,
                connection,
                token.clone(),
            ));
            workers.insert(id, WorkerHandle { token, handle });
        }
    }

    async fn drain(&self, workers: HashMap<i64, WorkerHandle>) {
        info!(tasks = workers.len(), "shutting down, draining polling tasks");
        for stopped in workers.values() {
            stopped.token.cancel();
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.shutdown_grace_seconds);
        for (id, stopped) in workers {
            let abort = stopped.handle.abort_handle();
            match tokio::time::timeout_at(deadline, stopped.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(connection_id = id, error = %err, "polling task panicked"),
                Err(_) => {
                    warn!(
                        connection_id = id,
                        "polling task exceeded the shutdown grace period, aborting"
                    );
                    abort.abort();
                }
            }
        }
    }
}

async fn connection_task(
    pool: SqlitePool,
    config: Arc<PollerConfig>,
    cipher: FieldCipher,
    connection_id: i64,
    connection: Connection,
    token: CancellationToken,
) {
    let http = match reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_seconds))
        .pool_max_idle_per_host(4)
        .build()
    {
        Ok(http) => http,
        Err(err) => {
            error!(connection_id, error = %err, "could not build http client for connection");
            return;
        }
    };
    let api = OdooClient::new(http.clone(), &connection);
    let sender = WebhookSender::new(http);

    let mut interval = connection.poll_interval_seconds;

    loop {
        if token.is_cancelled() {
            break;
        }

        match worker::run_cycle(
            &pool,
            &config,
            &cipher,
            &api,
            &sender,
            connection_id,
            &token,
            false,
        )
        .await
        {
            Ok(report) => {
                interval = report.poll_interval_seconds;
                if report.cancelled {
                    break;
                }
                if report.short_circuited {
                    debug!(connection_id, "cycle skipped, circuit open");
                } else {
                    info!(
                        connection_id,
                        found = report.orders_found,
                        sent = report.orders_sent,
                        failed = report.orders_failed,
                        retries = report.retries_enqueued,
                        "cycle finished"
                    );
                }
            }
            Err(err) => {
                error!(connection_id, error = %err, "cycle could not run");
            }
        }

        let sleep_secs = interval.max(config.min_interval_seconds as i64).max(1) as u64;
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
        }
    }

    info!(connection_id, "polling task stopped");
}
