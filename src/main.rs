use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use poller::config::PollerConfig;
use poller::crypto::FieldCipher;
use poller::odoo::OdooClient;
use poller::scheduler::Scheduler;
use poller::store::{connections, retry_queue};
use poller::webhook::WebhookSender;
use poller::worker;

const USAGE: &str =
    "usage: odoo-poller [run | test <connection-id> | reset-circuit <connection-id> | retry <item-id> | discard <item-id>]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = PollerConfig::from_env();
    let cipher = FieldCipher::from_env()?;

    let options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .busy_timeout(Duration::from_millis(500));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON;").execute(conn).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL;").execute(&pool).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str).unwrap_or("run") {
        "run" => run_scheduler(pool, config, cipher).await,
        "test" => {
            let id = arg_i64(&args, 1, "connection id")?;
            test_cycle(&pool, &config, &cipher, id).await?;
        }
        "reset-circuit" => {
            let id = arg_i64(&args, 1, "connection id")?;
            connections::reset_circuit(&pool, id).await?;
            info!(connection_id = id, "circuit reset to closed");
        }
        "retry" => {
            let id = arg_uuid(&args, 1, "retry item id")?;
            retry_queue::mark_pending_now(&pool, id).await?;
            info!(item_id = %id, "retry item marked pending and due now");
        }
        "discard" => {
            let id = arg_uuid(&args, 1, "retry item id")?;
            retry_queue::mark_discarded(&pool, id).await?;
            info!(item_id = %id, "retry item discarded");
        }
        other => {
            eprintln!("unknown command: {other}");
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn run_scheduler(pool: SqlitePool, config: PollerConfig, cipher: FieldCipher) {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
            return;
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("received SIGINT, shutting down gracefully"),
        }
        signal_token.cancel();
    });

    info!("polling engine starting");
    Scheduler::new(pool, config, cipher).run(shutdown).await;
    info!("polling engine stopped");
}

/// One dry-run cycle against the live remote: talks to Odoo and the webhook
/// receiver but writes nothing, so operators can exercise a connection.
async fn test_cycle(
    pool: &SqlitePool,
    config: &PollerConfig,
    cipher: &FieldCipher,
    id: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = connections::get(pool, cipher, id).await?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_seconds))
        .build()?;
    let api = OdooClient::new(http.clone(), &connection);
    let sender = WebhookSender::new(http);

    let cancel = CancellationToken::new();
    let report = worker::run_cycle(pool, config, cipher, &api, &sender, id, &cancel, true).await?;
    info!(
        connection_id = id,
        found = report.orders_found,
        sent = report.orders_sent,
        failed = report.orders_failed,
        short_circuited = report.short_circuited,
        error = report.error_message.as_deref().unwrap_or(""),
        "dry-run cycle finished"
    );

    Ok(())
}

fn arg_i64(args: &[String], index: usize, what: &str) -> Result<i64, Box<dyn std::error::Error>> {
    let value = args
        .get(index)
        .ok_or_else(|| format!("missing {what}\n{USAGE}"))?;
    Ok(value.parse::<i64>().map_err(|_| format!("invalid {what}: {value}"))?)
}

fn arg_uuid(args: &[String], index: usize, what: &str) -> Result<Uuid, Box<dyn std::error::Error>> {
    let value = args
        .get(index)
        .ok_or_else(|| format!("missing {what}\n{USAGE}"))?;
    Ok(Uuid::parse_str(value).map_err(|_| format!("invalid {what}: {value}"))?)
}
