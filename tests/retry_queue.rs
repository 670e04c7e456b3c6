use std::collections::HashSet;
use std::fs;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Map, Value, json};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use poller::config::PollerConfig;
use poller::crypto::FieldCipher;
use poller::odoo::{OdooApi, OdooError};
use poller::store::{StoreError, connections, retry_queue, sent_orders};
use poller::store::retry_queue::RetryFilter;
use poller::types::{Connection, NewConnection, OrderPayload, PartnerPayload, RetryStatus};
use poller::webhook::{DeliveryOutcome, WebhookDelivery};
use poller::worker::run_cycle;

const TEST_KEY: &str = "0123456789abcdef0123456789abcdef";

struct TestDb {
    pool: SqlitePool,
    _db_file: NamedTempFile,
}

async fn setup_db() -> TestDb {
    let db_file = NamedTempFile::new().expect("create temp sqlite file");
    let options = SqliteConnectOptions::new()
        .filename(db_file.path())
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_millis(500));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON;").execute(conn).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
        .expect("connect sqlite file");

    run_migrations(&pool).await.expect("run migrations");

    TestDb {
        pool,
        _db_file: db_file,
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut entries: Vec<_> = fs::read_dir("migrations")
        .map_err(sqlx::Error::Io)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some("sql"))
        .collect();

    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let contents = fs::read_to_string(entry.path()).map_err(sqlx::Error::Io)?;
        for statement in contents.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(pool).await?;
        }
    }

    Ok(())
}

async fn seed_connection(pool: &SqlitePool, cipher: &FieldCipher, id: i64) {
    connections::insert(
        pool,
        cipher,
        &NewConnection {
            id,
            name: format!("conn-{id}"),
            base_url: "https://odoo.example.com".to_string(),
            db_name: "acme".to_string(),
            login: "sync@example.com".to_string(),
            api_key: "odoo-api-key".to_string(),
            webhook_secret: "webhook-secret".to_string(),
            webhook_url: "https://hooks.example.com/stockmaster".to_string(),
            poll_interval_seconds: 30,
            enabled: true,
        },
    )
    .await
    .expect("seed connection");
}

fn payload_snapshot(connection_id: i64, order_id: i64, write_date: &str) -> String {
    serde_json::to_string(&OrderPayload {
        connection_id,
        order_id,
        order_name: format!("SO{order_id:03}"),
        write_date: write_date.to_string(),
        partner: PartnerPayload {
            id: 7,
            name: "Acme GmbH".to_string(),
            email: None,
            vat: None,
        },
        currency: "EUR".to_string(),
        amount_total: json!(50.0),
        lines: Vec::new(),
    })
    .expect("serialize payload snapshot")
}

async fn seed_retry_item(
    pool: &SqlitePool,
    connection_id: i64,
    order_id: i64,
    attempts: i64,
    due_in_seconds: i64,
) -> uuid::Uuid {
    retry_queue::insert(
        pool,
        connection_id,
        order_id,
        &payload_snapshot(connection_id, order_id, "2024-05-01 10:00:00"),
        attempts,
        Utc::now() + Duration::seconds(due_in_seconds),
        "http 503",
    )
    .await
    .expect("seed retry item")
}

/// Healthy Odoo with no new orders, so cycles only drain the retry queue.
struct EmptyOdoo;

#[async_trait]
impl OdooApi for EmptyOdoo {
    async fn search_read(
        &self,
        _model: &str,
        _domain: Value,
        _fields: &[&str],
        _limit: Option<i64>,
        _order: Option<&str>,
    ) -> Result<Vec<Map<String, Value>>, OdooError> {
        Ok(Vec::new())
    }

    async fn read(
        &self,
        _model: &str,
        _ids: &[i64],
        _fields: &[&str],
    ) -> Result<Vec<Map<String, Value>>, OdooError> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct StubWebhook {
    transient: HashSet<i64>,
    permanent: HashSet<i64>,
}

#[async_trait]
impl WebhookDelivery for StubWebhook {
    async fn deliver(&self, _connection: &Connection, payload: &OrderPayload) -> DeliveryOutcome {
        if self.transient.contains(&payload.order_id) {
            DeliveryOutcome::Transient("http 503".to_string())
        } else if self.permanent.contains(&payload.order_id) {
            DeliveryOutcome::Permanent("http 410".to_string())
        } else {
            DeliveryOutcome::Delivered
        }
    }
}

#[tokio::test]
async fn due_filter_selects_only_pending_and_due_items() {
    let test_db = setup_db().await;
    let pool = test_db.pool;
    let cipher = FieldCipher::from_key(TEST_KEY).expect("cipher");
    seed_connection(&pool, &cipher, 1).await;
    seed_connection(&pool, &cipher, 2).await;

    let due = seed_retry_item(&pool, 1, 101, 1, -60).await;
    let _future = seed_retry_item(&pool, 1, 102, 1, 3600).await;
    let _other_connection = seed_retry_item(&pool, 2, 103, 1, -60).await;
    let discarded = seed_retry_item(&pool, 1, 104, 1, -60).await;
    retry_queue::mark_discarded(&pool, discarded).await.expect("discard");

    let items = retry_queue::list_due(&pool, 1, Utc::now()).await.expect("list due");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, due);

    let pending_everywhere = retry_queue::list(
        &pool,
        &RetryFilter {
            status: Some(RetryStatus::Pending),
            ..RetryFilter::default()
        },
    )
    .await
    .expect("list pending");
    assert_eq!(pending_everywhere.len(), 3);
}

#[tokio::test]
async fn transient_failures_walk_the_backoff_until_exhaustion() {
    let test_db = setup_db().await;
    let pool = test_db.pool;
    let cipher = FieldCipher::from_key(TEST_KEY).expect("cipher");
    let config = PollerConfig::default();
    seed_connection(&pool, &cipher, 1).await;

    let id = seed_retry_item(&pool, 1, 101, 1, -1).await;
    let sender = StubWebhook {
        transient: HashSet::from([101]),
        ..StubWebhook::default()
    };

    run_cycle(&pool, &config, &cipher, &EmptyOdoo, &sender, 1, &CancellationToken::new(), false)
        .await
        .expect("cycle");

    let item = retry_queue::get(&pool, id).await.expect("get item");
    assert_eq!(item.attempts, 2);
    assert_eq!(item.status, RetryStatus::Pending);

    // Walk the remaining attempts to the cap by making the item due again.
    for expected_attempts in 3..=10i64 {
        sqlx::query("UPDATE retry_queue SET next_attempt_at = ? WHERE id = ?")
            .bind((Utc::now() - Duration::seconds(1)).to_rfc3339())
            .bind(id.to_string())
            .execute(&pool)
            .await
            .expect("force due");

        run_cycle(&pool, &config, &cipher, &EmptyOdoo, &sender, 1, &CancellationToken::new(), false)
            .await
            .expect("cycle");

        let item = retry_queue::get(&pool, id).await.expect("get item");
        assert_eq!(item.attempts, expected_attempts);
    }

    let item = retry_queue::get(&pool, id).await.expect("get item");
    assert_eq!(item.status, RetryStatus::Exhausted);
    assert_eq!(item.attempts, 10);

    // Exhausted items are left alone by later cycles.
    run_cycle(&pool, &config, &cipher, &EmptyOdoo, &sender, 1, &CancellationToken::new(), false)
        .await
        .expect("cycle");
    let item = retry_queue::get(&pool, id).await.expect("get item");
    assert_eq!(item.attempts, 10);
}

#[tokio::test]
async fn operator_retry_revives_an_exhausted_item() {
    let test_db = setup_db().await;
    let pool = test_db.pool;
    let cipher = FieldCipher::from_key(TEST_KEY).expect("cipher");
    let config = PollerConfig::default();
    seed_connection(&pool, &cipher, 1).await;

    let id = seed_retry_item(&pool, 1, 101, 10, -1).await;
    retry_queue::mark_exhausted(&pool, id, 10, "http 503").await.expect("exhaust");

    // Untouched by the cycle while exhausted.
    run_cycle(&pool, &config, &cipher, &EmptyOdoo, &StubWebhook::default(), 1, &CancellationToken::new(), false)
        .await
        .expect("cycle");
    assert_eq!(
        retry_queue::get(&pool, id).await.expect("get").status,
        RetryStatus::Exhausted
    );

    retry_queue::mark_pending_now(&pool, id).await.expect("operator retry");
    let item = retry_queue::get(&pool, id).await.expect("get");
    assert_eq!(item.status, RetryStatus::Pending);
    assert_eq!(item.attempts, 10);

    // The receiver has recovered; the revived item delivers and is removed.
    run_cycle(&pool, &config, &cipher, &EmptyOdoo, &StubWebhook::default(), 1, &CancellationToken::new(), false)
        .await
        .expect("cycle");

    assert!(matches!(
        retry_queue::get(&pool, id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(
        sent_orders::exists(&pool, 1, 101, "2024-05-01 10:00:00")
            .await
            .expect("exists")
    );
}

#[tokio::test]
async fn permanent_failure_exhausts_immediately() {
    let test_db = setup_db().await;
    let pool = test_db.pool;
    let cipher = FieldCipher::from_key(TEST_KEY).expect("cipher");
    let config = PollerConfig::default();
    seed_connection(&pool, &cipher, 1).await;

    let id = seed_retry_item(&pool, 1, 101, 2, -1).await;
    let sender = StubWebhook {
        permanent: HashSet::from([101]),
        ..StubWebhook::default()
    };

    let report = run_cycle(&pool, &config, &cipher, &EmptyOdoo, &sender, 1, &CancellationToken::new(), false)
        .await
        .expect("cycle");
    assert_eq!(report.orders_failed, 1);

    let item = retry_queue::get(&pool, id).await.expect("get");
    assert_eq!(item.status, RetryStatus::Exhausted);
    assert_eq!(item.attempts, 3);
    assert_eq!(item.last_error.as_deref(), Some("http 410"));
}

#[tokio::test]
async fn discard_command_removes_an_item_from_rotation() {
    let test_db = setup_db().await;
    let pool = test_db.pool;
    let cipher = FieldCipher::from_key(TEST_KEY).expect("cipher");
    let config = PollerConfig::default();
    seed_connection(&pool, &cipher, 1).await;

    let id = seed_retry_item(&pool, 1, 101, 1, -1).await;
    retry_queue::mark_discarded(&pool, id).await.expect("discard");

    run_cycle(&pool, &config, &cipher, &EmptyOdoo, &StubWebhook::default(), 1, &CancellationToken::new(), false)
        .await
        .expect("cycle");

    let item = retry_queue::get(&pool, id).await.expect("get");
    assert_eq!(item.status, RetryStatus::Discarded);
    assert_eq!(item.attempts, 1);
    assert!(
        !sent_orders::exists(&pool, 1, 101, "2024-05-01 10:00:00")
            .await
            .expect("exists")
    );

    assert!(matches!(
        retry_queue::mark_discarded(&pool, uuid::Uuid::new_v4()).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn rescheduled_delay_follows_the_backoff_table() {
    let test_db = setup_db().await;
    let pool = test_db.pool;
    let cipher = FieldCipher::from_key(TEST_KEY).expect("cipher");
    let config = PollerConfig::default();
    seed_connection(&pool, &cipher, 1).await;

    let id = seed_retry_item(&pool, 1, 101, 3, -1).await;
    let sender = StubWebhook {
        transient: HashSet::from([101]),
        ..StubWebhook::default()
    };

    let before = Utc::now();
    run_cycle(&pool, &config, &cipher, &EmptyOdoo, &sender, 1, &CancellationToken::new(), false)
        .await
        .expect("cycle");

    let item = retry_queue::get(&pool, id).await.expect("get");
    assert_eq!(item.attempts, 4);
    let next = chrono::DateTime::parse_from_rfc3339(&item.next_attempt_at)
        .expect("parse next_attempt_at")
        .with_timezone(&Utc);
    let delay = (next - before).num_seconds();
    assert!(
        (235..=245).contains(&delay),
        "fourth attempt should back off ~240s, was {delay}s"
    );
}
