#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub db_path: String,
    pub default_webhook_url: Option<String>,
    pub http_timeout_seconds: u64,
    pub min_interval_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub reconcile_seconds: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_seconds: u64,
    pub circuit_half_open_successes: u32,
    pub retry_max_attempts: u32,
}

impl PollerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("POLLER_DB_PATH")
            && !value.trim().is_empty()
        {
            config.db_path = value;
        }
        if let Ok(value) = std::env::var("POLLER_DEFAULT_WEBHOOK_URL")
            && !value.trim().is_empty()
        {
            config.default_webhook_url = Some(value);
        }
        if let Ok(value) = std::env::var("POLLER_HTTP_TIMEOUT_SECONDS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.http_timeout_seconds = parsed.max(1);
        }
        if let Ok(value) = std::env::var("POLLER_MIN_INTERVAL_SECONDS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.min_interval_seconds = parsed.max(1);
        }
        if let Ok(value) = std::env::var("POLLER_SHUTDOWN_GRACE_SECONDS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.shutdown_grace_seconds = parsed.max(1);
        }
        if let Ok(value) = std::env::var("POLLER_RECONCILE_SECONDS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.reconcile_seconds = parsed.max(1);
        }
        if let Ok(value) = std::env::var("POLLER_CB_FAILURE_THRESHOLD")
            && let Ok(parsed) = value.parse::<u32>()
        {
            config.circuit_failure_threshold = parsed.max(1);
        }
        if let Ok(value) = std::env::var("POLLER_CB_RECOVERY_SECONDS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.circuit_recovery_seconds = parsed.max(1);
        }
        if let Ok(value) = std::env::var("POLLER_CB_HALFOPEN_SUCCESSES")
            && let Ok(parsed) = value.parse::<u32>()
        {
            config.circuit_half_open_successes = parsed.max(1);
        }
        if let Ok(value) = std::env::var("POLLER_RETRY_MAX_ATTEMPTS")
            && let Ok(parsed) = value.parse::<u32>()
        {
            config.retry_max_attempts = parsed.max(1);
        }

        config
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            db_path: "poller.db".to_string(),
            default_webhook_url: None,
            http_timeout_seconds: 30,
            min_interval_seconds: 5,
            shutdown_grace_seconds: 60,
            reconcile_seconds: 60,
            circuit_failure_threshold: 5,
            circuit_recovery_seconds: 120,
            circuit_half_open_successes: 2,
            retry_max_attempts: 10,
        }
    }
}
