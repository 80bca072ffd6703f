use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, RedisError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

pub mod lock;

pub use lock::{LeaseLock, LeaseToken};

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

const DEFAULT_REDIS_COMMAND_TIMEOUT_MS: u64 = 3_000;

/// Per-command timeout, read once from `REDIS_COMMAND_TIMEOUT_MS` (minimum 500ms).
pub fn command_timeout() -> Duration {
    static TIMEOUT: OnceCell<Duration> = OnceCell::new();
    *TIMEOUT.get_or_init(|| {
        let ms = std::env::var("REDIS_COMMAND_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REDIS_COMMAND_TIMEOUT_MS)
            .max(500);
        Duration::from_millis(ms)
    })
}

/// Run a Redis command with the configured command timeout.
pub async fn run_with_timeout<F, T>(future: F) -> Result<T, RedisError>
where
    F: Future<Output = Result<T, RedisError>>,
{
    with_timeout(command_timeout(), future).await
}

/// Run a Redis command, mapping an elapsed deadline to an I/O error.
pub async fn with_timeout<F, T>(limit: Duration, future: F) -> Result<T, RedisError>
where
    F: Future<Output = Result<T, RedisError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(res) => res,
        Err(_) => Err(RedisError::from((
            redis::ErrorKind::IoError,
            "redis command timed out",
        ))),
    }
}

/// Single-node Redis connection with automatic reconnect.
#[derive(Clone)]
pub struct RedisPool {
    manager: SharedConnectionManager,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let info = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let db = info.redis.db;

        let client = Client::open(info).context("failed to construct Redis client")?;
        let connection_manager = with_timeout(command_timeout() * 2, ConnectionManager::new(client))
            .await
            .context("failed to initialize Redis connection manager")?;

        info!(db, "Redis connection established");

        Ok(Self {
            manager: Arc::new(Mutex::new(connection_manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    /// Round-trip a PING; used by readiness checks and the operator CLI.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.lock().await.clone();
        let pong: String = run_with_timeout(redis::cmd("PING").query_async(&mut conn))
            .await
            .context("redis ping failed")?;
        anyhow::ensure!(pong == "PONG", "unexpected PING reply: {}", pong);
        Ok(())
    }
}
