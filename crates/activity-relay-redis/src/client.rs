//! Shared Redis connection handle

use redis::aio::ConnectionManager;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// Default per-command timeout
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Lazily connected Redis handle shared by the adapters
///
/// Presence, events and rate-limit counters all live behind one connection
/// so they stay colocated.
#[derive(Clone, Default)]
pub struct RedisConnection {
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

impl RedisConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to Redis
    pub async fn connect(&self, redis_url: &str) -> anyhow::Result<()> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        *self.manager.write().await = Some(manager);
        info!("Redis connected");
        Ok(())
    }

    /// Drop the connection; later commands fail until reconnected
    pub async fn disconnect(&self) {
        if self.manager.write().await.take().is_some() {
            info!("Redis disconnected");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.manager.read().await.is_some()
    }

    /// Clone of the live connection manager
    pub(crate) async fn manager(&self) -> Result<ConnectionManager, String> {
        self.manager
            .read()
            .await
            .clone()
            .ok_or_else(|| "Redis is not connected".to_string())
    }
}

/// Build a `redis://` URL from discrete settings
pub fn redis_url(host: &str, port: u16, password: Option<&str>) -> String {
    match password.filter(|p| !p.is_empty()) {
        Some(password) => format!("redis://:{}@{}:{}", password, host, port),
        None => format!("redis://{}:{}", host, port),
    }
}

/// Run a Redis command future with a timeout, flattening both failure kinds
pub(crate) async fn timed<T, F>(fut: F) -> Result<T, String>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(COMMAND_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {}ms", COMMAND_TIMEOUT.as_millis())),
    }
}
