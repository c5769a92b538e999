use serde::{Deserialize, Serialize};
use std::path::Path;

use activity_relay::{QueueConfig, RateLimitConfig};

/// Secret used when `TEST_MODE` is set and no `JWT_SECRET` is given
const DEV_JWT_SECRET: &str = "relay-dev-secret";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub test_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Allowed CORS origins; empty allows any
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            instance_id: default_instance_id(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_ms: u64,
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            rate_limit_window_ms: default_rate_limit_window(),
            rate_limit_max: default_rate_limit_max(),
        }
    }
}

impl AuthConfig {
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            window_ms: self.rate_limit_window_ms,
            max_requests: self.rate_limit_max,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedisConfig {
    /// Redis URL, e.g. "redis://localhost:6379" or "redis://:password@host:6379"
    /// Without it presence and events stay in this process
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            drain_interval_ms: default_drain_interval_ms(),
        }
    }
}

impl QueueSettings {
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_size: self.max_size,
            drain_interval: std::time::Duration::from_millis(self.drain_interval_ms),
            ..QueueConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_session_retention_hours")]
    pub session_retention_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            session_retention_hours: default_session_retention_hours(),
        }
    }
}

fn default_port() -> u16 {
    3001
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_rate_limit_window() -> u64 {
    60_000
}

fn default_rate_limit_max() -> u32 {
    100
}

fn default_queue_max_size() -> usize {
    1000
}

fn default_drain_interval_ms() -> u64 {
    1000
}

fn default_session_retention_hours() -> u64 {
    24
}

fn parse_env<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, value)),
        Err(_) => Ok(None),
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        let mut config = Self::from_file(&config_path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file; a missing file yields the defaults
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Environment variables take precedence over the file
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(port) = parse_env("PORT")? {
            self.server.port = port;
        }
        if let Some(port) = parse_env("REALTIME_PORT")? {
            self.server.port = port;
        }
        if let Ok(id) = std::env::var("INSTANCE_ID") {
            self.server.instance_id = id;
        }
        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis.url = Some(url);
        } else if let Ok(host) = std::env::var("REDIS_HOST") {
            let port = parse_env("REDIS_PORT")?.unwrap_or(6379);
            let password = std::env::var("REDIS_PASSWORD").ok();
            self.redis.url = Some(activity_relay_redis::redis_url(&host, port, password.as_deref()));
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(window) = parse_env("RATE_LIMIT_WINDOW")? {
            self.auth.rate_limit_window_ms = window;
        }
        if let Some(max) = parse_env("RATE_LIMIT_MAX")? {
            self.auth.rate_limit_max = max;
        }

        if let Some(max_size) = parse_env("QUEUE_MAX_SIZE")? {
            self.queue.max_size = max_size;
        }
        if let Some(interval) = parse_env("QUEUE_DRAIN_INTERVAL_MS")? {
            self.queue.drain_interval_ms = interval;
        }
        if let Some(hours) = parse_env("SESSION_RETENTION_HOURS")? {
            self.retention.session_retention_hours = hours;
        }

        if let Ok(test_mode) = std::env::var("TEST_MODE") {
            self.test_mode = flag(&test_mode);
        }
        Ok(())
    }

    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.is_empty() {
            if !self.test_mode {
                anyhow::bail!("JWT_SECRET environment variable is required");
            }
            self.auth.jwt_secret = DEV_JWT_SECRET.to_string();
        }
        if self.auth.rate_limit_window_ms == 0 || self.auth.rate_limit_max == 0 {
            anyhow::bail!("rate limit window and max must be positive");
        }
        if self.queue.max_size == 0 {
            anyhow::bail!("QUEUE_MAX_SIZE must be positive");
        }
        if self.queue.drain_interval_ms == 0 {
            anyhow::bail!("QUEUE_DRAIN_INTERVAL_MS must be positive");
        }
        Ok(())
    }
}
