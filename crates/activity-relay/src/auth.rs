//! Authentication, authorization and rate limiting at the connection boundary
//!
//! Tokens are minted elsewhere; this module only validates them against the
//! shared HS256 secret and turns their claims into an [`Identity`].

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AuthError, Error, Result};
use crate::identity::{Identity, Role};

/// Claims issued by the authoring web applications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtClaims {
    /// User identifier
    pub sub: String,
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Issued at (Unix seconds)
    #[serde(default)]
    pub iat: Option<u64>,
    /// Expiration (Unix seconds)
    pub exp: u64,
}

impl From<JwtClaims> for Identity {
    fn from(claims: JwtClaims) -> Self {
        Identity {
            id: claims.sub,
            email: claims.email,
            role: claims.role,
            first_name: claims.first_name,
            last_name: claims.last_name,
        }
    }
}

/// Connection handshake as seen by the gate
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Token supplied in the handshake auth field (`?token=`)
    pub auth_token: Option<String>,
    /// Raw `Authorization` header
    pub authorization: Option<String>,
    /// Client IP address (from X-Forwarded-For or direct connection)
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Handshake {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            auth_token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn with_authorization(header: impl Into<String>) -> Self {
        Self {
            authorization: Some(header.into()),
            ..Default::default()
        }
    }

    /// Token from the auth field, falling back to the Bearer header
    pub fn bearer_token(&self) -> std::result::Result<&str, AuthError> {
        if let Some(token) = self.auth_token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(token);
        }

        let header = self.authorization.as_deref().ok_or(AuthError::MissingToken)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidScheme)?
            .trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(token)
    }
}

/// Fixed-window rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
        }
    }
}

/// Counter store for fixed-window rate limiting
///
/// A window opens on the first request and resets once it has elapsed;
/// the `max_requests + 1`-th request inside it is rejected without
/// touching the window.
#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    async fn check(&self, key: &str, config: &RateLimitConfig) -> Result<()>;

    /// Return the limiter name (for logging)
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// In-process limiter; each instance grants its own quota
#[derive(Clone, Default)]
pub struct MemoryRateLimiter {
    windows: Arc<DashMap<String, Window>>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows that have already expired
    pub fn purge_expired(&self, config: &RateLimitConfig) {
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.started) <= config.window());
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, key: &str, config: &RateLimitConfig) -> Result<()> {
        let now = Instant::now();
        let window = config.window();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) > window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= config.max_requests {
            let elapsed = now.duration_since(entry.started);
            let retry_after_ms = window.saturating_sub(elapsed).as_millis() as u64;
            return Err(Error::RateLimited { retry_after_ms });
        }

        entry.count += 1;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

/// Authentication, authorization and rate limiting for connections
#[derive(Clone)]
pub struct AuthGate {
    decoding_key: DecodingKey,
    validation: Validation,
    limiter: Arc<dyn RateLimiter>,
    rate_limit: RateLimitConfig,
}

impl AuthGate {
    /// Create a gate validating HS256 tokens signed with `secret`
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            validation,
            limiter: Arc::new(MemoryRateLimiter::new()),
            rate_limit: RateLimitConfig::default(),
        }
    }

    /// Use a different counter store (e.g. one shared across instances)
    pub fn with_rate_limiter(mut self, limiter: impl RateLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        self.rate_limit
    }

    /// Validate the handshake token and decode the identity
    pub fn authenticate(&self, handshake: &Handshake) -> std::result::Result<Identity, AuthError> {
        let token = handshake.bearer_token()?;

        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    warn!(client_ip = ?handshake.client_ip, "Token has expired");
                    AuthError::Expired
                }
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    warn!(client_ip = ?handshake.client_ip, "Invalid token signature");
                    AuthError::InvalidSignature
                }
                jsonwebtoken::errors::ErrorKind::Json(_)
                | jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(_) => {
                    warn!(error = %e, "Token claims rejected");
                    AuthError::InvalidClaims(e.to_string())
                }
                _ => {
                    warn!(error = %e, "Token validation failed");
                    AuthError::Invalid(e.to_string())
                }
            }
        })?;

        let identity = Identity::from(data.claims);
        debug!(user_id = %identity.id, role = %identity.role, "Token validated");
        Ok(identity)
    }

    /// Fail unless the identity's role is in `allowed`
    pub fn authorize(&self, identity: &Identity, allowed: &[Role], action: &str) -> Result<()> {
        if allowed.contains(&identity.role) {
            Ok(())
        } else {
            Err(Error::forbidden(identity.role, action))
        }
    }

    /// Count one request against the identity's window
    pub async fn rate_limit(&self, identity: &Identity) -> Result<()> {
        self.limiter.check(&identity.id, &self.rate_limit).await
    }
}
