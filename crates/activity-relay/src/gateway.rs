//! Gateway builder and runner

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{http::HeaderValue, routing::get, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::AuthGate;
use crate::broadcaster::EventBroadcaster;
use crate::dispatch::Dispatcher;
use crate::handler;
use crate::monitoring::{HealthThresholds, MonitoringService};
use crate::presence::{MemoryPresenceStore, PresenceStore};
use crate::queue::{EventQueue, QueueConfig};
use crate::relay::{NoopRelay, RoomRelay};
use crate::rooms::RoomRegistry;
use crate::store::{DurableEventStore, MemoryEventStore};

/// Gateway configuration and runner
pub struct Gateway {
    port: u16,
    dispatcher: Dispatcher,
    cors_origins: Vec<String>,
    heartbeat_interval: Duration,
    cleanup_interval: Duration,
    retention: Duration,
    retention_interval: Duration,
    session_idle_timeout: Duration,
    reaper_interval: Duration,
    health_check_interval: Duration,
    metrics_interval: Duration,
    shutdown_timeout: Duration,
}

impl Gateway {
    /// Create a new gateway builder
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// HTTP surface without background tasks
    pub fn router(&self) -> Router {
        let state = handler::GatewayState {
            dispatcher: self.dispatcher.clone(),
            started_at: Instant::now(),
        };

        Router::new()
            .route("/health", get(handler::health))
            .route("/ready", get(handler::ready))
            .route("/stats", get(handler::get_stats))
            .route("/metrics", get(handler::get_metrics))
            .route("/ws", get(handler::ws_connect))
            .layer(cors_layer(&self.cors_origins))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Spawn every periodic task, all stopped by `cancel`
    fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let broadcaster = self.dispatcher.broadcaster().clone();
        let mut tasks = Vec::new();

        tasks.push(
            self.dispatcher
                .queue()
                .start_periodic_processing(self.dispatcher.queue_handler(), cancel.clone()),
        );

        // Dead connections
        let sweeper = broadcaster.clone();
        tasks.push(every(self.cleanup_interval, cancel.clone(), move || {
            let sweeper = sweeper.clone();
            async move {
                let before = sweeper.rooms().connection_count();
                let cleaned = sweeper.sweep_dead_connections().await;
                tracing::debug!(connections = before.saturating_sub(cleaned), cleaned, "Connection cleanup");
            }
        }));

        let rooms = broadcaster.rooms().clone();
        tasks.push(every(self.heartbeat_interval, cancel.clone(), move || {
            rooms.send_heartbeat();
            async {}
        }));

        let store = broadcaster.store().clone();
        let retention = self.retention;
        tasks.push(every(self.retention_interval, cancel.clone(), move || {
            let store = store.clone();
            async move {
                match store.cleanup_old_sessions(retention).await {
                    Ok(report) => tracing::info!(
                        events_removed = report.events_removed,
                        sessions_removed = report.sessions_removed,
                        "Retention cleanup complete"
                    ),
                    Err(e) => tracing::error!(error = %e, "Retention cleanup failed"),
                }
            }
        }));

        let reaper = broadcaster.clone();
        let idle = self.session_idle_timeout;
        tasks.push(every(self.reaper_interval, cancel.clone(), move || {
            let reaper = reaper.clone();
            async move {
                match reaper.reap_idle_sessions(idle).await {
                    Ok(0) => {}
                    Ok(reaped) => tracing::info!(reaped, "Idle sessions marked inactive"),
                    Err(e) => tracing::warn!(error = %e, "Idle session reaper failed"),
                }
            }
        }));

        tasks.extend(broadcaster.monitoring().spawn_reporters(
            self.health_check_interval,
            self.metrics_interval,
            cancel.clone(),
        ));

        tasks
    }

    /// Run the gateway server
    pub async fn run(self) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let broadcaster = self.dispatcher.broadcaster().clone();

        tracing::info!(
            port = self.port,
            instance_id = broadcaster.rooms().instance_id(),
            presence = broadcaster.presence().name(),
            store = broadcaster.store().name(),
            relay = broadcaster.relay().name(),
            "Starting activity relay"
        );

        if let Err(e) = broadcaster
            .relay()
            .start(broadcaster.rooms().clone(), cancel.clone())
            .await
        {
            tracing::error!(error = %e, relay = broadcaster.relay().name(), "Room relay failed to start");
        }

        let tasks = self.spawn_background(&cancel);
        let app = self.router();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        tracing::info!("Listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        let cancel_for_shutdown = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                cancel_for_shutdown.cancel();
            })
            .await?;

        cancel.cancel();
        for task in tasks {
            let _ = task.await;
        }

        let queue = self.dispatcher.queue();
        let lost = queue
            .shutdown(&self.dispatcher.queue_handler(), self.shutdown_timeout)
            .await;
        if lost > 0 {
            tracing::warn!(lost, "Events dropped at shutdown");
        }

        broadcaster.presence().close().await;
        broadcaster.store().close().await;
        broadcaster.relay().close().await;

        tracing::info!("Gateway shutdown complete");
        Ok(())
    }
}

/// Run `tick` on a fixed interval until cancelled
fn every<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// Builder for Gateway
pub struct GatewayBuilder {
    port: u16,
    instance_id: Option<String>,
    auth: Option<AuthGate>,
    presence: Option<Arc<dyn PresenceStore>>,
    store: Option<Arc<dyn DurableEventStore>>,
    relay: Option<Arc<dyn RoomRelay>>,
    queue: QueueConfig,
    thresholds: HealthThresholds,
    cors_origins: Vec<String>,
    heartbeat_interval: Duration,
    cleanup_interval: Duration,
    retention: Duration,
    retention_interval: Duration,
    session_idle_timeout: Duration,
    reaper_interval: Duration,
    health_check_interval: Duration,
    metrics_interval: Duration,
    shutdown_timeout: Duration,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            port: 3001,
            instance_id: None,
            auth: None,
            presence: None,
            store: None,
            relay: None,
            queue: QueueConfig::default(),
            thresholds: HealthThresholds::default(),
            cors_origins: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(30),
            retention: Duration::from_secs(24 * 60 * 60),
            retention_interval: Duration::from_secs(60 * 60),
            session_idle_timeout: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayBuilder {
    /// Set the server port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the instance ID
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Set the authentication gate (required)
    pub fn auth(mut self, auth: AuthGate) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Set the presence store (defaults to in-memory)
    pub fn presence(mut self, presence: impl PresenceStore) -> Self {
        self.presence = Some(Arc::new(presence));
        self
    }

    /// Set the durable event store (defaults to in-memory)
    pub fn store(mut self, store: impl DurableEventStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set the cross-instance relay (defaults to none)
    pub fn relay(mut self, relay: impl RoomRelay) -> Self {
        self.relay = Some(Arc::new(relay));
        self
    }

    pub fn queue(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    pub fn health_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Allowed CORS origins; empty or `*` allows any
    pub fn cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    /// Set the heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the dead-connection cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// How long events and inactive sessions are kept
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention_interval(mut self, interval: Duration) -> Self {
        self.retention_interval = interval;
        self
    }

    /// Sessions idle longer than `timeout` are marked inactive every `interval`
    pub fn session_reaper(mut self, timeout: Duration, interval: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self.reaper_interval = interval;
        self
    }

    pub fn monitoring_intervals(mut self, health_check: Duration, metrics: Duration) -> Self {
        self.health_check_interval = health_check;
        self.metrics_interval = metrics;
        self
    }

    /// Upper bound on the final queue drain
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the gateway
    pub fn build(self) -> anyhow::Result<Gateway> {
        let auth = self.auth.ok_or_else(|| anyhow::anyhow!("Auth gate is required"))?;
        let instance_id = self.instance_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let presence = self.presence.unwrap_or_else(|| {
            tracing::warn!("No presence store configured, presence is process-local");
            Arc::new(MemoryPresenceStore::new())
        });
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryEventStore::default()));
        let relay = self.relay.unwrap_or_else(|| Arc::new(NoopRelay));

        let monitoring = MonitoringService::new(self.thresholds);
        let broadcaster = EventBroadcaster::new(RoomRegistry::new(instance_id), presence, store)
            .with_relay(relay)
            .with_monitoring(monitoring);
        let dispatcher = Dispatcher::new(auth, broadcaster, EventQueue::new(self.queue));

        Ok(Gateway {
            port: self.port,
            dispatcher,
            cors_origins: self.cors_origins,
            heartbeat_interval: self.heartbeat_interval,
            cleanup_interval: self.cleanup_interval,
            retention: self.retention,
            retention_interval: self.retention_interval,
            session_idle_timeout: self.session_idle_timeout,
            reaper_interval: self.reaper_interval,
            health_check_interval: self.health_check_interval,
            metrics_interval: self.metrics_interval,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}
