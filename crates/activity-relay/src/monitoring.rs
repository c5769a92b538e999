//! Passive metrics and an advisory health verdict
//!
//! Nothing here terminates connections or blocks operations; the verdict is
//! only logged and reported over HTTP.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Latency samples kept for the average
const LATENCY_SAMPLES: usize = 100;
/// Sliding window for events/minute
const EVENT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthThresholds {
    pub max_connections: usize,
    /// Percent of requests
    pub max_error_rate: f64,
    pub max_avg_latency_ms: f64,
    pub max_events_per_minute: usize,
    pub max_memory_bytes: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_error_rate: 5.0,
            max_avg_latency_ms: 1000.0,
            max_events_per_minute: 1000,
            max_memory_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// No failures is healthy, up to two is degraded, more is unhealthy
    pub fn from_failures(failures: usize) -> Self {
        match failures {
            0 => HealthStatus::Healthy,
            1..=2 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_disconnections: u64,
    pub total_events: u64,
    pub events_per_minute: usize,
    pub events_by_type: BTreeMap<String, u64>,
    pub average_latency_ms: f64,
    pub total_requests: u64,
    pub error_count: u64,
    /// Percent of requests that failed
    pub error_rate: f64,
    pub errors_by_code: BTreeMap<String, u64>,
    pub store_operations: BTreeMap<String, u64>,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: &'static str,
    pub passed: bool,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub metrics: MetricsSnapshot,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStats {
    pub uptime: u64,
    pub start_time: DateTime<Utc>,
    pub total_events: u64,
    pub total_requests: u64,
    pub error_count: u64,
}

/// Threshold checks for one snapshot
pub fn evaluate(metrics: &MetricsSnapshot, thresholds: &HealthThresholds) -> (HealthStatus, Vec<HealthCheck>) {
    let check = |name, value: f64, threshold: f64| HealthCheck {
        name,
        passed: value < threshold,
        value,
        threshold,
    };

    let checks = vec![
        check(
            "connections",
            metrics.active_connections as f64,
            thresholds.max_connections as f64,
        ),
        check("error_rate", metrics.error_rate, thresholds.max_error_rate),
        check("latency", metrics.average_latency_ms, thresholds.max_avg_latency_ms),
        check(
            "events_per_minute",
            metrics.events_per_minute as f64,
            thresholds.max_events_per_minute as f64,
        ),
        check(
            "memory",
            metrics.memory_bytes as f64,
            thresholds.max_memory_bytes as f64,
        ),
    ];

    let failures = checks.iter().filter(|c| !c.passed).count();
    (HealthStatus::from_failures(failures), checks)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn counts(map: &DashMap<String, u64>) -> BTreeMap<String, u64> {
    map.iter().map(|e| (e.key().clone(), *e.value())).collect()
}

struct ProcessProbe {
    pid: Pid,
    system: System,
}

impl ProcessProbe {
    fn new() -> Self {
        Self {
            pid: Pid::from_u32(std::process::id()),
            system: System::new_with_specifics(
                RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
            ),
        }
    }

    fn resident_memory(&mut self) -> u64 {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        self.system.process(self.pid).map(|p| p.memory()).unwrap_or(0)
    }
}

struct Inner {
    thresholds: HealthThresholds,
    started_at: Mutex<(Instant, DateTime<Utc>)>,
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    total_disconnections: AtomicU64,
    total_events: AtomicU64,
    events_by_type: DashMap<String, u64>,
    event_times: Mutex<VecDeque<Instant>>,
    latencies: Mutex<VecDeque<f64>>,
    total_requests: AtomicU64,
    error_count: AtomicU64,
    errors_by_code: DashMap<String, u64>,
    store_operations: DashMap<String, u64>,
    probe: Mutex<ProcessProbe>,
}

/// Relay-wide counters
#[derive(Clone)]
pub struct MonitoringService {
    inner: Arc<Inner>,
}

impl MonitoringService {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            inner: Arc::new(Inner {
                thresholds,
                started_at: Mutex::new((Instant::now(), Utc::now())),
                active_connections: AtomicUsize::new(0),
                total_connections: AtomicU64::new(0),
                total_disconnections: AtomicU64::new(0),
                total_events: AtomicU64::new(0),
                events_by_type: DashMap::new(),
                event_times: Mutex::new(VecDeque::new()),
                latencies: Mutex::new(VecDeque::with_capacity(LATENCY_SAMPLES)),
                total_requests: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                errors_by_code: DashMap::new(),
                store_operations: DashMap::new(),
                probe: Mutex::new(ProcessProbe::new()),
            }),
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.inner.thresholds
    }

    pub fn record_connection(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnection(&self) {
        let _ = self
            .inner
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.inner.total_disconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event(&self, event_type: &str) {
        self.inner.total_events.fetch_add(1, Ordering::Relaxed);
        *self
            .inner
            .events_by_type
            .entry(event_type.to_string())
            .or_default() += 1;

        let now = Instant::now();
        let mut times = lock(&self.inner.event_times);
        times.push_back(now);
        Self::prune_window(&mut times, now);
    }

    pub fn record_latency(&self, latency: Duration) {
        let mut latencies = lock(&self.inner.latencies);
        if latencies.len() >= LATENCY_SAMPLES {
            latencies.pop_front();
        }
        latencies.push_back(latency.as_secs_f64() * 1000.0);
    }

    /// Count one inbound client request
    pub fn record_request(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, code: &str) {
        self.inner.error_count.fetch_add(1, Ordering::Relaxed);
        *self
            .inner
            .errors_by_code
            .entry(code.to_string())
            .or_default() += 1;
    }

    /// Count one call to an external store (e.g. `presence.set_user_online`)
    pub fn record_store_op(&self, operation: &str) {
        *self
            .inner
            .store_operations
            .entry(operation.to_string())
            .or_default() += 1;
    }

    fn prune_window(times: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = times.front() {
            if now.duration_since(*oldest) > EVENT_WINDOW {
                times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn events_per_minute(&self) -> usize {
        let mut times = lock(&self.inner.event_times);
        Self::prune_window(&mut times, Instant::now());
        times.len()
    }

    pub fn average_latency_ms(&self) -> f64 {
        let latencies = lock(&self.inner.latencies);
        if latencies.is_empty() {
            return 0.0;
        }
        latencies.iter().sum::<f64>() / latencies.len() as f64
    }

    /// Failed requests as a percentage of all requests
    pub fn error_rate(&self) -> f64 {
        let requests = self.inner.total_requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        self.inner.error_count.load(Ordering::Relaxed) as f64 / requests as f64 * 100.0
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    fn uptime(&self) -> Duration {
        lock(&self.inner.started_at).0.elapsed()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections(),
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            total_disconnections: self.inner.total_disconnections.load(Ordering::Relaxed),
            total_events: self.inner.total_events.load(Ordering::Relaxed),
            events_per_minute: self.events_per_minute(),
            events_by_type: counts(&self.inner.events_by_type),
            average_latency_ms: self.average_latency_ms(),
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            error_count: self.inner.error_count.load(Ordering::Relaxed),
            error_rate: self.error_rate(),
            errors_by_code: counts(&self.inner.errors_by_code),
            store_operations: counts(&self.inner.store_operations),
            memory_bytes: lock(&self.inner.probe).resident_memory(),
            uptime_secs: self.uptime().as_secs(),
        }
    }

    pub fn get_health(&self) -> HealthReport {
        let metrics = self.get_metrics();
        let (status, checks) = evaluate(&metrics, &self.inner.thresholds);
        HealthReport {
            status,
            checks,
            metrics,
            timestamp: Utc::now(),
        }
    }

    pub fn get_stats(&self) -> MonitoringStats {
        let start_time = lock(&self.inner.started_at).1;
        MonitoringStats {
            uptime: self.uptime().as_secs(),
            start_time,
            total_events: self.inner.total_events.load(Ordering::Relaxed),
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            error_count: self.inner.error_count.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter and restart the uptime clock
    ///
    /// Active connections are left alone; they still exist.
    pub fn reset(&self) {
        *lock(&self.inner.started_at) = (Instant::now(), Utc::now());
        self.inner.total_connections.store(0, Ordering::Relaxed);
        self.inner.total_disconnections.store(0, Ordering::Relaxed);
        self.inner.total_events.store(0, Ordering::Relaxed);
        self.inner.total_requests.store(0, Ordering::Relaxed);
        self.inner.error_count.store(0, Ordering::Relaxed);
        self.inner.events_by_type.clear();
        self.inner.errors_by_code.clear();
        self.inner.store_operations.clear();
        lock(&self.inner.event_times).clear();
        lock(&self.inner.latencies).clear();
        info!("Monitoring counters reset");
    }

    pub fn alert(&self, message: &str, severity: AlertSeverity) {
        match severity {
            AlertSeverity::Info => info!(target: "relay::audit", ?severity, alert = message, "Alert"),
            AlertSeverity::Warning => warn!(target: "relay::audit", ?severity, alert = message, "Alert"),
            AlertSeverity::Critical => error!(target: "relay::audit", ?severity, alert = message, "Alert"),
        }
    }

    /// Raise an alert when `condition` holds; returns `condition`
    pub fn alert_if(&self, condition: bool, message: &str, severity: AlertSeverity) -> bool {
        if condition {
            self.alert(message, severity);
        }
        condition
    }

    /// Spawn the periodic health check and metrics logger
    pub fn spawn_reporters(
        &self,
        health_interval: Duration,
        metrics_interval: Duration,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let health = {
            let monitoring = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(health_interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let report = monitoring.get_health();
                            if report.status == HealthStatus::Unhealthy {
                                let failing: Vec<&str> = report
                                    .checks
                                    .iter()
                                    .filter(|c| !c.passed)
                                    .map(|c| c.name)
                                    .collect();
                                error!(?failing, "Relay health is unhealthy");
                            }
                        }
                    }
                }
            })
        };

        let metrics = {
            let monitoring = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(metrics_interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let m = monitoring.get_metrics();
                            info!(
                                target: "relay::metrics",
                                active_connections = m.active_connections,
                                events_per_minute = m.events_per_minute,
                                average_latency_ms = m.average_latency_ms,
                                error_rate = m.error_rate,
                                memory_bytes = m.memory_bytes,
                                "Metrics snapshot"
                            );
                        }
                    }
                }
            })
        };

        vec![health, metrics]
    }
}

impl Default for MonitoringService {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}
