//! Ingestion buffer between socket handling and persistence/fan-out
//!
//! Events are buffered in memory and drained on a fixed interval. Delivery
//! is at-most-once: a crash between enqueue and drain loses the event, and a
//! failed event is parked in the dead-letter buffer instead of being retried.
//! Each instance drains its own queue, so there is no ordering across instances.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::RealtimeEvent;

/// Handler invoked for every drained event
pub type EventHandler = Arc<dyn Fn(RealtimeEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`]
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(RealtimeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Enqueue fails with `QueueFull` at this many buffered events
    pub max_size: usize,
    /// Dead letters kept before the oldest is evicted
    pub dead_letter_capacity: usize,
    pub drain_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            dead_letter_capacity: 1000,
            drain_interval: Duration::from_secs(1),
        }
    }
}

/// An event whose handler failed
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: RealtimeEvent,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_size: usize,
    pub dlq_size: usize,
    pub is_processing: bool,
    pub processed_total: u64,
    pub failed_total: u64,
}

struct Inner {
    config: QueueConfig,
    pending: Mutex<VecDeque<RealtimeEvent>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    /// Serializes drain cycles (periodic and shutdown)
    drain_lock: tokio::sync::Mutex<()>,
    processing: AtomicBool,
    closed: AtomicBool,
    processed_total: AtomicU64,
    failed_total: AtomicU64,
}

/// In-memory event queue
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Raises `processing` for the life of a drain cycle, including cancelled ones
struct ProcessingFlag<'a>(&'a AtomicBool);

impl<'a> ProcessingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ProcessingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EventQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                pending: Mutex::new(VecDeque::new()),
                dead_letters: Mutex::new(VecDeque::new()),
                drain_lock: tokio::sync::Mutex::new(()),
                processing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                processed_total: AtomicU64::new(0),
                failed_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Buffer an event for the next drain cycle; never waits on I/O
    pub fn enqueue(&self, event: RealtimeEvent) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Server("event queue is shut down".to_string()));
        }

        let mut pending = lock(&self.inner.pending);
        if pending.len() >= self.inner.config.max_size {
            warn!(
                event_id = %event.id,
                max_size = self.inner.config.max_size,
                "Event queue full, rejecting event"
            );
            return Err(Error::QueueFull(self.inner.config.max_size));
        }
        debug!(event_id = %event.id, event_type = %event.event_type, "Event queued");
        pending.push_back(event);
        Ok(())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain everything currently buffered, in enqueue order
    ///
    /// A failing event is logged and dead-lettered; the rest of the cycle
    /// continues. An event leaves the buffer only once its handler returns,
    /// so a cycle cut short leaves the unhandled events counted in `len`.
    /// Returns the number of events handled.
    pub async fn process_pending(&self, handler: &EventHandler) -> usize {
        let _cycle = self.inner.drain_lock.lock().await;
        let batch_size = self.len();
        if batch_size == 0 {
            return 0;
        }

        let _processing = ProcessingFlag::raise(&self.inner.processing);
        let mut count = 0;
        let mut failed = 0;

        while count < batch_size {
            let next = lock(&self.inner.pending).front().cloned();
            let Some(event) = next else {
                break;
            };
            let event_id = event.id.clone();
            let outcome = handler(event.clone()).await;
            lock(&self.inner.pending).pop_front();
            count += 1;

            match outcome {
                Ok(()) => {
                    self.inner.processed_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    failed += 1;
                    self.inner.failed_total.fetch_add(1, Ordering::Relaxed);
                    error!(event_id = %event_id, error = %e, "Failed to process queued event");
                    self.dead_letter(event, e.to_string());
                }
            }
        }

        debug!(count, failed, "Drain cycle complete");
        count
    }

    fn dead_letter(&self, event: RealtimeEvent, error: String) {
        let capacity = self.inner.config.dead_letter_capacity;
        if capacity == 0 {
            return;
        }
        let mut dead_letters = lock(&self.inner.dead_letters);
        while dead_letters.len() >= capacity {
            dead_letters.pop_front();
        }
        dead_letters.push_back(DeadLetter {
            event,
            error,
            failed_at: Utc::now(),
        });
    }

    /// Snapshot of the dead-letter buffer, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.inner.dead_letters).iter().cloned().collect()
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            queue_size: self.len(),
            dlq_size: lock(&self.inner.dead_letters).len(),
            is_processing: self.inner.processing.load(Ordering::Acquire),
            processed_total: self.inner.processed_total.load(Ordering::Relaxed),
            failed_total: self.inner.failed_total.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic drain task
    pub fn start_periodic_processing(
        &self,
        handler: EventHandler,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        let interval = self.inner.config.drain_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Event queue processing started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Event queue processing stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        queue.process_pending(&handler).await;
                    }
                }
            }
        })
    }

    /// Stop accepting events and run one final drain, bounded by `timeout`
    ///
    /// Returns the number of events left unprocessed.
    pub async fn shutdown(&self, handler: &EventHandler, timeout: Duration) -> usize {
        self.inner.closed.store(true, Ordering::Release);

        match tokio::time::timeout(timeout, self.process_pending(handler)).await {
            Ok(drained) => {
                info!(drained, "Event queue drained on shutdown");
                0
            }
            Err(_) => {
                let lost = self.len();
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    lost, "Event queue drain timed out during shutdown"
                );
                lost
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
