// ============================================================================
// POLLER & EVENT BUS
// ============================================================================
// One task per data domain: fetch, hand the payload to every subscriber of
// that domain, sleep, repeat. Handlers are plain closures bound when each
// metric is built. A handler that fails or panics is logged and skipped;
// the loop and the other handlers keep going.
// ============================================================================

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use prometheus::{GaugeVec, IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ExporterError, ExporterResult};
use crate::interval::PollInterval;
use crate::types::{EventKind, Payload};

// ----------------------------------------------------------------------------
// Data Sources
// ----------------------------------------------------------------------------

/// Something a poll task can fetch a payload from.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// Domain this source produces payloads for.
    fn event(&self) -> EventKind;

    /// Fetch one payload. Called once per poll cycle.
    async fn fetch(&self) -> ExporterResult<Payload>;
}

// ----------------------------------------------------------------------------
// Event Bus
// ----------------------------------------------------------------------------

pub type HandlerFn = dyn Fn(&Payload) -> ExporterResult<()> + Send + Sync;

/// A named handler registered on the bus.
pub struct Subscription {
    name: String,
    handler: Box<HandlerFn>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("name", &self.name).finish()
    }
}

/// Outcome of handing one payload to every subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub handled: usize,
    pub failed: usize,
}

/// Subscriber table keyed by event kind.
#[derive(Debug)]
pub struct EventBus {
    served: HashSet<EventKind>,
    handlers: Mutex<HashMap<EventKind, Vec<Arc<Subscription>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Bus serving every known event kind
    pub fn new() -> Self {
        Self::with_kinds(EventKind::ALL)
    }

    pub fn with_kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            served: kinds.into_iter().collect(),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn serves(&self, kind: EventKind) -> bool {
        self.served.contains(&kind)
    }

    /// Append `handler` to the subscribers of `kind`.
    ///
    /// Fails with [`ExporterError::UnknownEventKind`] when the bus does not
    /// serve `kind`; the table is left untouched in that case.
    pub fn subscribe<F>(&self, kind: EventKind, name: impl Into<String>, handler: F) -> ExporterResult<()>
    where
        F: Fn(&Payload) -> ExporterResult<()> + Send + Sync + 'static,
    {
        if !self.serves(kind) {
            return Err(ExporterError::UnknownEventKind(kind.to_string()));
        }

        let subscription = Arc::new(Subscription {
            name: name.into(),
            handler: Box::new(handler),
        });
        debug!(
            target: "anka_exporter::bus",
            event = %kind,
            handler = subscription.name(),
            "Handler subscribed"
        );
        self.handlers.lock().entry(kind).or_default().push(subscription);
        Ok(())
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Handler names for `kind`, in registration order
    pub fn handler_names(&self, kind: EventKind) -> Vec<String> {
        self.snapshot(kind)
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    fn snapshot(&self, kind: EventKind) -> Vec<Arc<Subscription>> {
        self.handlers.lock().get(&kind).cloned().unwrap_or_default()
    }

    /// Run every handler subscribed to the payload's kind, in registration
    /// order, on the calling task. The subscriber lock is released before
    /// the first handler runs.
    pub fn dispatch(&self, payload: &Payload) -> DispatchReport {
        let kind = payload.kind();
        let mut report = DispatchReport::default();

        for subscription in self.snapshot(kind) {
            report.handled += 1;
            match catch_unwind(AssertUnwindSafe(|| (subscription.handler)(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!(
                        target: "anka_exporter::bus",
                        event = %kind,
                        handler = subscription.name(),
                        error = %e,
                        "Handler failed"
                    );
                }
                Err(panic) => {
                    report.failed += 1;
                    error!(
                        target: "anka_exporter::bus",
                        event = %kind,
                        handler = subscription.name(),
                        panic = panic_message(panic.as_ref()),
                        "Handler panicked"
                    );
                }
            }
        }

        report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Fetch once from `source` and dispatch the result.
pub async fn poll_cycle<S>(source: &S, bus: &EventBus) -> ExporterResult<DispatchReport>
where
    S: DataSource + ?Sized,
{
    let expected = source.event();
    let payload = source.fetch().await?;
    if payload.kind() != expected {
        return Err(ExporterError::PayloadMismatch {
            expected,
            actual: payload.kind(),
        });
    }
    Ok(bus.dispatch(&payload))
}

// ----------------------------------------------------------------------------
// Poll Health & Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollStatus {
    Healthy,
    /// Last fetch failed
    Degraded,
    /// Three or more fetches failed in a row
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollHealth {
    pub status: PollStatus,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for PollHealth {
    fn default() -> Self {
        Self {
            status: PollStatus::Unknown,
            last_success: None,
            last_error: None,
            last_error_message: None,
            consecutive_failures: 0,
        }
    }
}

/// Point-in-time view of one poll task.
#[derive(Debug, Clone, Serialize)]
pub struct PollStats {
    pub event: &'static str,
    pub cycles: u64,
    pub errors: u64,
    pub handler_failures: u64,
    pub avg_cycle_us: u64,
    pub max_cycle_us: u64,
    pub health: PollHealth,
}

#[derive(Debug, Default)]
struct PollStatsTracker {
    cycles: AtomicU64,
    errors: AtomicU64,
    handler_failures: AtomicU64,
    total_duration_us: AtomicU64,
    max_duration_us: AtomicU64,
    health: RwLock<PollHealth>,
}

impl PollStatsTracker {
    fn record_success(&self, duration: Duration, report: DispatchReport) {
        let us = duration.as_micros() as u64;
        self.cycles.fetch_add(1, AtomicOrdering::Relaxed);
        self.total_duration_us.fetch_add(us, AtomicOrdering::Relaxed);
        self.max_duration_us.fetch_max(us, AtomicOrdering::Relaxed);
        self.handler_failures
            .fetch_add(report.failed as u64, AtomicOrdering::Relaxed);

        let mut health = self.health.write();
        health.status = PollStatus::Healthy;
        health.last_success = Some(Utc::now());
        health.consecutive_failures = 0;
    }

    fn record_error(&self, message: &str) {
        self.errors.fetch_add(1, AtomicOrdering::Relaxed);

        let mut health = self.health.write();
        health.last_error = Some(Utc::now());
        health.last_error_message = Some(message.to_string());
        health.consecutive_failures += 1;
        health.status = if health.consecutive_failures >= 3 {
            PollStatus::Failed
        } else {
            PollStatus::Degraded
        };
    }

    fn snapshot(&self, event: EventKind) -> PollStats {
        let cycles = self.cycles.load(AtomicOrdering::Relaxed);
        let total_us = self.total_duration_us.load(AtomicOrdering::Relaxed);

        PollStats {
            event: event.as_str(),
            cycles,
            errors: self.errors.load(AtomicOrdering::Relaxed),
            handler_failures: self.handler_failures.load(AtomicOrdering::Relaxed),
            avg_cycle_us: if cycles > 0 { total_us / cycles } else { 0 },
            max_cycle_us: self.max_duration_us.load(AtomicOrdering::Relaxed),
            health: self.health.read().clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Self Metrics
// ----------------------------------------------------------------------------

/// Freshness gauges for the poll tasks themselves.
#[derive(Clone)]
pub struct PollerMetrics {
    last_success: GaugeVec,
    errors: IntCounterVec,
    interval: IntGauge,
}

impl std::fmt::Debug for PollerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerMetrics")
            .field("interval", &self.interval.get())
            .finish_non_exhaustive()
    }
}

impl PollerMetrics {
    pub fn register(registry: &Registry) -> ExporterResult<Self> {
        let last_success = GaugeVec::new(
            Opts::new(
                "anka_exporter_last_successful_poll_timestamp_seconds",
                "Unix time of the last successful poll, per event",
            ),
            &["event"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("anka_exporter_poll_errors_total", "Failed polls, per event"),
            &["event"],
        )?;
        let interval = IntGauge::new(
            "anka_exporter_poll_interval_seconds",
            "Current shared poll interval",
        )?;

        registry.register(Box::new(last_success.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(interval.clone()))?;

        Ok(Self {
            last_success,
            errors,
            interval,
        })
    }

    fn record_success(&self, kind: EventKind) {
        self.last_success
            .with_label_values(&[kind.as_str()])
            .set(Utc::now().timestamp() as f64);
    }

    fn record_error(&self, kind: EventKind) {
        self.errors.with_label_values(&[kind.as_str()]).inc();
    }

    fn record_interval(&self, secs: u64) {
        self.interval.set(secs as i64);
    }
}

// ----------------------------------------------------------------------------
// Poller
// ----------------------------------------------------------------------------

/// Owns the poll tasks, one per event kind.
#[derive(Debug)]
pub struct Poller {
    bus: Arc<EventBus>,
    interval: Arc<PollInterval>,
    error_backoff: Duration,
    metrics: PollerMetrics,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<EventKind, JoinHandle<()>>>,
    stats: Mutex<HashMap<EventKind, Arc<PollStatsTracker>>>,
}

impl Poller {
    pub fn new(
        bus: Arc<EventBus>,
        interval: Arc<PollInterval>,
        error_backoff: Duration,
        metrics: PollerMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            interval,
            error_backoff,
            metrics,
            cancel,
            tasks: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the poll loop for `source`'s event kind.
    pub fn start<S: DataSource>(&self, source: S) -> ExporterResult<()> {
        let kind = source.event();
        if !self.bus.serves(kind) {
            return Err(ExporterError::UnknownEventKind(kind.to_string()));
        }

        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&kind) {
            return Err(ExporterError::DuplicatePollTask(kind));
        }

        let stats = Arc::new(PollStatsTracker::default());
        self.stats.lock().insert(kind, stats.clone());

        let task = PollTask {
            source,
            bus: self.bus.clone(),
            interval: self.interval.clone(),
            error_backoff: self.error_backoff,
            metrics: self.metrics.clone(),
            stats,
            cancel: self.cancel.child_token(),
        };
        tasks.insert(kind, tokio::spawn(task.run()));
        Ok(())
    }

    pub fn is_running(&self, kind: EventKind) -> bool {
        self.tasks
            .lock()
            .get(&kind)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stats(&self, kind: EventKind) -> Option<PollStats> {
        self.stats.lock().get(&kind).map(|s| s.snapshot(kind))
    }

    pub fn all_stats(&self) -> Vec<PollStats> {
        let mut stats: Vec<_> = self
            .stats
            .lock()
            .iter()
            .map(|(kind, s)| s.snapshot(*kind))
            .collect();
        stats.sort_by_key(|s| s.event);
        stats
    }

    /// Cancel every poll task and wait up to `grace` for them to exit.
    /// Returns false if some task was still running when the grace ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        let count = handles.len();

        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!(target: "anka_exporter::poller", tasks = count, "Poll tasks stopped");
                true
            }
            Err(_) => {
                warn!(
                    target: "anka_exporter::poller",
                    tasks = count,
                    grace_secs = grace.as_secs(),
                    "Poll tasks did not stop within the grace period"
                );
                false
            }
        }
    }
}

struct PollTask<S> {
    source: S,
    bus: Arc<EventBus>,
    interval: Arc<PollInterval>,
    error_backoff: Duration,
    metrics: PollerMetrics,
    stats: Arc<PollStatsTracker>,
    cancel: CancellationToken,
}

impl<S: DataSource> PollTask<S> {
    async fn run(self) {
        let kind = self.source.event();
        info!(target: "anka_exporter::poller", event = %kind, "Poll task started");

        loop {
            let started = Instant::now();
            debug!(target: "anka_exporter::poller", event = %kind, "Requesting data");

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = poll_cycle(&self.source, &self.bus) => outcome,
            };

            let pause = match outcome {
                Ok(report) => {
                    self.stats.record_success(started.elapsed(), report);
                    self.metrics.record_success(kind);
                    debug!(
                        target: "anka_exporter::poller",
                        event = %kind,
                        handlers = report.handled,
                        failed = report.failed,
                        "Finished requesting data"
                    );
                    self.interval.duration()
                }
                Err(e) => {
                    self.stats.record_error(&e.to_string());
                    self.metrics.record_error(kind);
                    error!(
                        target: "anka_exporter::poller",
                        event = %kind,
                        error = %e,
                        category = e.category(),
                        recoverable = e.is_recoverable(),
                        retry_in_secs = self.error_backoff.as_secs(),
                        "Could not get data"
                    );
                    self.error_backoff
                }
            };
            self.metrics.record_interval(self.interval.secs());

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(target: "anka_exporter::poller", event = %kind, "Poll task stopped");
    }
}
