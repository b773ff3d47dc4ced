//! Batched projection job queue.
//!
//! One [`ProjectionQueue`] exists per projection target. Jobs are appended
//! by [`ProjectionQueue::enqueue`] and drained head to tail by
//! [`ProjectionQueue::flush`], which is started either right away through
//! [`ProjectionQueue::trigger`] or by a periodic timer registered with a
//! [`Scheduler`].
//!
//! Only one drain runs at a time. A transient failure keeps the job at the
//! head of the queue, sleeps for the next entry of the backoff table and
//! retries it; once the table is exhausted the job is dropped and logged.
//! Failures that a retry cannot fix drop the job straight away.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize, de};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    projection::ProjectionError,
    scheduler::{Scheduler, TimerHandle},
};

/// Delay before each retry, indexed by the job's try count.
pub const RETRY_BACKOFF: [Duration; 8] = [
    Duration::from_millis(10),
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
    Duration::from_millis(5000),
    Duration::from_millis(10000),
];

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// Future produced by one attempt of a job.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), ProjectionError>> + Send + 'static>>;

type Action = Arc<dyn Fn() -> JobFuture + Send + Sync + 'static>;

/// What a job is about. Carried into every log line about the job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobContext {
    pub entity_type: &'static str,
    pub event_kind: &'static str,
    pub message_id: Uuid,
    pub correlation_id: Uuid,
}

/// A queued unit of projection work.
///
/// The action is re-invoked for every attempt, so it must build a fresh
/// future each time.
#[derive(Clone)]
pub struct Job {
    action: Action,
    try_count: usize,
    context: JobContext,
}

impl Job {
    pub fn new<F, Fut>(context: JobContext, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProjectionError>> + Send + 'static,
    {
        Self {
            action: Arc::new(move || Box::pin(action()) as JobFuture),
            try_count: 0,
            context,
        }
    }

    /// Failed attempts so far.
    #[must_use]
    pub const fn try_count(&self) -> usize {
        self.try_count
    }

    #[must_use]
    pub const fn context(&self) -> &JobContext {
        &self.context
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("try_count", &self.try_count)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Queue configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Period of the flush timer. Must not be zero.
    #[serde(deserialize_with = "flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Retry delays. A job is dropped after one retry per entry.
    pub retry_backoff_ms: Vec<u64>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            retry_backoff_ms: RETRY_BACKOFF
                .iter()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .collect(),
        }
    }
}

fn flush_interval_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match u64::deserialize(deserializer)? {
        0 => Err(de::Error::invalid_value(
            de::Unexpected::Unsigned(0),
            &"a flush interval of at least 1 ms",
        )),
        ms => Ok(ms),
    }
}

/// Invalid queue configuration in the environment.
#[derive(Debug, Error)]
#[error("invalid value `{value}` for {var}")]
pub struct SettingsError {
    pub var: &'static str,
    pub value: String,
}

impl QueueSettings {
    /// Defaults overridden by `EVENTIDE_QUEUE_FLUSH_INTERVAL_MS` and
    /// `EVENTIDE_QUEUE_RETRY_BACKOFF_MS` (comma separated).
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if a variable is set but does not parse.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_vars(|var| std::env::var(var).ok())
    }

    fn from_vars(var: impl Fn(&'static str) -> Option<String>) -> Result<Self, SettingsError> {
        const INTERVAL: &str = "EVENTIDE_QUEUE_FLUSH_INTERVAL_MS";
        const BACKOFF: &str = "EVENTIDE_QUEUE_RETRY_BACKOFF_MS";

        let mut settings = Self::default();
        if let Some(value) = var(INTERVAL) {
            settings.flush_interval_ms = match value.trim().parse() {
                Ok(0) | Err(_) => return Err(SettingsError { var: INTERVAL, value }),
                Ok(ms) => ms,
            };
        }
        if let Some(value) = var(BACKOFF) {
            settings.retry_backoff_ms = value
                .split(',')
                .map(|part| part.trim().parse())
                .collect::<Result<_, _>>()
                .map_err(|_| SettingsError { var: BACKOFF, value })?;
        }
        Ok(settings)
    }

    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Vec<Duration> {
        self.retry_backoff_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}

/// Outcome of one drain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub retries: usize,
    /// Jobs dropped, after exhausting retries or on a non-transient error.
    pub failed: usize,
}

/// Point-in-time counters of a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub retries: u64,
    pub dropped: u64,
}

struct Inner {
    name: String,
    jobs: Mutex<VecDeque<Job>>,
    gate: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
    backoff: Vec<Duration>,
    flush_interval: Duration,
}

/// Decrements the in-flight counter when a drain ends, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Single-flight job queue for one projection target.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct ProjectionQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProjectionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionQueue")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ProjectionQueue {
    pub fn new(name: impl Into<String>, settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                jobs: Mutex::new(VecDeque::new()),
                gate: tokio::sync::Mutex::new(()),
                in_flight: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                backoff: settings.retry_backoff(),
                flush_interval: settings.flush_interval(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Append a job. It runs on the next flush.
    pub fn enqueue(&self, job: Job) {
        let queued = {
            let mut jobs = self.inner.jobs.lock().expect("projection queue lock poisoned");
            jobs.push_back(job);
            jobs.len()
        };
        tracing::trace!(queue = %self.inner.name, queued, "job enqueued");
    }

    /// Start a non-forced flush in the background and return immediately.
    pub fn trigger(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.flush(false).await;
        });
    }

    /// Flush on every tick of the configured interval until the handle is
    /// dropped.
    pub fn start_timer(&self, scheduler: &dyn Scheduler) -> TimerHandle {
        let queue = self.clone();
        scheduler.register_periodic(
            self.inner.flush_interval,
            Arc::new(move || {
                let queue = queue.clone();
                Box::pin(async move {
                    queue.flush(false).await;
                })
            }),
        )
    }

    /// Drain the queue.
    ///
    /// A non-forced flush returns `None` straight away when another drain is
    /// running; that drain picks up anything queued meanwhile. A forced flush
    /// waits for the running drain to finish and then drains itself, so it is
    /// never skipped.
    #[tracing::instrument(skip(self), fields(queue = %self.inner.name))]
    pub async fn flush(&self, force: bool) -> Option<DrainReport> {
        let _gate = if force {
            self.inner.gate.lock().await
        } else if let Ok(gate) = self.inner.gate.try_lock() {
            gate
        } else {
            tracing::trace!("drain already running, skipping flush");
            return None;
        };
        let _in_flight = InFlight::enter(&self.inner.in_flight);
        let report = self.drain().await;
        if report != DrainReport::default() {
            tracing::debug!(
                completed = report.completed,
                retries = report.retries,
                failed = report.failed,
                "queue drained"
            );
        }
        Some(report)
    }

    fn head(&self) -> Option<Job> {
        self.inner
            .jobs
            .lock()
            .expect("projection queue lock poisoned")
            .front()
            .cloned()
    }

    fn pop(&self) {
        self.inner
            .jobs
            .lock()
            .expect("projection queue lock poisoned")
            .pop_front();
    }

    fn record_retry(&self) {
        if let Some(head) = self
            .inner
            .jobs
            .lock()
            .expect("projection queue lock poisoned")
            .front_mut()
        {
            head.try_count += 1;
        }
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn drop_head(&self, job: &Job, error: &ProjectionError, reason: &'static str) {
        self.pop();
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        let context = job.context;
        tracing::error!(
            entity_type = context.entity_type,
            event_kind = context.event_kind,
            message_id = %context.message_id,
            correlation_id = %context.correlation_id,
            attempts = job.try_count + 1,
            %error,
            "dropping projection job: {reason}"
        );
    }

    async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(job) = self.head() {
            let error = match (job.action)().await {
                Ok(()) => {
                    self.pop();
                    self.inner.completed.fetch_add(1, Ordering::Relaxed);
                    report.completed += 1;
                    continue;
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                self.drop_head(&job, &error, "not retryable");
                report.failed += 1;
                continue;
            }
            let Some(&delay) = self.inner.backoff.get(job.try_count) else {
                self.drop_head(&job, &error, "retries exhausted");
                report.failed += 1;
                continue;
            };

            tracing::warn!(
                entity_type = job.context.entity_type,
                message_id = %job.context.message_id,
                attempt = job.try_count + 1,
                ?delay,
                %error,
                "projection job failed, retrying"
            );
            tokio::time::sleep(delay).await;
            self.record_retry();
            report.retries += 1;
        }
        report
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self
                .inner
                .jobs
                .lock()
                .expect("projection queue lock poisoned")
                .len(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            completed: self.inner.completed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}
