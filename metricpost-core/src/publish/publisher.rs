//! Publisher for batching and sending events
//!
//! The Publisher queues normalized events and drains the queue when:
//! - Queue length reaches the batch size (inside `track`)
//! - The periodic flush timer fires and the queue is non-empty
//! - The host reports a lifecycle signal
//! - Flush is explicitly called
//!
//! Normal flushes go through the asynchronous transport and are retried with
//! exponential backoff; batches that exhaust their retries are archived.
//! Teardown signals use the synchronous best-effort transport, without retry.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::PublisherConfig;
use crate::error::{Error, Result};

use super::archive::{FailedBatch, FailedBatchArchive};
use super::client::{Environment, HttpEnvironment};
use super::events::{AttributeInput, EventBatch, EventRecord, Normalizer};
use super::retry::{DeliveryState, RetryPolicy};
use super::session::generate_session_id;

/// Page lifecycle notifications forwarded by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The page is being hidden for navigation; the process may exit
    PageHide,
    /// The page is unloading; the process is about to exit
    Unload,
    /// Visibility changed to hidden; the process keeps running
    Hidden,
    /// Visibility changed to visible
    Visible,
}

/// Result of a flush request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The publisher is administratively disabled
    Disabled,
    /// The publisher has been shut down
    ShutDown,
    /// Another asynchronous flush is in flight
    Busy,
    /// Nothing was queued
    Empty,
    /// The batch of this many events was accepted
    Delivered(usize),
    /// The first attempt failed; retries are scheduled in the background
    Retrying(usize),
    /// Delivery failed and no retries are allowed; the batch was archived
    Archived(usize),
    /// The teardown path could not deliver this many events
    Dropped(usize),
}

/// Publishing statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishStats {
    /// Events accepted by `track`
    pub events_queued: usize,
    /// Events delivered by the asynchronous transport
    pub events_sent: usize,
    /// Batches delivered by the asynchronous transport
    pub batches_sent: usize,
    /// Asynchronous requests made, retries included
    pub api_calls: usize,
    /// Asynchronous requests that failed
    pub api_failures: usize,
    /// Retries scheduled after a failed attempt
    pub retries_scheduled: usize,
    /// Batches moved to the failed-batch archive
    pub batches_archived: usize,
    /// Batches handed to the teardown transport
    pub teardown_sends: usize,
    /// Teardown sends that failed
    pub teardown_failures: usize,
}

/// Batches and delivers events to an ingestion endpoint
///
/// `Publisher` is a cheap handle; clone it and pass it to every call site
/// that records events. Only one publisher should be active per process:
/// each instance has its own session identifier, queue and archive.
///
/// Must be created inside a tokio runtime, which drives the flush timer and
/// retries.
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
}

struct Shared {
    config: PublisherConfig,
    endpoint: String,
    env: Arc<dyn Environment>,
    normalizer: Normalizer,
    policy: RetryPolicy,
    queue: Mutex<Vec<EventRecord>>,
    archive: FailedBatchArchive,
    /// Set while an asynchronous flush owns its first attempt
    flushing: AtomicBool,
    pending_retries: AtomicUsize,
    stats: Mutex<PublishStats>,
    cancel: CancellationToken,
    runtime: Option<Handle>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    /// Create a publisher that talks to the world through `env`
    ///
    /// Fails if the configuration is invalid, or if the publisher is enabled
    /// and no tokio runtime is running.
    pub fn new(config: PublisherConfig, env: Arc<dyn Environment>) -> Result<Self> {
        config.validate()?;

        let runtime = if config.enabled {
            Some(Handle::try_current().map_err(|e| {
                Error::Runtime(format!("publisher requires a tokio runtime: {}", e))
            })?)
        } else {
            None
        };

        let normalizer = Normalizer::new(
            generate_session_id(),
            env.user_agent(),
            config.context.clone(),
        );

        let shared = Arc::new(Shared {
            endpoint: config.endpoint.clone().unwrap_or_default(),
            policy: RetryPolicy::new(config.max_retries),
            env,
            normalizer,
            queue: Mutex::new(Vec::new()),
            archive: FailedBatchArchive::new(),
            flushing: AtomicBool::new(false),
            pending_retries: AtomicUsize::new(0),
            stats: Mutex::new(PublishStats::default()),
            cancel: CancellationToken::new(),
            runtime,
            timer: Mutex::new(None),
            config,
        });

        if let Some(runtime) = &shared.runtime {
            let period = Duration::from_millis(shared.config.batch_timeout_ms);
            let timer = runtime.spawn(run_timer(
                Arc::downgrade(&shared),
                period,
                shared.cancel.clone(),
            ));
            *lock(&shared.timer) = Some(timer);

            tracing::info!(
                session_id = %shared.normalizer.session_id(),
                endpoint = %shared.endpoint,
                batch_size = shared.config.batch_size,
                batch_timeout_ms = shared.config.batch_timeout_ms,
                max_retries = shared.config.max_retries,
                "Publisher started"
            );
        } else {
            tracing::info!("Publisher disabled, events will be ignored");
        }

        Ok(Self { shared })
    }

    /// Create a publisher using the production HTTP environment
    pub fn with_http(config: PublisherConfig) -> Result<Self> {
        let env = HttpEnvironment::new(&config)?;
        Self::new(config, Arc::new(env))
    }

    /// Record an event
    ///
    /// Never fails and never waits on the network. Reaching the batch size
    /// starts a flush in the background.
    pub fn track(
        &self,
        metric_name: &str,
        value: Option<f64>,
        content_id: Option<&str>,
        attributes: Option<AttributeInput>,
        experiment_group: Option<&str>,
    ) {
        let shared = &self.shared;
        if !shared.config.enabled {
            return;
        }
        if shared.cancel.is_cancelled() {
            tracing::debug!(metric_name, "Publisher is shut down, dropping event");
            return;
        }

        let record = shared.normalizer.normalize(
            metric_name,
            value,
            content_id,
            attributes,
            experiment_group,
        );

        let queued = {
            let mut queue = lock(&shared.queue);
            queue.push(record);
            queue.len()
        };
        shared.bump(|s| s.events_queued += 1);

        if queued >= shared.config.batch_size {
            shared.spawn_flush();
        }
    }

    /// Drain the queue through the asynchronous transport
    ///
    /// Returns once the first attempt completes; retries continue in the
    /// background. A flush requested while another is in flight is skipped.
    pub async fn flush(&self) -> FlushOutcome {
        self.shared.flush().await
    }

    /// Drain the queue through the teardown transport
    ///
    /// Tries the beacon mechanism first, then a blocking request. Nothing is
    /// retried or archived.
    pub fn flush_sync(&self) -> FlushOutcome {
        self.shared.flush_sync()
    }

    /// React to a page lifecycle notification
    pub fn handle_signal(&self, signal: LifecycleSignal) {
        tracing::debug!(?signal, "Lifecycle signal");
        match signal {
            LifecycleSignal::PageHide | LifecycleSignal::Unload => {
                self.shared.flush_sync();
            }
            LifecycleSignal::Hidden => self.shared.spawn_flush(),
            LifecycleSignal::Visible => {}
        }
    }

    /// Stop the timer and pending retries, then send what is queued
    ///
    /// The last send uses the teardown transport. Archived batches are
    /// discarded. Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let first = !shared.cancel.is_cancelled();
        // The timer exits on cancellation; a flush it started keeps running
        shared.cancel.cancel();
        lock(&shared.timer).take();
        if !first {
            return;
        }

        let outcome = shared.flush_sync();
        let discarded = shared.archive.clear();
        if discarded > 0 {
            tracing::warn!(batches = discarded, "Discarding failed batches on shutdown");
        }

        tracing::info!(
            session_id = %shared.normalizer.session_id(),
            ?outcome,
            "Publisher shut down"
        );
    }

    /// Number of events waiting in the queue
    pub fn queue_len(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Identifier stamped on every event of this publisher
    pub fn session_id(&self) -> &str {
        self.shared.normalizer.session_id()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.config.enabled
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Batches currently waiting for a retry
    pub fn pending_retries(&self) -> usize {
        self.shared.pending_retries.load(Ordering::Acquire)
    }

    /// Get current publishing statistics
    pub fn stats(&self) -> PublishStats {
        lock(&self.shared.stats).clone()
    }

    /// Batches that exhausted their retries, oldest first
    pub fn failed_batches(&self) -> Vec<FailedBatch> {
        self.shared.archive.list_all()
    }

    /// Resubmit every archived batch
    ///
    /// Each batch leaves the archive and goes through the normal retry
    /// policy again; it returns only if it exhausts its retries again.
    /// Returns the number of batches resubmitted.
    pub async fn retry_failed(&self) -> usize {
        let shared = &self.shared;
        if !shared.config.enabled || shared.cancel.is_cancelled() {
            return 0;
        }

        let failed = shared.archive.take_all();
        let count = failed.len();
        for entry in failed {
            tracing::info!(
                events = entry.batch.len(),
                previous_attempts = entry.attempts,
                "Resubmitting archived batch"
            );
            let outcome = shared.deliver(entry.batch).await;
            tracing::debug!(?outcome, "Resubmitted archived batch");
        }
        count
    }

    /// Discard every archived batch, returning how many were dropped
    pub fn clear_failed(&self) -> usize {
        let dropped = self.shared.archive.clear();
        if dropped > 0 {
            tracing::warn!(batches = dropped, "Cleared failed-batch archive");
        }
        dropped
    }
}

impl Shared {
    fn bump(&self, update: impl FnOnce(&mut PublishStats)) {
        update(&mut lock(&self.stats));
    }

    /// Claim the flush slot and take the queue in one step
    fn begin_flush(self: &Arc<Self>) -> std::result::Result<(FlushGuard, EventBatch), FlushOutcome> {
        if !self.config.enabled {
            return Err(FlushOutcome::Disabled);
        }
        if self.cancel.is_cancelled() {
            return Err(FlushOutcome::ShutDown);
        }
        if self.flushing.swap(true, Ordering::AcqRel) {
            return Err(FlushOutcome::Busy);
        }
        let guard = FlushGuard(Arc::clone(self));

        let events = std::mem::take(&mut *lock(&self.queue));
        if events.is_empty() {
            return Err(FlushOutcome::Empty);
        }
        Ok((guard, EventBatch::new(events)))
    }

    async fn flush(self: &Arc<Self>) -> FlushOutcome {
        match self.begin_flush() {
            Ok((guard, batch)) => {
                let outcome = self.deliver(batch).await;
                drop(guard);
                outcome
            }
            Err(outcome) => outcome,
        }
    }

    /// Take the batch now and deliver it on the runtime
    fn spawn_flush(self: &Arc<Self>) {
        let (guard, batch) = match self.begin_flush() {
            Ok(claimed) => claimed,
            Err(outcome) => {
                tracing::trace!(?outcome, "Flush skipped");
                return;
            }
        };

        match &self.runtime {
            Some(runtime) => {
                let shared = Arc::clone(self);
                runtime.spawn(async move {
                    let outcome = shared.deliver(batch).await;
                    drop(guard);
                    tracing::debug!(?outcome, "Background flush finished");
                });
            }
            None => {
                tracing::error!(events = batch.len(), "No runtime to deliver batch, dropping");
            }
        }
    }

    /// First attempt of a batch; failures hand over to the retry task
    async fn deliver(self: &Arc<Self>, batch: EventBatch) -> FlushOutcome {
        let events = batch.len();
        let (state, error) = self.attempt(&batch, 0).await;
        match state {
            DeliveryState::Succeeded => FlushOutcome::Delivered(events),
            DeliveryState::RetryScheduled { .. } => {
                self.schedule_retry(batch, state);
                FlushOutcome::Retrying(events)
            }
            _ => {
                self.archive_batch(batch, state, error);
                FlushOutcome::Archived(events)
            }
        }
    }

    /// Send attempt `attempt` and return the state it leads to
    async fn attempt(&self, batch: &EventBatch, attempt: u32) -> (DeliveryState, Option<Error>) {
        let result = self.send(batch, attempt).await;
        let state = DeliveryState::Attempting { attempt }.next(&self.policy, result.is_ok());
        (state, result.err())
    }

    async fn send(&self, batch: &EventBatch, attempt: u32) -> Result<()> {
        let body = batch.to_json()?;
        self.bump(|s| s.api_calls += 1);

        match self.env.post_json(&self.endpoint, body).await {
            Ok(()) => {
                self.bump(|s| {
                    s.events_sent += batch.len();
                    s.batches_sent += 1;
                });
                tracing::info!(
                    session_id = %self.normalizer.session_id(),
                    events = batch.len(),
                    attempt,
                    "Sent event batch"
                );
                Ok(())
            }
            Err(e) => {
                self.bump(|s| s.api_failures += 1);
                tracing::warn!(
                    events = batch.len(),
                    attempt,
                    error = %e,
                    "Failed to send event batch"
                );
                Err(e)
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, batch: EventBatch, state: DeliveryState) {
        if self.cancel.is_cancelled() {
            tracing::warn!(events = batch.len(), "Publisher shut down, not retrying batch");
            return;
        }
        let Some(runtime) = &self.runtime else {
            return;
        };

        self.note_retry(&batch, state);
        let shared = Arc::clone(self);
        let pending = PendingRetry::new(Arc::clone(self));
        runtime.spawn(async move {
            shared.retry_loop(batch, state).await;
            drop(pending);
        });
    }

    fn note_retry(&self, batch: &EventBatch, state: DeliveryState) {
        if let DeliveryState::RetryScheduled { attempt, delay } = state {
            self.bump(|s| s.retries_scheduled += 1);
            tracing::debug!(
                events = batch.len(),
                failed_attempt = attempt,
                next_attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Scheduled retry"
            );
        }
    }

    /// Drive a batch from its first scheduled retry to a terminal state,
    /// stopping early on shutdown
    async fn retry_loop(self: &Arc<Self>, batch: EventBatch, mut state: DeliveryState) {
        let mut error = None;

        while !state.is_terminal() {
            let DeliveryState::RetryScheduled { delay, .. } = state else {
                break;
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::debug!(events = batch.len(), "Dropping pending retry on shutdown");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let DeliveryState::Attempting { attempt } = state.next(&self.policy, false) else {
                break;
            };
            (state, error) = self.attempt(&batch, attempt).await;
            self.note_retry(&batch, state);
        }

        self.archive_batch(batch, state, error);
    }

    /// Archive a batch that reached `Exhausted`; other states are ignored
    fn archive_batch(&self, batch: EventBatch, state: DeliveryState, error: Option<Error>) {
        let DeliveryState::Exhausted { attempts } = state else {
            return;
        };
        let last_error = error.map(|e| e.to_string()).unwrap_or_default();
        if self.cancel.is_cancelled() {
            tracing::warn!(events = batch.len(), "Publisher shut down, dropping exhausted batch");
            return;
        }

        tracing::error!(
            session_id = %self.normalizer.session_id(),
            events = batch.len(),
            attempts,
            error = %last_error,
            "Batch exhausted retries, archiving"
        );
        self.bump(|s| s.batches_archived += 1);
        self.archive.record(FailedBatch {
            batch,
            attempts,
            last_error,
            archived_at: Utc::now(),
        });
    }

    fn flush_sync(&self) -> FlushOutcome {
        if !self.config.enabled {
            return FlushOutcome::Disabled;
        }

        let events = std::mem::take(&mut *lock(&self.queue));
        if events.is_empty() {
            return FlushOutcome::Empty;
        }
        let batch = EventBatch::new(events);
        let count = batch.len();

        let body = match batch.to_json() {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(events = count, error = %e, "Failed to encode teardown batch");
                self.bump(|s| s.teardown_failures += 1);
                return FlushOutcome::Dropped(count);
            }
        };

        self.bump(|s| s.teardown_sends += 1);
        match self.env.send_beacon(&self.endpoint, &body) {
            Some(true) => {
                tracing::info!(events = count, "Queued event batch via beacon");
                return FlushOutcome::Delivered(count);
            }
            Some(false) => {
                tracing::debug!(events = count, "Beacon refused batch, sending synchronously");
            }
            None => {}
        }

        match self.env.post_json_blocking(&self.endpoint, &body) {
            Ok(()) => {
                tracing::info!(events = count, "Sent event batch synchronously");
                FlushOutcome::Delivered(count)
            }
            Err(e) => {
                self.bump(|s| s.teardown_failures += 1);
                tracing::warn!(events = count, error = %e, "Teardown send failed, events lost");
                FlushOutcome::Dropped(count)
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

/// Releases the flush slot when the owning flush ends
struct FlushGuard(Arc<Shared>);

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.0.flushing.store(false, Ordering::Release);
    }
}

/// Counts a retry task for as long as it lives
struct PendingRetry(Arc<Shared>);

impl PendingRetry {
    fn new(shared: Arc<Shared>) -> Self {
        shared.pending_retries.fetch_add(1, Ordering::AcqRel);
        Self(shared)
    }
}

impl Drop for PendingRetry {
    fn drop(&mut self) {
        self.0.pending_retries.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Periodic flush; exits on shutdown or once the publisher is gone
async fn run_timer(shared: Weak<Shared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(publisher) = shared.upgrade() else {
            break;
        };
        if lock(&publisher.queue).is_empty() {
            continue;
        }
        // Delivery runs on its own task so stopping the timer never cuts a send short
        publisher.spawn_flush();
    }
}

/// Lock a mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
