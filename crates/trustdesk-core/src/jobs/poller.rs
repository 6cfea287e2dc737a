//! Status polling for long-running agent runs.
//!
//! A `JobPoller` is one poll target: it follows at most one operation at a
//! time, sampling its status at a fixed interval until the backend reports a
//! terminal state, the caller cancels, or the poller is dropped. Query
//! failures are transient misses and never end the poll.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError};

use super::model::{JobHandle, OperationId, PollSnapshot, RunStatusResponse};

/// Default seconds between status samples
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where run status samples come from
pub trait RunStatusSource: Send + Sync + 'static {
    fn sample<'a>(&'a self, id: &'a OperationId) -> BoxFuture<'a, Result<RunStatusResponse, ApiError>>;
}

impl RunStatusSource for ApiClient {
    fn sample<'a>(&'a self, id: &'a OperationId) -> BoxFuture<'a, Result<RunStatusResponse, ApiError>> {
        self.fetch_run(id).boxed()
    }
}

impl<T: RunStatusSource + ?Sized> RunStatusSource for Arc<T> {
    fn sample<'a>(&'a self, id: &'a OperationId) -> BoxFuture<'a, Result<RunStatusResponse, ApiError>> {
        (**self).sample(id)
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The same operation is already being polled
    AlreadyActive,
    /// Another operation is still being polled; nothing was started
    Rejected { active: OperationId },
}

type SnapshotSender = Arc<watch::Sender<Option<PollSnapshot>>>;

struct ActivePoll {
    id: OperationId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct JobPoller<S> {
    source: Arc<S>,
    config: PollerConfig,
    snapshots: SnapshotSender,
    active: Mutex<Option<ActivePoll>>,
}

impl<S: RunStatusSource> JobPoller<S> {
    pub fn new(source: Arc<S>, config: PollerConfig) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            source,
            config,
            snapshots: Arc::new(tx),
            active: Mutex::new(None),
        }
    }

    fn is_live(&self, poll: &ActivePoll) -> bool {
        if poll.cancel.is_cancelled() || poll.task.is_finished() {
            return false;
        }
        self.snapshots
            .borrow()
            .as_ref()
            .is_some_and(|s| s.operation_id == poll.id && !s.is_finished())
    }

    /// Begin polling `id`.
    ///
    /// At most one operation is polled at a time: asking again for the one in
    /// flight is a no-op, asking for a different one is rejected until the
    /// current poll finishes or is cancelled.
    pub fn start(&self, id: OperationId) -> StartOutcome {
        let mut active = lock(&self.active);
        if let Some(poll) = active.as_ref() {
            if self.is_live(poll) {
                if poll.id == id {
                    debug!(operation = %id, "Poll already active");
                    return StartOutcome::AlreadyActive;
                }
                warn!(operation = %id, active = %poll.id, "Another poll is active, ignoring start");
                return StartOutcome::Rejected {
                    active: poll.id.clone(),
                };
            }
        }

        let job = JobHandle::new(id.clone());
        self.snapshots.send_replace(Some(job.snapshot()));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.source),
            job,
            Arc::clone(&self.snapshots),
            self.config.interval,
            cancel.clone(),
        ));

        info!(operation = %id, interval = ?self.config.interval, "Polling started");
        *active = Some(ActivePoll { id, cancel, task });
        StartOutcome::Started
    }

    /// Stop the current poll. The last snapshot is kept, marked cancelled.
    /// Returns false if nothing was being polled.
    pub fn cancel(&self) -> bool {
        let active = lock(&self.active);
        let Some(poll) = active.as_ref() else {
            return false;
        };
        if !self.is_live(poll) {
            return false;
        }

        poll.cancel.cancel();
        self.snapshots.send_modify(|current| {
            if let Some(snapshot) = current.as_mut() {
                if snapshot.operation_id == poll.id && !snapshot.is_finished() {
                    snapshot.cancelled = true;
                }
            }
        });
        info!(operation = %poll.id, "Polling cancelled");
        true
    }

    pub fn is_active(&self) -> bool {
        lock(&self.active)
            .as_ref()
            .is_some_and(|poll| self.is_live(poll))
    }

    pub fn snapshot(&self) -> Option<PollSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PollSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Resolve once the current poll is finished (terminal or cancelled).
    /// Returns immediately with `None` if nothing was ever started.
    pub async fn wait(&self) -> Option<PollSnapshot> {
        let mut rx = self.snapshots.subscribe();
        let finished = rx
            .wait_for(|s| s.as_ref().map_or(true, PollSnapshot::is_finished))
            .await;
        match finished {
            Ok(snapshot) => (*snapshot).clone(),
            Err(_) => None,
        }
    }
}

impl<S> Drop for JobPoller<S> {
    fn drop(&mut self) {
        if let Some(poll) = lock(&self.active).take() {
            poll.cancel.cancel();
        }
    }
}

async fn poll_loop<S: RunStatusSource>(
    source: Arc<S>,
    mut job: JobHandle,
    snapshots: SnapshotSender,
    interval: Duration,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    // First tick fires immediately.
    let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = source.sample(&job.id) => result,
        };

        let elapsed = started.elapsed().as_secs();
        match result {
            Ok(response) => {
                job.apply(&response, elapsed);
                debug!(operation = %job.id, status = %job.status, elapsed, "Status sampled");
            }
            Err(e) => {
                job.record_miss(elapsed);
                warn!(
                    operation = %job.id,
                    error = %e,
                    missed = job.missed_samples,
                    "Status query failed, retrying next tick"
                );
            }
        }

        let snapshot = job.snapshot();
        let published = snapshots.send_if_modified(|current| {
            if cancel.is_cancelled() {
                return false;
            }
            match current {
                Some(c) if c.operation_id == snapshot.operation_id && !c.is_finished() => {
                    *c = snapshot;
                    true
                }
                _ => false,
            }
        });
        if !published {
            break;
        }

        if job.is_terminal() {
            info!(
                operation = %job.id,
                status = %job.status,
                elapsed = job.elapsed_seconds,
                "Run finished, polling stopped"
            );
            break;
        }
    }
    debug!(operation = %job.id, "Poll loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobStatus;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<RunStatusResponse, ApiError>>>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<RunStatusResponse, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RunStatusSource for ScriptedSource {
        fn sample<'a>(&'a self, _id: &'a OperationId) -> BoxFuture<'a, Result<RunStatusResponse, ApiError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                // Once the script runs out the run stays in progress.
                lock(&self.responses)
                    .pop_front()
                    .unwrap_or_else(|| Ok(status("running")))
            }
            .boxed()
        }
    }

    fn status(value: &str) -> RunStatusResponse {
        RunStatusResponse {
            status: value.to_string(),
            output_data: None,
            error_message: None,
        }
    }

    fn poller(source: &Arc<ScriptedSource>) -> JobPoller<ScriptedSource> {
        JobPoller::new(Arc::clone(source), PollerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_completed() {
        let mut done = status("completed");
        done.output_data = json!({"evidence_count": 7}).as_object().cloned();
        let source = ScriptedSource::new(vec![Ok(status("running")), Ok(status("running")), Ok(done)]);
        let poller = poller(&source);

        assert_eq!(poller.start(OperationId::new("run-1")), StartOutcome::Started);
        let snapshot = poller.wait().await.expect("poll should finish");

        assert!(snapshot.is_complete);
        assert!(!snapshot.is_failed);
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.elapsed_seconds, 2 * DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(
            snapshot.output.as_ref().and_then(|o| o.get("evidence_count")),
            Some(&json!(7))
        );
        assert_eq!(source.calls(), 3);

        // No ticks after the terminal sample.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.calls(), 3);
        assert_eq!(poller.snapshot(), Some(snapshot));
        assert!(!poller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_surfaces_message() {
        let mut failed = status("failed");
        failed.error_message = Some("Connector timed out".to_string());
        let source = ScriptedSource::new(vec![Ok(status("pending")), Ok(failed)]);
        let poller = poller(&source);

        poller.start(OperationId::new("run-9"));
        let snapshot = poller.wait().await.expect("poll should finish");
        assert!(snapshot.is_failed);
        assert_eq!(snapshot.error_message.as_deref(), Some("Connector timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_failure_is_transient() {
        let source = ScriptedSource::new(vec![
            Err(ApiError::ServerError("503 Service Unavailable".to_string())),
            Ok(status("running")),
        ]);
        let poller = poller(&source);
        poller.start(OperationId::new("run-1"));

        // First sample happens immediately and fails.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = poller.snapshot().expect("snapshot");
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert_eq!(snapshot.missed_samples, 1);
        assert!(!snapshot.is_finished());
        assert!(poller.is_active());

        // Next sample at the normal interval.
        tokio::time::sleep(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)).await;
        let snapshot = poller.snapshot().expect("snapshot");
        assert_eq!(source.calls(), 2);
        assert_eq!(snapshot.status, JobStatus::Running);
        assert_eq!(snapshot.missed_samples, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_exclusive() {
        let source = ScriptedSource::new(vec![]);
        let poller = poller(&source);

        assert_eq!(poller.start(OperationId::new("run-1")), StartOutcome::Started);
        assert_eq!(poller.start(OperationId::new("run-1")), StartOutcome::AlreadyActive);
        assert_eq!(
            poller.start(OperationId::new("run-2")),
            StartOutcome::Rejected {
                active: OperationId::new("run-1")
            }
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls(), 1);
        assert_eq!(
            poller.snapshot().map(|s| s.operation_id),
            Some(OperationId::new("run-1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_never_overlap() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        let poller = poller(&source);
        poller.start(OperationId::new("run-1"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(source.calls() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_is_monotonic() {
        let source = ScriptedSource::new(vec![]);
        let poller = poller(&source);
        let mut updates = poller.subscribe();
        poller.start(OperationId::new("run-1"));

        let mut last = 0;
        for _ in 0..5 {
            updates.changed().await.expect("poller alive");
            let elapsed = updates
                .borrow_and_update()
                .as_ref()
                .map(|s| s.elapsed_seconds)
                .expect("snapshot");
            assert!(elapsed >= last);
            last = elapsed;
        }
        assert!(last > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_in_flight_sample() {
        let source = Arc::new(ScriptedSource {
            responses: Mutex::new(VecDeque::from([Ok(status("completed"))])),
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        let poller = poller(&source);
        poller.start(OperationId::new("run-1"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(poller.cancel());
        assert!(!poller.cancel());

        tokio::time::sleep(Duration::from_secs(20)).await;
        let snapshot = poller.snapshot().expect("snapshot retained");
        assert!(snapshot.cancelled);
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert!(!snapshot.is_complete);
        assert_eq!(source.calls(), 1);
        assert_eq!(poller.wait().await, Some(snapshot));

        // A new operation can be started after cancelling.
        assert_eq!(poller.start(OperationId::new("run-2")), StartOutcome::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_terminal() {
        let source = ScriptedSource::new(vec![Ok(status("completed"))]);
        let poller = poller(&source);
        poller.start(OperationId::new("run-1"));
        poller.wait().await;

        assert_eq!(poller.start(OperationId::new("run-2")), StartOutcome::Started);
        assert_eq!(
            poller.snapshot().map(|s| s.operation_id),
            Some(OperationId::new("run-2"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_polling() {
        let source = ScriptedSource::new(vec![]);
        let poller = poller(&source);
        poller.start(OperationId::new("run-1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls(), 1);

        drop(poller);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_wait_without_start() {
        let source = ScriptedSource::new(vec![]);
        let poller = poller(&source);
        assert!(poller.wait().await.is_none());
        assert!(!poller.cancel());
    }
}
