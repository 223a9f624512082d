//! Job Scheduler - owns the job table and the pending queue
//!
//! Jobs are admitted strictly in FIFO order while fewer than
//! `max_concurrent` are downloading. Every job that leaves the active set
//! triggers one admission pass, so the queue drains without polling.

use crate::aggregator::ProgressAggregator;
use crate::broadcast::{Broadcaster, Subscription, SubscriptionId};
use crate::engine::{
    default_template, PersistenceManager, ProcessRunner, ProgressObserver, Registration, Snapshot,
};
use crate::error::TubeqError;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tubeq_types::{DownloadRequest, Job, JobEvent, JobStatus, Progress, Settings};
use uuid::Uuid;

/// File name of the job snapshot inside the data directory
pub const JOBS_FILE: &str = "jobs.json";

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<Uuid, Job>,
    /// Job ids in creation order
    order: Vec<Uuid>,
    /// Pending job ids awaiting admission
    queue: VecDeque<Uuid>,
    /// Jobs currently holding a download slot
    active: HashSet<Uuid>,
}

impl QueueState {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            jobs: self
                .order
                .iter()
                .filter_map(|id| self.jobs.get(id).cloned())
                .collect(),
            queue: self.queue.iter().copied().collect(),
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active.is_empty()
    }
}

/// Handle to the download queue
///
/// Cloning is cheap; all clones share the same state.
pub struct JobScheduler {
    state: Arc<Mutex<QueueState>>,
    settings: Arc<Settings>,
    runner: Arc<ProcessRunner>,
    broadcaster: Arc<Broadcaster>,
    aggregator: Arc<ProgressAggregator>,
    persistence: Arc<PersistenceManager>,
    /// Signalled whenever a job leaves the queue or the active set
    changed: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
    /// Cancelled by `shutdown`; parent of every prefetch generation
    shutdown_token: CancellationToken,
    /// Stops the title lookups started since the last `clear_all`
    prefetch_token: Arc<Mutex<CancellationToken>>,
    /// Bounds concurrent title lookups by `max_concurrent`
    prefetch_slots: Arc<Semaphore>,
}

impl Clone for JobScheduler {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            settings: Arc::clone(&self.settings),
            runner: Arc::clone(&self.runner),
            broadcaster: Arc::clone(&self.broadcaster),
            aggregator: Arc::clone(&self.aggregator),
            persistence: Arc::clone(&self.persistence),
            changed: Arc::clone(&self.changed),
            shutting_down: Arc::clone(&self.shutting_down),
            shutdown_token: self.shutdown_token.clone(),
            prefetch_token: Arc::clone(&self.prefetch_token),
            prefetch_slots: Arc::clone(&self.prefetch_slots),
        }
    }
}

impl JobScheduler {
    /// Create an empty scheduler persisting to `snapshot_path`
    pub fn new(snapshot_path: impl Into<PathBuf>, settings: Settings) -> Self {
        let broadcaster = Arc::new(Broadcaster::new());
        let aggregator = Arc::new(ProgressAggregator::new(
            Arc::clone(&broadcaster),
            Duration::from_millis(settings.progress_interval_ms),
        ));
        let persistence = Arc::new(PersistenceManager::new(
            snapshot_path,
            Duration::from_millis(settings.save_debounce_ms),
        ));

        let shutdown_token = CancellationToken::new();
        let prefetch_token = shutdown_token.child_token();

        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            runner: Arc::new(ProcessRunner::new(&settings)),
            prefetch_slots: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            settings: Arc::new(settings),
            broadcaster,
            aggregator,
            persistence,
            changed: Arc::new(Notify::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_token,
            prefetch_token: Arc::new(Mutex::new(prefetch_token)),
        }
    }

    /// Open the scheduler for a data directory, restoring saved jobs
    pub async fn open(data_dir: &Path, settings: Settings) -> Result<Self, TubeqError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let scheduler = Self::new(data_dir.join(JOBS_FILE), settings);
        scheduler.restore().await;
        Ok(scheduler)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Load the snapshot and resume pending work
    ///
    /// Returns the number of jobs restored.
    pub async fn restore(&self) -> usize {
        let snapshot = self.persistence.load().await;
        let restored = snapshot.jobs.len();
        let queued = snapshot.queue.len();

        {
            let mut state = self.state.lock();
            for job in snapshot.jobs {
                if state.jobs.contains_key(&job.id) {
                    continue;
                }
                state.order.push(job.id);
                state.jobs.insert(job.id, job);
            }
            for id in snapshot.queue {
                if !state.queue.contains(&id) {
                    state.queue.push_back(id);
                }
            }
        }

        info!("Restored {} jobs, {} pending", restored, queued);
        self.process_queue();
        restored
    }

    // ========================================================================
    // Job Operations
    // ========================================================================

    /// Create a job and queue it
    pub fn submit(&self, request: DownloadRequest) -> Result<Uuid, TubeqError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(TubeqError::InvalidOperation(
                "Scheduler is shutting down".to_string(),
            ));
        }
        let job = prepare_job(request)?;
        let kind = job.kind;
        let id = job.id;
        let url = job.url.clone();

        let snapshot = {
            let mut state = self.state.lock();
            state.order.push(id);
            state.queue.push_back(id);
            state.jobs.insert(id, job.clone());
            state.snapshot()
        };

        info!("Queued {:?} job {} for {}", kind, id, url);
        self.broadcaster.publish(JobEvent::Added { job });
        self.save(snapshot);

        if self.settings.prefetch_metadata {
            self.prefetch_title(id, url);
        }

        self.process_queue();
        Ok(id)
    }

    /// Cancel a job
    ///
    /// Pending jobs are cancelled at once and never reach the tool. A
    /// downloading job's process is signalled; the job becomes cancelled when
    /// the process exits. Returns false for unknown or finished jobs.
    pub fn cancel(&self, id: Uuid) -> bool {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(job) = state.jobs.get_mut(&id) else {
                return false;
            };

            match job.status {
                JobStatus::Pending => {
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    state.queue.retain(|queued| *queued != id);
                    state.snapshot()
                }
                JobStatus::Downloading => {
                    return self.runner.cancel(id);
                }
                status => {
                    debug!("Job {} already {}, nothing to cancel", id, status);
                    return false;
                }
            }
        };

        info!("Cancelled pending job {}", id);
        self.broadcaster.publish(JobEvent::Cancelled { job_id: id });
        self.save(snapshot);
        self.changed.notify_waiters();
        true
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.state.lock().jobs.get(&id).cloned()
    }

    /// All jobs in creation order
    pub fn list_all(&self) -> Vec<Job> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    /// Cancel everything and forget every job
    ///
    /// Running processes keep their slot until they exit, so a job submitted
    /// right after still waits for the bound.
    pub fn clear_all(&self) {
        let signalled = {
            let mut state = self.state.lock();
            let signalled = self.runner.registry().cancel_all();
            state.jobs.clear();
            state.order.clear();
            state.queue.clear();
            signalled
        };

        let stale = std::mem::replace(
            &mut *self.prefetch_token.lock(),
            self.shutdown_token.child_token(),
        );
        stale.cancel();

        info!("Cleared all jobs ({} running processes signalled)", signalled);
        self.aggregator.clear();
        self.broadcaster.publish(JobEvent::Cleared);
        self.save(Snapshot::default());
        self.changed.notify_waiters();
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Pending job ids in admission order
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.state.lock().queue.iter().copied().collect()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        self.broadcaster.subscribe(job_id)
    }

    pub fn unsubscribe(&self, job_id: Uuid, id: SubscriptionId) -> bool {
        self.broadcaster.unsubscribe(job_id, id)
    }

    /// Events of every job
    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.broadcaster.subscribe_all()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Resolves once nothing is pending or downloading
    pub async fn wait_idle(&self) {
        self.wait_until(QueueState::is_idle).await;
    }

    /// Stop admitting work, terminate running processes and save state
    ///
    /// The snapshot is written before processes are signalled, so jobs that
    /// were downloading resume as pending on the next start.
    pub async fn shutdown(&self) -> Result<(), TubeqError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown_token.cancel();

        let snapshot = self.state.lock().snapshot();
        self.persistence.flush(&snapshot).await?;

        let signalled = self.runner.registry().cancel_all();
        info!("Shutting down, {} running processes signalled", signalled);

        self.wait_until(|state| state.active.is_empty()).await;
        Ok(())
    }

    async fn wait_until<F>(&self, condition: F)
    where
        F: Fn(&QueueState) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if condition(&*self.state.lock()) {
                return;
            }
            notified.await;
        }
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Admit pending jobs while slots are free
    fn process_queue(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let mut admitted: Vec<(Job, Registration)> = Vec::new();
        let snapshot = {
            let mut state = self.state.lock();
            while state.active.len() < self.settings.max_concurrent.max(1) {
                let Some(id) = state.queue.pop_front() else {
                    break;
                };
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                if job.status != JobStatus::Pending {
                    debug!("Skipping job {} dequeued as {}", id, job.status);
                    continue;
                }

                job.status = JobStatus::Downloading;
                job.started_at = Some(Utc::now());
                job.progress = Progress::default();
                let job = job.clone();

                state.active.insert(id);
                // Registered under the lock so clear_all and shutdown always see it
                admitted.push((job, self.runner.register(id)));
            }

            if admitted.is_empty() {
                return;
            }
            state.snapshot()
        };

        for (job, registration) in admitted {
            info!("Starting download {}", job.id);
            self.broadcaster.publish(JobEvent::Started { job_id: job.id });

            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_job(job, registration).await;
            });
        }

        self.save(snapshot);
    }

    async fn run_job(&self, job: Job, registration: Registration) {
        let observer = JobProgressObserver {
            state: Arc::clone(&self.state),
            aggregator: Arc::clone(&self.aggregator),
        };
        let result = self
            .runner
            .execute(&job, registration.token(), &observer)
            .await;
        drop(registration);

        self.finish_job(job.id, result);
    }

    /// Apply the terminal state of a job that held a slot
    fn finish_job(&self, id: Uuid, result: Result<Vec<String>, TubeqError>) {
        let (event, final_progress, snapshot) = {
            let mut state = self.state.lock();
            state.active.remove(&id);

            let outcome = match state.jobs.get_mut(&id) {
                Some(job) => apply_outcome(job, result),
                None => {
                    debug!("Job {} finished after being cleared", id);
                    None
                }
            };

            let (event, final_progress) = match outcome {
                Some((event, progress)) => (Some(event), progress),
                None => (None, None),
            };
            let snapshot = event.as_ref().map(|_| state.snapshot());
            (event, final_progress, snapshot)
        };

        match final_progress {
            Some(progress) => self.aggregator.finish(id, &progress),
            None => self.aggregator.reset(id),
        }
        if let Some(event) = event {
            self.broadcaster.publish(event);
        }
        if let Some(snapshot) = snapshot {
            self.save(snapshot);
        }

        self.process_queue();
        self.changed.notify_waiters();
    }

    fn save(&self, snapshot: Snapshot) {
        // State after shutdown begins is rebuilt from the flushed snapshot
        if !self.shutting_down.load(Ordering::SeqCst) {
            self.persistence.schedule_save(snapshot);
        }
    }

    /// Look up the title in the background
    ///
    /// Lookups share `max_concurrent` slots among themselves and stop on
    /// `clear_all` or `shutdown`. A failed lookup leaves the job untouched.
    fn prefetch_title(&self, id: Uuid, url: String) {
        let scheduler = self.clone();
        let token = self.prefetch_token.lock().clone();
        tokio::spawn(async move {
            let lookup = async {
                let _slot = scheduler.prefetch_slots.acquire().await.map_err(|_| {
                    TubeqError::InvalidOperation("metadata slots closed".to_string())
                })?;
                scheduler.runner.fetch_title(&url).await
            };

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Metadata lookup for job {} stopped", id);
                    return;
                }
                result = lookup => result,
            };

            match result {
                Ok(Some(title)) => {
                    let snapshot = {
                        let mut state = scheduler.state.lock();
                        let Some(job) = state.jobs.get_mut(&id) else {
                            return;
                        };
                        debug!("Job {} title: {}", id, title);
                        job.title = Some(title);
                        state.snapshot()
                    };
                    scheduler.save(snapshot);
                }
                Ok(None) => debug!("No title reported for job {}", id),
                Err(e) => warn!("Metadata lookup failed for job {}: {}", id, e),
            }
        });
    }
}

/// Move a downloading job to its terminal state
///
/// Returns the event to publish and, on success, the final progress.
fn apply_outcome(
    job: &mut Job,
    result: Result<Vec<String>, TubeqError>,
) -> Option<(JobEvent, Option<Progress>)> {
    let next = match &result {
        Ok(_) => JobStatus::Completed,
        Err(e) if e.is_cancelled() => JobStatus::Cancelled,
        Err(_) => JobStatus::Failed,
    };

    if !job.status.can_transition_to(next) {
        warn!(
            "Ignoring transition {} -> {} for job {}",
            job.status, next, job.id
        );
        return None;
    }

    job.status = next;
    job.completed_at = Some(Utc::now());

    match result {
        Ok(files) => {
            info!("Download {} completed ({} files)", job.id, files.len());
            job.files = files.clone();
            job.progress.percent = 100.0;
            job.progress.eta = None;
            Some((
                JobEvent::Completed {
                    job_id: job.id,
                    files,
                },
                Some(job.progress.clone()),
            ))
        }
        Err(TubeqError::Cancelled) => {
            info!("Download {} cancelled", job.id);
            Some((JobEvent::Cancelled { job_id: job.id }, None))
        }
        Err(e) => {
            let message = e.to_string();
            warn!("Download {} failed: {}", job.id, message);
            job.error = Some(message.clone());
            Some((
                JobEvent::Error {
                    job_id: job.id,
                    message,
                },
                None,
            ))
        }
    }
}

/// Validate a request and turn it into a pending job
///
/// An empty or missing output template falls back to the default for the
/// detected kind.
pub fn prepare_job(request: DownloadRequest) -> Result<Job, TubeqError> {
    validate_request(&request)?;

    let kind = request.detect_kind();
    let template = request
        .output_template
        .clone()
        .filter(|template| !template.trim().is_empty())
        .unwrap_or_else(|| default_template(kind).to_string());
    Ok(Job::new(request, template))
}

fn validate_request(request: &DownloadRequest) -> Result<(), TubeqError> {
    let parsed =
        url::Url::parse(&request.url).map_err(|_| TubeqError::InvalidUrl(request.url.clone()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(TubeqError::InvalidUrl(request.url.clone()));
    }

    let zero_item = request
        .playlist_items
        .iter()
        .flatten()
        .any(|index| *index == 0);
    let zero_key = request
        .item_formats
        .iter()
        .flat_map(|formats| formats.keys())
        .any(|index| *index == 0);
    if zero_item || zero_key {
        return Err(TubeqError::InvalidRequest(
            "Playlist item indices start at 1".to_string(),
        ));
    }

    Ok(())
}

/// Records progress on the job and forwards it to the throttled broadcaster
struct JobProgressObserver {
    state: Arc<Mutex<QueueState>>,
    aggregator: Arc<ProgressAggregator>,
}

impl ProgressObserver for JobProgressObserver {
    fn on_progress(&self, job_id: Uuid, progress: &Progress) {
        {
            let mut state = self.state.lock();
            match state.jobs.get_mut(&job_id) {
                Some(job) if job.status == JobStatus::Downloading => {
                    job.progress = progress.clone();
                }
                _ => return,
            }
        }
        self.aggregator.notify(job_id, progress);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{fake_tool, test_settings};
    use std::collections::BTreeMap;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    /// Fake tool that appends its url to `calls.log`, reports a file, then
    /// sleeps for `delay` seconds
    fn logging_tool(dir: &Path, delay: &str) -> PathBuf {
        let log = dir.join("calls.log");
        fake_tool(
            dir,
            &format!(
                r#"
for last; do :; done
echo "$last" >> "{log}"
echo "[download] Destination: /out/$(basename "$last").mp4"
echo "[download]  50.0% of 1.00MiB at 1.00MiB/s ETA 00:01"
sleep {delay}
echo "[download] 100.0% of 1.00MiB at 1.00MiB/s ETA 00:00"
"#,
                log = log.display(),
                delay = delay
            ),
        )
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn scheduler(dir: &Path, tool: &Path, max_concurrent: usize) -> JobScheduler {
        let mut settings = test_settings(dir, tool);
        settings.max_concurrent = max_concurrent;
        JobScheduler::new(dir.join(JOBS_FILE), settings)
    }

    async fn wait_for_status(scheduler: &JobScheduler, id: Uuid, status: JobStatus) {
        timeout(WAIT, async {
            while scheduler.get(id).map(|job| job.status) != Some(status) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach expected status");
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), Path::new("true"), 1);

        assert!(matches!(
            scheduler.submit(DownloadRequest::new("not a url")),
            Err(TubeqError::InvalidUrl(_))
        ));
        assert!(matches!(
            scheduler.submit(DownloadRequest::new("ftp://example.com/file")),
            Err(TubeqError::InvalidUrl(_))
        ));

        let mut request = DownloadRequest::new("https://example.com/playlist?list=x");
        request.playlist_items = Some(vec![0, 1]);
        assert!(matches!(
            scheduler.submit(request),
            Err(TubeqError::InvalidRequest(_))
        ));
        assert!(scheduler.list_all().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_never_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let tool = logging_tool(dir.path(), "0.3");
        let scheduler = scheduler(dir.path(), &tool, 2);
        let mut events = scheduler.subscribe_all();

        let ids: Vec<Uuid> = (0..5)
            .map(|i| {
                scheduler
                    .submit(DownloadRequest::new(format!("https://example.com/v/{}", i)))
                    .unwrap()
            })
            .collect();
        assert!(scheduler.active_count() <= 2);
        assert_eq!(scheduler.pending_ids().len(), 3);

        let mut running = 0usize;
        let mut peak = 0usize;
        let mut finished = 0usize;
        let mut started = Vec::new();
        timeout(WAIT, async {
            while finished < ids.len() {
                match events.recv().await.unwrap() {
                    JobEvent::Started { job_id } => {
                        started.push(job_id);
                        running += 1;
                        peak = peak.max(running);
                    }
                    event if event.is_terminal() => {
                        running -= 1;
                        finished += 1;
                    }
                    _ => {}
                }
                assert!(scheduler.active_count() <= 2);
            }
        })
        .await
        .unwrap();

        assert_eq!(peak, 2);
        scheduler.wait_idle().await;
        for id in &ids {
            let job = scheduler.get(*id).unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.progress.percent, 100.0);
        }
        // FIFO admission
        assert_eq!(started, ids);
        assert_eq!(calls(dir.path()).len(), 5);
    }

    #[tokio::test]
    async fn test_cancel_pending_job_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let tool = logging_tool(dir.path(), "0.3");
        let scheduler = scheduler(dir.path(), &tool, 1);

        let first = scheduler
            .submit(DownloadRequest::new("https://example.com/v/first"))
            .unwrap();
        let second = scheduler
            .submit(DownloadRequest::new("https://example.com/v/second"))
            .unwrap();
        let mut sub = scheduler.subscribe(second);

        assert!(scheduler.cancel(second));
        assert!(!scheduler.cancel(second));
        assert_eq!(sub.recv().await, Some(JobEvent::Cancelled { job_id: second }));
        assert!(scheduler.pending_ids().is_empty());

        timeout(WAIT, scheduler.wait_idle()).await.unwrap();
        assert_eq!(scheduler.get(first).unwrap().status, JobStatus::Completed);
        assert_eq!(scheduler.get(second).unwrap().status, JobStatus::Cancelled);
        assert_eq!(calls(dir.path()), vec!["https://example.com/v/first"]);
    }

    #[tokio::test]
    async fn test_cancel_downloading_job() {
        let dir = tempfile::tempdir().unwrap();
        let tool = logging_tool(dir.path(), "30");
        let scheduler = scheduler(dir.path(), &tool, 1);

        let id = scheduler
            .submit(DownloadRequest::new("https://example.com/v/slow"))
            .unwrap();
        let mut sub = scheduler.subscribe(id);
        wait_for_status(&scheduler, id, JobStatus::Downloading).await;

        // Wait until the process is producing output
        timeout(WAIT, async {
            while scheduler.get(id).unwrap().progress.percent < 50.0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(scheduler.cancel(id));
        wait_for_status(&scheduler, id, JobStatus::Cancelled).await;

        let job = scheduler.get(id).unwrap();
        assert!(job.error.is_none());
        assert_eq!(scheduler.active_count(), 0);

        let mut terminal = None;
        while let Some(event) = sub.try_recv() {
            if event.is_terminal() {
                terminal = Some(event);
            }
        }
        assert_eq!(terminal, Some(JobEvent::Cancelled { job_id: id }));
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            r#"
for last; do :; done
case "$last" in
  *bad*) echo "ERROR: video unavailable" >&2; exit 1 ;;
esac
echo "[download] Destination: /out/ok.mp4"
echo "[download] 100.0% of 1.00MiB at 1.00MiB/s ETA 00:00"
"#,
        );
        let scheduler = scheduler(dir.path(), &tool, 1);
        let mut events = scheduler.subscribe_all();

        let bad = scheduler
            .submit(DownloadRequest::new("https://example.com/v/bad"))
            .unwrap();
        let good = scheduler
            .submit(DownloadRequest::new("https://example.com/v/good"))
            .unwrap();
        timeout(WAIT, scheduler.wait_idle()).await.unwrap();

        let failed = scheduler.get(bad).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        let message = failed.error.unwrap();
        assert!(message.contains("code 1"), "{}", message);
        assert!(message.contains("video unavailable"), "{}", message);

        let done = scheduler.get(good).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.files, vec!["ok.mp4"]);

        let mut bad_events = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.job_id() == Some(bad) {
                bad_events.push(event);
            }
        }
        assert!(matches!(bad_events.first(), Some(JobEvent::Added { .. })));
        assert_eq!(bad_events[1], JobEvent::Started { job_id: bad });
        assert!(matches!(bad_events.last(), Some(JobEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_event_order_for_completed_job() {
        let dir = tempfile::tempdir().unwrap();
        let tool = logging_tool(dir.path(), "0");
        let scheduler = scheduler(dir.path(), &tool, 1);
        let mut events = scheduler.subscribe_all();

        let id = scheduler
            .submit(DownloadRequest::new("https://example.com/v/clip"))
            .unwrap();
        timeout(WAIT, scheduler.wait_idle()).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(JobEvent::Added { job }) if job.id == id));
        assert_eq!(seen[1], JobEvent::Started { job_id: id });
        assert_eq!(
            seen.last(),
            Some(&JobEvent::Completed {
                job_id: id,
                files: vec!["clip.mp4".to_string()],
            })
        );
        // The final progress precedes the terminal event and reports 100%
        match &seen[seen.len() - 2] {
            JobEvent::Progress { progress, .. } => assert_eq!(progress.percent, 100.0),
            other => panic!("expected progress, got {:?}", other),
        }
    }

    /// Collect global events of `id` until its terminal event
    async fn events_until_terminal(
        events: &mut broadcast::Receiver<JobEvent>,
        id: Uuid,
    ) -> Vec<JobEvent> {
        let mut seen = Vec::new();
        timeout(WAIT, async {
            loop {
                let event = events.recv().await.unwrap();
                if event.job_id() != Some(id) {
                    continue;
                }
                let terminal = event.is_terminal();
                seen.push(event);
                if terminal {
                    break;
                }
            }
        })
        .await
        .expect("no terminal event");
        seen
    }

    fn progress_events(events: &[JobEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, JobEvent::Progress { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_failure_event_skips_progress_throttle() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            r#"
echo "[download] Destination: /out/clip.mp4"
for p in 10.0 20.0 30.0 40.0; do
  echo "[download]  $p% of 1.00MiB at 1.00MiB/s ETA 00:01"
done
echo "ERROR: connection reset" >&2
exit 1
"#,
        );
        let mut settings = test_settings(dir.path(), &tool);
        settings.progress_interval_ms = 10_000;
        let scheduler = JobScheduler::new(dir.path().join(JOBS_FILE), settings);
        let mut events = scheduler.subscribe_all();

        let started = tokio::time::Instant::now();
        let id = scheduler
            .submit(DownloadRequest::new("https://example.com/v/flaky"))
            .unwrap();
        let seen = events_until_terminal(&mut events, id).await;

        // Well inside one throttle window
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(progress_events(&seen), 1, "{:?}", seen);
        assert!(matches!(seen.last(), Some(JobEvent::Error { .. })));
        assert_eq!(scheduler.get(id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_event_skips_progress_throttle() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            r#"
for p in 10.0 20.0 30.0 40.0; do
  echo "[download]  $p% of 1.00MiB at 1.00MiB/s ETA 00:01"
done
sleep 30
"#,
        );
        let mut settings = test_settings(dir.path(), &tool);
        settings.progress_interval_ms = 10_000;
        let scheduler = JobScheduler::new(dir.path().join(JOBS_FILE), settings);
        let mut events = scheduler.subscribe_all();

        let id = scheduler
            .submit(DownloadRequest::new("https://example.com/v/slow"))
            .unwrap();
        timeout(WAIT, async {
            while scheduler.get(id).unwrap().progress.percent < 40.0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let cancelled_at = tokio::time::Instant::now();
        assert!(scheduler.cancel(id));
        let seen = events_until_terminal(&mut events, id).await;

        assert!(cancelled_at.elapsed() < Duration::from_secs(5));
        assert_eq!(progress_events(&seen), 1, "{:?}", seen);
        assert_eq!(seen.last(), Some(&JobEvent::Cancelled { job_id: id }));
    }

    #[tokio::test]
    async fn test_failed_title_lookup_does_not_stop_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let lookups = dir.path().join("lookups.log");
        let tool = fake_tool(
            dir.path(),
            &format!(
                r#"
for arg; do
  if [ "$arg" = "--skip-download" ]; then
    echo lookup >> "{lookups}"
    echo "ERROR: metadata unavailable" >&2
    exit 1
  fi
done
for last; do :; done
echo "$last" >> "{log}"
echo "[download] Destination: /out/clip.mp4"
echo "[download] 100.0% of 1.00MiB at 1.00MiB/s ETA 00:00"
"#,
                lookups = lookups.display(),
                log = dir.path().join("calls.log").display()
            ),
        );
        let mut settings = test_settings(dir.path(), &tool);
        settings.prefetch_metadata = true;
        let scheduler = JobScheduler::new(dir.path().join(JOBS_FILE), settings);

        let id = scheduler
            .submit(DownloadRequest::new("https://example.com/v/clip"))
            .unwrap();
        timeout(WAIT, scheduler.wait_idle()).await.unwrap();
        timeout(WAIT, async {
            while !lookups.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let job = scheduler.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.files, vec!["clip.mp4"]);
        assert!(job.title.is_none());
        assert_eq!(calls(dir.path()), vec!["https://example.com/v/clip"]);
    }

    #[tokio::test]
    async fn test_title_lookups_are_bounded_and_stop_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let lookups = dir.path().join("lookups.log");
        let tool = fake_tool(
            dir.path(),
            &format!(
                r#"
for arg; do
  if [ "$arg" = "--skip-download" ]; then
    echo started >> "{lookups}"
    sleep 2
    echo finished >> "{lookups}"
    echo "Late Title"
    exit 0
  fi
done
echo "[download] Destination: /out/clip.mp4"
echo "[download] 100.0% of 1.00MiB at 1.00MiB/s ETA 00:00"
"#,
                lookups = lookups.display()
            ),
        );
        let mut settings = test_settings(dir.path(), &tool);
        settings.prefetch_metadata = true;
        settings.max_concurrent = 1;
        let scheduler = JobScheduler::new(dir.path().join(JOBS_FILE), settings);

        let ids: Vec<Uuid> = (0..3)
            .map(|i| {
                scheduler
                    .submit(DownloadRequest::new(format!("https://example.com/v/{i}")))
                    .unwrap()
            })
            .collect();
        timeout(WAIT, scheduler.wait_idle()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let lookup_log = || std::fs::read_to_string(&lookups).unwrap_or_default();
        assert_eq!(lookup_log(), "started\n");

        timeout(WAIT, scheduler.shutdown()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        // The running lookup was killed and the queued ones never started
        assert_eq!(lookup_log(), "started\n");
        for id in ids {
            assert!(scheduler.get(id).unwrap().title.is_none());
        }
    }

    #[tokio::test]
    async fn test_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let tool = logging_tool(dir.path(), "30");
        let scheduler = scheduler(dir.path(), &tool, 1);

        let running = scheduler
            .submit(DownloadRequest::new("https://example.com/v/a"))
            .unwrap();
        scheduler
            .submit(DownloadRequest::new("https://example.com/v/b"))
            .unwrap();
        let mut sub = scheduler.subscribe(running);
        wait_for_status(&scheduler, running, JobStatus::Downloading).await;

        scheduler.clear_all();
        assert!(scheduler.list_all().is_empty());
        assert!(scheduler.pending_ids().is_empty());

        let mut last = None;
        while let Some(event) = sub.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(JobEvent::Cleared));

        timeout(WAIT, scheduler.wait_idle()).await.unwrap();
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(calls(dir.path()), vec!["https://example.com/v/a"]);
    }

    #[tokio::test]
    async fn test_restore_resumes_interrupted_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let tool = logging_tool(dir.path(), "0");

        let mut interrupted = Job::new(
            DownloadRequest::new("https://example.com/v/interrupted"),
            "%(title)s.%(ext)s".to_string(),
        );
        interrupted.status = JobStatus::Downloading;
        interrupted.started_at = Some(Utc::now());
        let mut finished = Job::new(
            DownloadRequest::new("https://example.com/v/finished"),
            "%(title)s.%(ext)s".to_string(),
        );
        finished.status = JobStatus::Completed;
        let snapshot = Snapshot {
            jobs: vec![interrupted.clone(), finished.clone()],
            queue: vec![],
        };
        std::fs::write(
            dir.path().join(JOBS_FILE),
            serde_json::to_vec(&snapshot).unwrap(),
        )
        .unwrap();

        let scheduler = JobScheduler::open(dir.path(), test_settings(dir.path(), &tool))
            .await
            .unwrap();
        timeout(WAIT, scheduler.wait_idle()).await.unwrap();

        assert_eq!(
            scheduler.get(interrupted.id).unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(
            scheduler.get(finished.id).unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(calls(dir.path()), vec!["https://example.com/v/interrupted"]);
        let ids: Vec<Uuid> = scheduler.list_all().iter().map(|job| job.id).collect();
        assert_eq!(ids, vec![interrupted.id, finished.id]);
    }

    #[tokio::test]
    async fn test_shutdown_persists_running_jobs_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let tool = logging_tool(dir.path(), "30");
        let scheduler = scheduler(dir.path(), &tool, 1);

        let id = scheduler
            .submit(DownloadRequest::new("https://example.com/v/long"))
            .unwrap();
        wait_for_status(&scheduler, id, JobStatus::Downloading).await;

        timeout(WAIT, scheduler.shutdown()).await.unwrap().unwrap();
        assert_eq!(scheduler.active_count(), 0);
        assert!(scheduler.submit(DownloadRequest::new("https://example.com/v/x")).is_err());

        let reloaded = PersistenceManager::new(dir.path().join(JOBS_FILE), Duration::from_millis(10))
            .load()
            .await;
        assert_eq!(reloaded.queue, vec![id]);
        assert_eq!(reloaded.jobs[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_per_item_job_through_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            r#"
item=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--playlist-items" ]; then item="$2"; fi
  shift
done
echo "[download] Destination: /out/track-$item.m4a"
echo "[download] 100.0% of 1.00MiB at 1.00MiB/s ETA 00:00"
"#,
        );
        let scheduler = scheduler(dir.path(), &tool, 1);

        let mut request = DownloadRequest::new("https://example.com/playlist?list=abc");
        request.item_formats = Some(BTreeMap::from([
            (2, "bestaudio".to_string()),
            (5, "worstaudio".to_string()),
        ]));
        let id = scheduler.submit(request).unwrap();
        timeout(WAIT, scheduler.wait_idle()).await.unwrap();

        let job = scheduler.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.files, vec!["track-2.m4a", "track-5.m4a"]);
        assert_eq!(job.output_template, crate::engine::PLAYLIST_TEMPLATE);
    }
}
