//! Snapshot persistence for the job table
//!
//! The whole table and the pending queue are written as one JSON document.
//! Writes go to a temporary file that is renamed over the snapshot, so a
//! crash mid-write leaves the previous snapshot intact.

use crate::engine::Debouncer;
use crate::error::TubeqError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tubeq_types::{Job, JobStatus, Progress};
use uuid::Uuid;

/// Persisted state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub queue: Vec<Uuid>,
}

impl Snapshot {
    pub fn job(&self, id: Uuid) -> Result<&Job, TubeqError> {
        self.jobs
            .iter()
            .find(|job| job.id == id)
            .ok_or(TubeqError::NotFound(id))
    }

    pub fn job_mut(&mut self, id: Uuid) -> Result<&mut Job, TubeqError> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(TubeqError::NotFound(id))
    }
}

struct SnapshotWriter {
    path: PathBuf,
    /// Generation handed to the most recent save request
    generation: AtomicU64,
    /// Holds the generation last written to disk
    write_lock: tokio::sync::Mutex<u64>,
    writes: AtomicUsize,
}

impl SnapshotWriter {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn write(&self, snapshot: &Snapshot, generation: u64) -> Result<(), TubeqError> {
        let mut written = self.write_lock.lock().await;
        if generation <= *written {
            debug!("Skipping stale snapshot generation {}", generation);
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec_pretty(snapshot)?;
        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        *written = generation;
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Saved {} jobs ({} queued) to {:?}",
            snapshot.jobs.len(),
            snapshot.queue.len(),
            self.path
        );
        Ok(())
    }
}

pub struct PersistenceManager {
    writer: Arc<SnapshotWriter>,
    debouncer: Debouncer,
}

impl PersistenceManager {
    pub fn new(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            writer: Arc::new(SnapshotWriter {
                path: path.into(),
                generation: AtomicU64::new(0),
                write_lock: tokio::sync::Mutex::new(0),
                writes: AtomicUsize::new(0),
            }),
            debouncer: Debouncer::new(debounce),
        }
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }

    /// Number of snapshot writes completed so far
    pub fn write_count(&self) -> usize {
        self.writer.writes.load(Ordering::SeqCst)
    }

    /// Load and normalize the snapshot
    ///
    /// Missing or empty files yield empty state. An unreadable document is
    /// copied aside as a backup and also yields empty state. Jobs that were
    /// downloading come back as pending, and the queue is rebuilt so it holds
    /// every pending job exactly once.
    pub async fn load(&self) -> Snapshot {
        let path = &self.writer.path;
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {:?}, starting empty", path);
                return Snapshot::default();
            }
            Err(e) => {
                error!("Failed to read snapshot {:?}: {}", path, e);
                return Snapshot::default();
            }
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            return Snapshot::default();
        }

        match serde_json::from_slice::<Snapshot>(&data) {
            Ok(snapshot) => normalize(snapshot),
            Err(e) => {
                let backup = backup_path(path);
                warn!(
                    "Snapshot {:?} is unreadable ({}), backing up to {:?}",
                    path, e, backup
                );
                if let Err(e) = tokio::fs::copy(path, &backup).await {
                    error!("Failed to back up snapshot: {}", e);
                }
                Snapshot::default()
            }
        }
    }

    /// Write the snapshot after the debounce period
    ///
    /// Scheduling again before the period ends replaces this snapshot.
    pub fn schedule_save(&self, snapshot: Snapshot) {
        let writer = Arc::clone(&self.writer);
        let generation = writer.next_generation();
        self.debouncer.arm(async move {
            if let Err(e) = writer.write(&snapshot, generation).await {
                error!("Failed to save snapshot: {}", e);
            }
        });
    }

    /// Drop any scheduled save and write `snapshot` now
    ///
    /// A debounced write that already started and finishes later is
    /// discarded, so the flushed snapshot is never overwritten by older state.
    pub async fn flush(&self, snapshot: &Snapshot) -> Result<(), TubeqError> {
        self.debouncer.cancel();
        let generation = self.writer.next_generation();
        self.writer.write(snapshot, generation).await
    }

    pub fn has_pending_save(&self) -> bool {
        self.debouncer.is_armed()
    }
}

fn normalize(mut snapshot: Snapshot) -> Snapshot {
    let mut requeued = 0;
    for job in snapshot.jobs.iter_mut() {
        if job.status == JobStatus::Downloading {
            job.status = JobStatus::Pending;
            job.started_at = None;
            job.progress = Progress::default();
            requeued += 1;
        }
    }

    let pending: HashSet<Uuid> = snapshot
        .jobs
        .iter()
        .filter(|job| job.status == JobStatus::Pending)
        .map(|job| job.id)
        .collect();

    let mut seen = HashSet::new();
    let mut queue: Vec<Uuid> = snapshot
        .queue
        .iter()
        .copied()
        .filter(|id| pending.contains(id) && seen.insert(*id))
        .collect();

    let mut missing: Vec<&Job> = snapshot
        .jobs
        .iter()
        .filter(|job| job.status == JobStatus::Pending && !seen.contains(&job.id))
        .collect();
    missing.sort_by_key(|job| job.created_at);
    queue.extend(missing.into_iter().map(|job| job.id));

    if requeued > 0 {
        info!("Requeued {} interrupted downloads", requeued);
    }

    snapshot.queue = queue;
    snapshot
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.bak", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tubeq_types::DownloadRequest;

    fn job(status: JobStatus) -> Job {
        let mut job = Job::new(
            DownloadRequest::new("https://example.com/v/1"),
            "%(title)s.%(ext)s".to_string(),
        );
        job.status = status;
        job
    }

    #[tokio::test]
    async fn test_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let manager = PersistenceManager::new(&path, Duration::from_millis(10));

        assert_eq!(manager.load().await, Snapshot::default());

        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(manager.load().await, Snapshot::default());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{ not json").unwrap();
        let manager = PersistenceManager::new(&path, Duration::from_millis(10));

        assert_eq!(manager.load().await, Snapshot::default());

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("jobs.json.") && name.ends_with(".bak"))
            .collect();
        assert_eq!(backups.len(), 1);
        let backup = std::fs::read_to_string(dir.path().join(&backups[0])).unwrap();
        assert_eq!(backup, "{ not json");
    }

    #[tokio::test]
    async fn test_load_requeues_interrupted_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let mut interrupted = job(JobStatus::Downloading);
        interrupted.started_at = Some(Utc::now());
        interrupted.progress.percent = 40.0;
        let mut queued = job(JobStatus::Pending);
        queued.created_at = interrupted.created_at + ChronoDuration::seconds(1);
        let mut forgotten = job(JobStatus::Pending);
        forgotten.created_at = interrupted.created_at - ChronoDuration::seconds(1);
        let done = job(JobStatus::Completed);

        let snapshot = Snapshot {
            jobs: vec![
                forgotten.clone(),
                interrupted.clone(),
                queued.clone(),
                done.clone(),
            ],
            // Duplicate and terminal ids are dropped
            queue: vec![queued.id, queued.id, done.id],
        };
        let manager = PersistenceManager::new(&path, Duration::from_millis(10));
        tokio_test::assert_ok!(manager.flush(&snapshot).await);

        let loaded = manager.load().await;
        assert_eq!(loaded.queue, vec![queued.id, forgotten.id, interrupted.id]);

        let restored = loaded
            .jobs
            .iter()
            .find(|j| j.id == interrupted.id)
            .unwrap();
        assert_eq!(restored.status, JobStatus::Pending);
        assert!(restored.started_at.is_none());
        assert_eq!(restored.progress.percent, 0.0);
        assert_eq!(
            loaded.jobs.iter().find(|j| j.id == done.id).unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_job_lookup_reports_missing_id() {
        let mut snapshot = Snapshot {
            jobs: vec![job(JobStatus::Pending)],
            queue: vec![],
        };
        let known = snapshot.jobs[0].id;
        let unknown = Uuid::new_v4();

        assert_eq!(tokio_test::assert_ok!(snapshot.job(known)).id, known);
        snapshot.job_mut(known).unwrap().status = JobStatus::Cancelled;
        assert_eq!(snapshot.jobs[0].status, JobStatus::Cancelled);

        let err = snapshot.job(unknown).unwrap_err();
        assert!(matches!(err, TubeqError::NotFound(id) if id == unknown));
        assert_eq!(err.to_string(), format!("Job not found: {}", unknown));
        assert!(matches!(
            snapshot.job_mut(unknown),
            Err(TubeqError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_saves_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let manager = PersistenceManager::new(&path, Duration::from_millis(1000));

        let mut last = Snapshot::default();
        for _ in 0..10 {
            last.jobs.push(job(JobStatus::Pending));
            manager.schedule_save(last.clone());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(manager.write_count(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        // File IO runs on the blocking pool; poll until the write lands
        for _ in 0..200 {
            if manager.write_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(manager.write_count(), 1);
        let saved: Snapshot = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved.jobs.len(), 10);
    }
}
