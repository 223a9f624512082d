//! Process runner - drives the external download tool for one job
//!
//! One process per job, or one process per playlist item when items carry
//! their own format selector. Output lines from stdout and stderr are fed to
//! an [`OutputTracker`] and every change is reported to a [`ProgressObserver`].

use crate::aggregator::overall_percent;
use crate::engine::{OutputTracker, ProcessRegistry, Registration};
use crate::error::TubeqError;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tubeq_types::{Job, JobKind, Progress, Settings};
use uuid::Uuid;

/// Default output template for single videos
pub const VIDEO_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Default output template for playlists
pub const PLAYLIST_TEMPLATE: &str = "%(playlist_title)s/%(playlist_index)s - %(title)s.%(ext)s";

pub fn default_template(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Video => VIDEO_TEMPLATE,
        JobKind::Playlist => PLAYLIST_TEMPLATE,
    }
}

/// Receives job-level progress while a job executes
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, job_id: Uuid, progress: &Progress);
}

/// Spawns and supervises download tool processes
#[derive(Debug)]
pub struct ProcessRunner {
    tool_path: String,
    extra_args: Vec<String>,
    download_dir: PathBuf,
    speed_window: usize,
    metadata_timeout: Duration,
    registry: Arc<ProcessRegistry>,
}

impl ProcessRunner {
    pub fn new(settings: &Settings) -> Self {
        Self {
            tool_path: settings.tool_path.clone(),
            extra_args: settings.extra_args.clone(),
            download_dir: settings.download_dir.clone(),
            speed_window: settings.speed_window,
            metadata_timeout: Duration::from_secs(settings.metadata_timeout_secs),
            registry: Arc::new(ProcessRegistry::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Register a job so it can be cancelled while it runs
    pub fn register(&self, job_id: Uuid) -> Registration {
        self.registry.register(job_id)
    }

    /// Cancel a running job; false when nothing is registered under the id
    pub fn cancel(&self, job_id: Uuid) -> bool {
        self.registry.cancel(job_id)
    }

    /// Full output template passed to the tool
    pub fn output_path(&self, job: &Job) -> String {
        self.download_dir
            .join(&job.output_template)
            .to_string_lossy()
            .to_string()
    }

    /// Build the tool's argument list
    pub fn build_args(&self, job: &Job, format: Option<&str>, items: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-colors".to_string(),
            "-o".to_string(),
            self.output_path(job),
        ];
        if let Some(format) = format {
            args.push("-f".to_string());
            args.push(format.to_string());
        }
        if let Some(items) = items {
            args.push("--playlist-items".to_string());
            args.push(items.to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(job.url.clone());
        args
    }

    /// Execute a job and return the produced file names
    pub async fn execute(
        &self,
        job: &Job,
        token: &CancellationToken,
        observer: &dyn ProgressObserver,
    ) -> Result<Vec<String>, TubeqError> {
        if token.is_cancelled() {
            return Err(TubeqError::Cancelled);
        }

        if job.is_per_item() {
            self.execute_per_item(job, token, observer).await
        } else {
            self.execute_whole(job, token, observer).await
        }
    }

    async fn execute_whole(
        &self,
        job: &Job,
        token: &CancellationToken,
        observer: &dyn ProgressObserver,
    ) -> Result<Vec<String>, TubeqError> {
        let items = job
            .playlist_items
            .as_ref()
            .filter(|items| !items.is_empty())
            .map(|items| join_items(items));
        let args = self.build_args(job, job.format.as_deref(), items.as_deref());

        let tracker = self
            .run_process(job.id, &args, token, |tracker| {
                observer.on_progress(job.id, &whole_job_progress(tracker.progress()));
            })
            .await?;

        Ok(tracker.into_files())
    }

    /// Run each playlist item as its own process with its own format
    ///
    /// A failed item is logged and skipped; the denominator stays the item
    /// count captured here, so skipped items still count towards it.
    async fn execute_per_item(
        &self,
        job: &Job,
        token: &CancellationToken,
        observer: &dyn ProgressObserver,
    ) -> Result<Vec<String>, TubeqError> {
        let items = job.per_item_indices();
        let total = items.len();
        let mut files = Vec::new();
        let mut failed = 0;
        let mut last_error = String::new();

        for (position, index) in items.iter().enumerate() {
            if token.is_cancelled() {
                return Err(TubeqError::Cancelled);
            }

            info!(
                "Job {}: item {} ({}/{}) with format {:?}",
                job.id,
                index,
                position + 1,
                total,
                job.format_for_item(*index)
            );

            let item = index.to_string();
            let args = self.build_args(job, job.format_for_item(*index), Some(&item));
            let result = self
                .run_process(job.id, &args, token, |tracker| {
                    let progress = item_progress(tracker.progress(), position, total);
                    observer.on_progress(job.id, &progress);
                })
                .await;

            match result {
                Ok(tracker) => files.extend(tracker.into_files()),
                Err(TubeqError::Cancelled) => return Err(TubeqError::Cancelled),
                Err(e) => {
                    warn!("Job {}: item {} failed, skipping: {}", job.id, index, e);
                    failed += 1;
                    last_error = e.to_string();
                }
            }
        }

        if total > 0 && failed == total {
            return Err(TubeqError::ItemsFailed {
                total,
                last: last_error,
            });
        }

        Ok(files)
    }

    /// Spawn one tool process and follow it until it exits
    async fn run_process<F>(
        &self,
        job_id: Uuid,
        args: &[String],
        token: &CancellationToken,
        mut on_update: F,
    ) -> Result<OutputTracker, TubeqError>
    where
        F: FnMut(&OutputTracker),
    {
        debug!("Job {}: {} {}", job_id, self.tool_path, args.join(" "));

        let mut child = Command::new(&self.tool_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TubeqError::ToolInvocation {
                tool: self.tool_path.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TubeqError::InvalidOperation("tool stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TubeqError::InvalidOperation("tool stderr not captured".to_string()))?;

        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut tracker = OutputTracker::new(self.speed_window);

        // Lines are read as bytes; a line that is not valid UTF-8 must not stop
        // the pipe from being drained.
        while stdout_open || stderr_open {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return terminate(child, job_id, tracker).await;
                }
                read = stdout.read_until(b'\n', &mut out_buf), if stdout_open => {
                    stdout_open = feed_line(read, &mut out_buf, &mut tracker, &mut on_update, job_id, "stdout");
                }
                read = stderr.read_until(b'\n', &mut err_buf), if stderr_open => {
                    stderr_open = feed_line(read, &mut err_buf, &mut tracker, &mut on_update, job_id, "stderr");
                }
            }
        }

        let status = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return terminate(child, job_id, tracker).await;
            }
            status = child.wait() => status?,
        };

        exit_outcome(status, token.is_cancelled(), tracker)
    }

    /// Best-effort title lookup used when a job is submitted
    pub async fn fetch_title(&self, url: &str) -> Result<Option<String>, TubeqError> {
        let mut command = Command::new(&self.tool_path);
        command
            .args([
                "--skip-download",
                "--no-warnings",
                "--print",
                "title",
                "--playlist-items",
                "1",
                url,
            ])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.metadata_timeout, command.output())
            .await
            .map_err(|_| TubeqError::Timeout)?
            .map_err(|source| TubeqError::ToolInvocation {
                tool: self.tool_path.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TubeqError::ToolFailed {
                code: output.status.code().unwrap_or(-1),
                message: None,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string))
    }
}

/// Kill a process after cancellation and reap it
async fn terminate(
    mut child: Child,
    job_id: Uuid,
    tracker: OutputTracker,
) -> Result<OutputTracker, TubeqError> {
    if let Err(e) = child.start_kill() {
        debug!("Job {}: kill failed (already exited?): {}", job_id, e);
    }
    match child.wait().await {
        Ok(status) if status.success() => {
            info!("Job {}: cancel arrived after the tool finished", job_id);
            Ok(tracker)
        }
        Ok(_) => {
            info!("Job {}: process terminated after cancellation", job_id);
            Err(TubeqError::Cancelled)
        }
        Err(e) => {
            warn!("Job {}: failed to reap cancelled process: {}", job_id, e);
            Err(TubeqError::Cancelled)
        }
    }
}

/// Map a collected exit status to the run result
///
/// A zero exit wins over a late cancel: the files are already on disk.
fn exit_outcome(
    status: ExitStatus,
    cancelled: bool,
    tracker: OutputTracker,
) -> Result<OutputTracker, TubeqError> {
    if status.success() {
        Ok(tracker)
    } else if cancelled {
        Err(TubeqError::Cancelled)
    } else {
        Err(TubeqError::ToolFailed {
            code: status.code().unwrap_or(-1),
            message: tracker.last_error().map(str::to_string),
        })
    }
}

/// Handle one `read_until` result; returns whether the stream is still open
fn feed_line<F>(
    read: std::io::Result<usize>,
    buf: &mut Vec<u8>,
    tracker: &mut OutputTracker,
    on_update: &mut F,
    job_id: Uuid,
    stream: &str,
) -> bool
where
    F: FnMut(&OutputTracker),
{
    match read {
        Ok(0) => false,
        Ok(_) => {
            let line = String::from_utf8_lossy(buf);
            if tracker.feed(line.trim_end_matches(['\r', '\n'])) {
                on_update(tracker);
            }
            buf.clear();
            true
        }
        Err(e) => {
            warn!("Job {}: failed reading tool {}: {}", job_id, stream, e);
            false
        }
    }
}

fn join_items(items: &[u32]) -> String {
    items
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Job-level progress of a single-process run
///
/// Playlists downloaded by one process use the tool's own item counters.
fn whole_job_progress(progress: &Progress) -> Progress {
    let mut progress = progress.clone();
    if let (Some(current), Some(total)) = (progress.current_item, progress.total_items) {
        if total > 1 && current >= 1 {
            progress.percent =
                overall_percent((current - 1) as usize, total as usize, progress.percent);
        }
    }
    progress
}

/// Job-level progress while running item `position` of `total` in per-item mode
fn item_progress(progress: &Progress, position: usize, total: usize) -> Progress {
    let mut progress = progress.clone();
    progress.percent = overall_percent(position, total, progress.percent);
    progress.current_item = Some(position as u32 + 1);
    progress.total_items = Some(total as u32);
    progress
}
