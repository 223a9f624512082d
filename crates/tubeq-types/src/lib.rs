//! Shared types for tubeq
//!
//! This crate contains the data structures shared between the queue
//! engine and the CLI: jobs, progress records, requests, events and settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Job Types
// ============================================================================

/// One requested download unit: a single video or a playlist subset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub url: String,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Progress,
    pub output_template: String,
    pub format: Option<String>,
    /// Ordered playlist item indices (1-based)
    #[serde(default)]
    pub playlist_items: Option<Vec<u32>>,
    /// Format selector per playlist item index
    #[serde(default)]
    pub item_formats: Option<BTreeMap<u32, String>>,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Job {
    pub fn new(request: DownloadRequest, output_template: String) -> Self {
        let kind = request.detect_kind();
        Self {
            id: Uuid::new_v4(),
            url: request.url,
            kind,
            status: JobStatus::Pending,
            progress: Progress::default(),
            output_template,
            format: request.format,
            playlist_items: request.playlist_items,
            item_formats: request.item_formats,
            title: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            files: Vec::new(),
        }
    }

    /// Whether each playlist item runs as its own process with its own format
    pub fn is_per_item(&self) -> bool {
        self.item_formats
            .as_ref()
            .map(|formats| !formats.is_empty())
            .unwrap_or(false)
    }

    /// Items to run in per-item mode, in execution order
    ///
    /// The explicit item list wins; otherwise the keys of the format mapping.
    pub fn per_item_indices(&self) -> Vec<u32> {
        match (&self.playlist_items, &self.item_formats) {
            (Some(items), _) if !items.is_empty() => items.clone(),
            (_, Some(formats)) => formats.keys().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Format selector for a single playlist item
    pub fn format_for_item(&self, index: u32) -> Option<&str> {
        self.item_formats
            .as_ref()
            .and_then(|formats| formats.get(&index))
            .or(self.format.as_ref())
            .map(String::as_str)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// What a job downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Video,
    Playlist,
}

/// Status of a job
///
/// `Pending → Downloading → {Completed | Failed | Cancelled}`, or
/// `Pending → Cancelled` when cancelled before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Downloading) => true,
            (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Downloading, JobStatus::Completed)
            | (JobStatus::Downloading, JobStatus::Failed)
            | (JobStatus::Downloading, JobStatus::Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time measurement of an in-flight job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: f64,
    /// Smoothed speed, e.g. `1.25MiB/s`
    pub speed: Option<String>,
    /// Time remaining exactly as the tool printed it
    pub eta: Option<String>,
    pub current_item: Option<u32>,
    pub total_items: Option<u32>,
    pub filename: Option<String>,
}

// ============================================================================
// Request Types
// ============================================================================

/// A download request as submitted by the transport layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub format: Option<String>,
    /// Output subfolder/filename template relative to the download directory
    #[serde(default)]
    pub output_template: Option<String>,
    #[serde(default)]
    pub playlist_items: Option<Vec<u32>>,
    #[serde(default)]
    pub item_formats: Option<BTreeMap<u32, String>>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Playlist when items are selected or the URL points at a playlist
    pub fn detect_kind(&self) -> JobKind {
        let has_items = self
            .playlist_items
            .as_ref()
            .map(|items| !items.is_empty())
            .unwrap_or(false);
        let has_item_formats = self
            .item_formats
            .as_ref()
            .map(|formats| !formats.is_empty())
            .unwrap_or(false);
        if has_items || has_item_formats {
            return JobKind::Playlist;
        }

        match url::Url::parse(&self.url) {
            Ok(parsed) => {
                let has_list = parsed.query_pairs().any(|(key, _)| key == "list");
                if has_list || parsed.path().contains("/playlist") {
                    JobKind::Playlist
                } else {
                    JobKind::Video
                }
            }
            Err(_) => JobKind::Video,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Lifecycle events delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum JobEvent {
    Added { job: Job },
    Started { job_id: Uuid },
    Progress { job_id: Uuid, progress: Progress },
    Completed { job_id: Uuid, files: Vec<String> },
    Error { job_id: Uuid, message: String },
    Cancelled { job_id: Uuid },
    Cleared,
}

impl JobEvent {
    /// The job this event belongs to, if any
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            JobEvent::Added { job } => Some(job.id),
            JobEvent::Started { job_id }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Error { job_id, .. }
            | JobEvent::Cancelled { job_id } => Some(*job_id),
            JobEvent::Cleared => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Error { .. } | JobEvent::Cancelled { .. }
        )
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Queue engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory output templates are resolved against
    pub download_dir: PathBuf,
    /// Maximum number of jobs downloading at once
    pub max_concurrent: usize,
    /// Path or name of the yt-dlp compatible download tool
    pub tool_path: String,
    /// Extra arguments passed to every download invocation
    pub extra_args: Vec<String>,
    /// Minimum interval between progress notifications per job
    pub progress_interval_ms: u64,
    /// Quiet period before the job snapshot is written
    pub save_debounce_ms: u64,
    /// Number of speed samples in the moving average
    pub speed_window: usize,
    /// Look up the title when a job is submitted
    pub prefetch_metadata: bool,
    pub metadata_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir()
                .map(|p| p.join("tubeq"))
                .unwrap_or_else(|| PathBuf::from("downloads")),
            max_concurrent: 3,
            tool_path: "yt-dlp".to_string(),
            extra_args: Vec::new(),
            progress_interval_ms: 500,
            save_debounce_ms: 1000,
            speed_window: 5,
            prefetch_metadata: true,
            metadata_timeout_secs: 15,
        }
    }
}
