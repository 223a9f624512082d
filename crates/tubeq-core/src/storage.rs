//! Storage layer for the data directory (settings file, job snapshot path
//! and the run lock)

use crate::error::TubeqError;
use crate::scheduler::JOBS_FILE;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use tubeq_types::Settings;

const SETTINGS_FILE: &str = "settings.json";
const RUN_LOCK_FILE: &str = "run.lock";

/// Held by the process running the queue for a data directory
///
/// The lock file holds the owner's pid and is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove run lock {:?}: {}", self.path, e);
        }
    }
}

/// Storage manager for tubeq data
#[derive(Clone, Debug)]
pub struct Storage {
    /// Data directory
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self, TubeqError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join(JOBS_FILE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn run_lock_path(&self) -> PathBuf {
        self.data_dir.join(RUN_LOCK_FILE)
    }

    // ========================================================================
    // Run Lock
    // ========================================================================

    /// Take the run lock for this data directory
    ///
    /// A lock left behind by a process that no longer exists is replaced.
    pub async fn acquire_run_lock(&self) -> Result<RunLock, TubeqError> {
        let path = self.run_lock_path();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes())
                        .await?;
                    file.sync_all().await?;
                    debug!("Took run lock {:?}", path);
                    return Ok(RunLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = self.active_run().await {
                        return Err(TubeqError::RunActive(pid));
                    }
                    info!("Removing stale run lock {:?}", path);
                    match fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pid of a live process holding the run lock
    pub async fn active_run(&self) -> Option<u32> {
        let content = fs::read_to_string(self.run_lock_path()).await.ok()?;
        let pid = content.trim().parse::<u32>().ok()?;
        process_alive(pid).then_some(pid)
    }

    /// Fail while another process runs the queue
    ///
    /// Edits made to the snapshot during a run would be overwritten by the
    /// run's next save.
    pub async fn ensure_no_active_run(&self) -> Result<(), TubeqError> {
        match self.active_run().await {
            Some(pid) => Err(TubeqError::RunActive(pid)),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Load settings, falling back to defaults when the file is missing or unreadable
    pub async fn load_settings(&self) -> Settings {
        let path = self.settings_path();
        match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Ignoring invalid settings file {:?}: {}", path, e);
                    Settings::default()
                }
            },
            Err(e) => {
                debug!("No settings at {:?} ({}), using defaults", path, e);
                Settings::default()
            }
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), TubeqError> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.settings_path(), content).await?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without /proc any lock holding a pid counts as live
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}
