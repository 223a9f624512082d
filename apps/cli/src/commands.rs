//! CLI command implementations
//!
//! `run` drives the scheduler and holds the data directory's run lock. The
//! other job commands edit the saved snapshot directly and refuse to while a
//! run holds the lock.

use crate::output::{print_output, status_icon, truncate};
use crate::progress::JobProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use std::collections::BTreeMap;
use std::time::Duration;
use tubeq_core::engine::PersistenceManager;
use tubeq_core::{prepare_job, JobScheduler, Snapshot, Storage};
use tubeq_types::{DownloadRequest, Job, JobEvent, JobStatus, Settings};
use uuid::Uuid;

// ============================================================================
// Snapshot Access
// ============================================================================

fn snapshot_store(storage: &Storage) -> PersistenceManager {
    PersistenceManager::new(storage.jobs_path(), Duration::ZERO)
}

/// Resolve a full job id or a unique prefix of one
fn resolve_id(jobs: &[Job], id: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let matches: Vec<&Job> = jobs
        .iter()
        .filter(|job| job.id.to_string().starts_with(id))
        .collect();
    match matches.as_slice() {
        [job] => Ok(job.id),
        [] => Err(anyhow!("No job matches '{}'", id)),
        _ => Err(anyhow!("'{}' matches {} jobs, use a longer prefix", id, matches.len())),
    }
}

// ============================================================================
// Job Commands
// ============================================================================

pub fn build_request(
    url: String,
    format: Option<String>,
    items: Vec<u32>,
    item_formats: Vec<String>,
    template: Option<String>,
) -> Result<DownloadRequest> {
    let mut mapping = BTreeMap::new();
    for entry in item_formats {
        let (index, selector) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected INDEX=FORMAT, got '{}'", entry))?;
        let index: u32 = index
            .trim()
            .parse()
            .with_context(|| format!("Invalid playlist index in '{}'", entry))?;
        mapping.insert(index, selector.trim().to_string());
    }

    Ok(DownloadRequest {
        url,
        format,
        output_template: template,
        playlist_items: (!items.is_empty()).then_some(items),
        item_formats: (!mapping.is_empty()).then_some(mapping),
    })
}

pub async fn add_job(
    storage: &Storage,
    request: DownloadRequest,
    now: bool,
    format: OutputFormat,
) -> Result<()> {
    let job = prepare_job(request)?;
    storage.ensure_no_active_run().await?;

    let store = snapshot_store(storage);
    let mut snapshot = store.load().await;
    snapshot.queue.push(job.id);
    snapshot.jobs.push(job.clone());
    store.flush(&snapshot).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Queued {}: {}",
                style("✓").green().bold(),
                match job.kind {
                    tubeq_types::JobKind::Video => "video",
                    tubeq_types::JobKind::Playlist => "playlist",
                },
                style(&job.url).cyan()
            );
            println!("  ID: {}", job.id);
            println!("  Template: {}", job.output_template);
        }
    }

    if now {
        run_queue(storage, None, format).await?;
    }

    Ok(())
}

pub async fn list_jobs(
    storage: &Storage,
    status_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let snapshot = snapshot_store(storage).load().await;

    let filtered: Vec<Job> = snapshot
        .jobs
        .into_iter()
        .filter(|job| match status_filter {
            Some(ref status) => job.status.as_str().contains(&status.to_lowercase()),
            None => true,
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&filtered)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct JobRow {
                id: String,
                name: String,
                kind: String,
                progress: String,
                status: String,
            }

            let rows: Vec<JobRow> = filtered
                .iter()
                .map(|job| JobRow {
                    id: job.id.to_string()[..8].to_string(),
                    name: truncate(display_name(job), 40),
                    kind: format!("{:?}", job.kind).to_lowercase(),
                    progress: format!("{:.1}%", job.progress.percent),
                    status: job.status.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No jobs found").dim());
                return Ok(());
            }

            for job in &filtered {
                print_job_summary(job, show_all);
            }
            println!();
            println!("{} job(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

fn display_name(job: &Job) -> &str {
    job.title.as_deref().unwrap_or(&job.url)
}

fn print_job_summary(job: &Job, detailed: bool) {
    let progress = format!("{:.1}%", job.progress.percent);

    println!(
        "{} {} {} [{}]",
        status_icon(job.status),
        style(display_name(job)).bold(),
        style(&progress).dim(),
        style(job.status).dim()
    );

    if detailed {
        println!("    ID: {}", job.id);
        println!("    URL: {}", job.url);
        println!("    Template: {}", job.output_template);
        if let Some(ref format) = job.format {
            println!("    Format: {}", format);
        }
        if let Some(ref items) = job.playlist_items {
            let items: Vec<String> = items.iter().map(u32::to_string).collect();
            println!("    Items: {}", items.join(","));
        }
        if let Some(ref formats) = job.item_formats {
            for (index, selector) in formats {
                println!("    Item {}: {}", index, selector);
            }
        }
        println!("    Created: {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(completed) = job.completed_at {
            println!("    Finished: {}", completed.format("%Y-%m-%d %H:%M:%S"));
        }
        for file in &job.files {
            println!("    File: {}", file);
        }
        if let Some(ref error) = job.error {
            println!("    Error: {}", style(error).red());
        }
        println!();
    }
}

pub async fn show_info(storage: &Storage, id: &str, format: OutputFormat) -> Result<()> {
    let snapshot = snapshot_store(storage).load().await;
    let uuid = resolve_id(&snapshot.jobs, id)?;
    let job = snapshot.job(uuid)?;

    match format {
        OutputFormat::Json => print_output(job, format)?,
        _ => print_job_summary(job, true),
    }

    Ok(())
}

pub async fn cancel_job(storage: &Storage, id: &str, format: OutputFormat) -> Result<()> {
    storage.ensure_no_active_run().await?;

    let store = snapshot_store(storage);
    let mut snapshot = store.load().await;
    let uuid = resolve_id(&snapshot.jobs, id)?;

    let job = snapshot.job_mut(uuid)?;
    if job.status != JobStatus::Pending {
        bail!("Job {} is {}, only pending jobs can be cancelled here", uuid, job.status);
    }
    job.status = JobStatus::Cancelled;
    job.completed_at = Some(chrono::Utc::now());
    snapshot.queue.retain(|queued| *queued != uuid);
    store.flush(&snapshot).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "id": uuid, "cancelled": true }));
        }
        _ => println!("{} Job cancelled", style("✓").green().bold()),
    }
    Ok(())
}

pub async fn clear_jobs(storage: &Storage, yes: bool) -> Result<()> {
    storage.ensure_no_active_run().await?;

    if !yes {
        use dialoguer::Confirm;

        let confirmed = Confirm::new()
            .with_prompt("Remove every job?")
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    snapshot_store(storage).flush(&Snapshot::default()).await?;
    println!("{} All jobs cleared", style("✓").green().bold());
    Ok(())
}

// ============================================================================
// Run Command
// ============================================================================

pub async fn run_queue(
    storage: &Storage,
    max_concurrent: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let _lock = storage.acquire_run_lock().await?;

    let mut settings = storage.load_settings().await;
    if let Some(max_concurrent) = max_concurrent {
        settings.max_concurrent = max_concurrent.max(1);
    }

    let scheduler = JobScheduler::new(storage.jobs_path(), settings);
    let mut events = scheduler.subscribe_all();
    scheduler.restore().await;

    let mut progress = JobProgress::new(matches!(format, OutputFormat::Human));
    for job in scheduler.list_all() {
        if !job.is_terminal() {
            progress.add_job(&job);
        }
    }

    let mut interrupted = false;
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => {
                    if matches!(format, OutputFormat::Json) {
                        println!("{}", serde_json::to_string(&event)?);
                    }
                    if let JobEvent::Added { ref job } = event {
                        progress.add_job(job);
                    }
                    progress.handle_event(&event);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Progress display skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = scheduler.wait_idle() => break,
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
        }
    }

    if interrupted {
        progress.clear();
        eprintln!("{} Interrupted, stopping downloads...", style("!").yellow().bold());
    }
    scheduler.shutdown().await?;

    if !matches!(format, OutputFormat::Json) {
        print_run_summary(&scheduler.list_all(), interrupted);
    }
    Ok(())
}

fn print_run_summary(jobs: &[Job], interrupted: bool) {
    let count = |status: JobStatus| jobs.iter().filter(|job| job.status == status).count();

    println!();
    println!(
        "{} completed, {} failed, {} cancelled",
        style(count(JobStatus::Completed)).green().bold(),
        style(count(JobStatus::Failed)).red().bold(),
        style(count(JobStatus::Cancelled)).dim()
    );
    if interrupted {
        println!("Unfinished jobs resume on the next `tubeq run`");
    }
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    storage: &Storage,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = storage.load_settings().await;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("tubeq Configuration:");
                    println!();
                    println!("  Data directory: {}", storage.data_dir().display());
                    println!("  Download directory: {}", settings.download_dir.display());
                    println!("  Max concurrent downloads: {}", settings.max_concurrent);
                    println!("  Download tool: {}", settings.tool_path);
                    println!(
                        "  Extra arguments: {}",
                        if settings.extra_args.is_empty() {
                            "None".to_string()
                        } else {
                            settings.extra_args.join(" ")
                        }
                    );
                    println!("  Progress interval: {} ms", settings.progress_interval_ms);
                    println!("  Save debounce: {} ms", settings.save_debounce_ms);
                    println!("  Speed window: {} samples", settings.speed_window);
                    println!("  Fetch titles: {}", settings.prefetch_metadata);
                    println!("  Metadata timeout: {} s", settings.metadata_timeout_secs);
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = serde_json::to_value(storage.load_settings().await)?;
            let value = settings
                .get(&key)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            match value {
                serde_json::Value::String(s) => println!("{}", s),
                other => println!("{}", other),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let settings = storage.load_settings().await;
            let updated = set_config_value(&settings, &key, &value)?;
            storage.save_settings(&updated).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            let confirmed = yes || {
                use dialoguer::Confirm;

                Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?
            };

            if confirmed {
                storage.save_settings(&Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

/// Apply `key = value` to settings, typed by the existing field
///
/// Values are read as JSON first (numbers, booleans, arrays) and fall back
/// to a plain string.
fn set_config_value(settings: &Settings, key: &str, value: &str) -> Result<Settings> {
    let mut object = serde_json::to_value(settings)?;
    let slot = object
        .get_mut(key)
        .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;

    *slot = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));

    let updated: Settings = serde_json::from_value(object)
        .with_context(|| format!("Invalid value for {}: {}", key, value))?;
    if updated.max_concurrent == 0 {
        bail!("max_concurrent must be at least 1");
    }
    Ok(updated)
}
