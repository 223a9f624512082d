//! Progress bar utilities for `tubeq run`

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use tubeq_types::{Job, JobEvent, Progress};
use uuid::Uuid;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {prefix} {msg}";

/// Manages progress bars for the jobs of one run
pub struct JobProgress {
    multi: MultiProgress,
    bars: HashMap<Uuid, ProgressBar>,
}

impl JobProgress {
    /// Bars are only drawn when `visible`; machine-readable output stays clean
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self {
            multi,
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for a job
    pub fn add_job(&mut self, job: &Job) {
        if self.bars.contains_key(&job.id) {
            return;
        }

        let pb = self.multi.add(ProgressBar::new(100));
        pb.set_style(
            ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        pb.set_prefix(job.title.clone().unwrap_or_else(|| job.url.clone()));
        pb.set_message(format!("{}", style("queued").dim()));
        pb.set_position(job.progress.percent as u64);

        self.bars.insert(job.id, pb);
    }

    /// Update a progress bar from an event
    pub fn handle_event(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Started { job_id } => {
                if let Some(pb) = self.bars.get(job_id) {
                    pb.set_position(0);
                    pb.set_message("starting".to_string());
                    pb.enable_steady_tick(std::time::Duration::from_millis(120));
                }
            }

            JobEvent::Progress { job_id, progress } => {
                if let Some(pb) = self.bars.get(job_id) {
                    pb.set_position(progress.percent.round() as u64);
                    pb.set_message(progress_message(progress));
                }
            }

            JobEvent::Completed { job_id, files } => {
                if let Some(pb) = self.bars.get(job_id) {
                    pb.set_position(100);
                    pb.finish_with_message(format!(
                        "{} {}",
                        style("✓").green().bold(),
                        files.join(", ")
                    ));
                }
            }

            JobEvent::Error { job_id, message } => {
                if let Some(pb) = self.bars.get(job_id) {
                    pb.abandon_with_message(format!(
                        "{} Failed: {}",
                        style("✗").red().bold(),
                        message
                    ));
                }
            }

            JobEvent::Cancelled { job_id } => {
                if let Some(pb) = self.bars.get(job_id) {
                    pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
                }
            }

            JobEvent::Cleared => self.clear(),

            JobEvent::Added { .. } => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }
}

fn progress_message(progress: &Progress) -> String {
    let mut parts = Vec::new();
    if let (Some(current), Some(total)) = (progress.current_item, progress.total_items) {
        parts.push(format!("item {}/{}", current, total));
    }
    if let Some(ref speed) = progress.speed {
        parts.push(speed.clone());
    }
    if let Some(ref eta) = progress.eta {
        parts.push(format!("ETA {}", eta));
    }
    if let Some(ref filename) = progress.filename {
        parts.push(style(filename).dim().to_string());
    }
    parts.join("  ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_message() {
        let progress = Progress {
            percent: 42.0,
            speed: Some("1.50MiB/s".to_string()),
            eta: Some("00:12".to_string()),
            current_item: Some(2),
            total_items: Some(5),
            filename: None,
        };
        assert_eq!(progress_message(&progress), "item 2/5  1.50MiB/s  ETA 00:12");
        assert_eq!(progress_message(&Progress::default()), "");
    }
}
