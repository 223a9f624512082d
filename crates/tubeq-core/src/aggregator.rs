//! Job-level progress: multi-item aggregation and notification throttling

use crate::broadcast::Broadcaster;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tubeq_types::{JobEvent, Progress};
use uuid::Uuid;

/// Overall percent of a job while item `completed_before + 1` of `total` runs
pub fn overall_percent(completed_before: usize, total: usize, item_percent: f64) -> f64 {
    if total == 0 {
        return item_percent.clamp(0.0, 100.0);
    }
    let total = total as f64;
    let overall = (completed_before as f64 / total) * 100.0 + item_percent / total;
    overall.clamp(0.0, 100.0)
}

/// Rate-limits progress notifications per job before they reach the broadcaster
pub struct ProgressAggregator {
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    last_sent: Mutex<HashMap<Uuid, Instant>>,
}

impl ProgressAggregator {
    pub fn new(broadcaster: Arc<Broadcaster>, interval: Duration) -> Self {
        Self {
            broadcaster,
            interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a progress event unless one went out for this job within the interval
    ///
    /// Returns whether the event was published.
    pub fn notify(&self, job_id: Uuid, progress: &Progress) -> bool {
        let now = Instant::now();
        {
            let mut last_sent = self.last_sent.lock();
            if let Some(last) = last_sent.get(&job_id) {
                if now.duration_since(*last) < self.interval {
                    return false;
                }
            }
            last_sent.insert(job_id, now);
        }

        self.broadcaster.publish(JobEvent::Progress {
            job_id,
            progress: progress.clone(),
        });
        true
    }

    /// Publish the final progress of a job regardless of the throttle
    pub fn finish(&self, job_id: Uuid, progress: &Progress) {
        self.last_sent.lock().remove(&job_id);
        self.broadcaster.publish(JobEvent::Progress {
            job_id,
            progress: progress.clone(),
        });
    }

    /// Forget throttle state for a job
    pub fn reset(&self, job_id: Uuid) {
        self.last_sent.lock().remove(&job_id);
    }

    pub fn clear(&self) {
        self.last_sent.lock().clear();
    }
}
