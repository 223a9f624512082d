//! Registry of in-flight tool processes, keyed by job id
//!
//! A job is registered for the whole time it owns a slot, so an external
//! cancel can always reach it, even between two per-item processes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job; the entry is removed when the returned guard drops
    pub fn register(self: &Arc<Self>, job_id: Uuid) -> Registration {
        let token = CancellationToken::new();
        self.entries.lock().insert(job_id, token.clone());
        Registration {
            registry: Arc::clone(self),
            job_id,
            token,
        }
    }

    /// Signal the job's process to terminate
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.entries.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                info!("Signalled cancellation for job {}", job_id);
                true
            }
            None => false,
        }
    }

    /// Signal every registered process; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let entries = self.entries.lock();
        for token in entries.values() {
            token.cancel();
        }
        entries.len()
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.entries.lock().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Guard for a registered job
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ProcessRegistry>,
    job_id: Uuid,
    token: CancellationToken,
}

impl Registration {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.entries.lock().remove(&self.job_id);
    }
}
