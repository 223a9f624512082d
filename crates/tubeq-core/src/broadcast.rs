//! Event fan-out to subscribers
//!
//! Each job has its own subscriber set; every event additionally goes to the
//! global feed used by the CLI. Per-job channels are unbounded so events
//! arrive in publish order and a slow subscriber never blocks a job.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use tubeq_types::JobEvent;
use uuid::Uuid;

/// Capacity of the global feed
const GLOBAL_CAPACITY: usize = 1024;

/// Handle identifying a single subscription
pub type SubscriptionId = u64;

/// Receiving end of a per-job subscription
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    job_id: Uuid,
    rx: mpsc::UnboundedReceiver<JobEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next event; `None` once the subscription has been removed
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }
}

type Subscribers = HashMap<Uuid, Vec<(SubscriptionId, mpsc::UnboundedSender<JobEvent>)>>;

pub struct Broadcaster {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
    global: broadcast::Sender<JobEvent>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(GLOBAL_CAPACITY);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            global,
        }
    }

    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(job_id)
            .or_default()
            .push((id, tx));
        Subscription { id, job_id, rx }
    }

    /// Remove one subscription; returns false if it was already gone
    pub fn unsubscribe(&self, job_id: Uuid, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(entries) = subscribers.get_mut(&job_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            subscribers.remove(&job_id);
        }
        removed
    }

    /// Subscribe to every event of every job
    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.global.subscribe()
    }

    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.subscribers
            .lock()
            .get(&job_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver an event
    ///
    /// Subscribers whose receiver is gone are dropped; the rest still get
    /// the event. A terminal event ends the job's subscriptions after it is
    /// delivered. `Cleared` goes to everyone and ends every subscription.
    pub fn publish(&self, event: JobEvent) {
        {
            let mut subscribers = self.subscribers.lock();
            match event.job_id() {
                Some(job_id) => {
                    if let Some(entries) = subscribers.get_mut(&job_id) {
                        deliver(entries, &event);
                        if entries.is_empty() || event.is_terminal() {
                            subscribers.remove(&job_id);
                        }
                    }
                }
                None => {
                    for entries in subscribers.values_mut() {
                        deliver(entries, &event);
                    }
                    subscribers.clear();
                }
            }
        }

        // No global receivers is fine
        let _ = self.global.send(event);
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(
    entries: &mut Vec<(SubscriptionId, mpsc::UnboundedSender<JobEvent>)>,
    event: &JobEvent,
) {
    entries.retain(|(id, tx)| match tx.send(event.clone()) {
        Ok(()) => true,
        Err(_) => {
            debug!("Dropping closed subscriber {}", id);
            false
        }
    });
}
