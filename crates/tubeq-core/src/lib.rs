//! tubeq Core - Download Queue Engine
//!
//! This crate queues download requests, runs a bounded number of them
//! through an external yt-dlp compatible tool, and reports progress and
//! lifecycle events to subscribers. State survives restarts through a
//! debounced JSON snapshot.

pub mod aggregator;
pub mod broadcast;
pub mod engine;
mod error;
mod scheduler;
mod storage;

pub use aggregator::{overall_percent, ProgressAggregator};
pub use broadcast::{Broadcaster, Subscription, SubscriptionId};
pub use engine::{ProcessRunner, ProgressObserver, Snapshot};
pub use error::*;
pub use scheduler::*;
pub use storage::*;

pub use tubeq_types as types;
