//! Download engine - everything between a job and the external tool
//!
//! - Output parsing and speed smoothing
//! - Process spawning, supervision and cancellation
//! - Debounced, atomic snapshot persistence

mod debounce;
mod parser;
mod persistence;
mod registry;
mod runner;

pub use debounce::*;
pub use parser::*;
pub use persistence::*;
pub use registry::*;
pub use runner::*;
