//! Job engine daemon: queue + workers + history + watcher + ticker.

mod adapters;
mod error;
pub mod history;
pub mod jobs;
pub mod paths;
pub mod retry;
mod runtime;
pub mod ticker;
pub mod watcher;

pub use adapters::Adapters;
pub use error::EngineError;
pub use history::HistoryStore;
pub use jobs::JobStore;
pub use retry::{retry_on_conflict, Backoff};
pub use runtime::{run, start_blocking, Engine, EngineConfig};
