//! Local history for workspace files.
//!
//! Every saved version of a file can be recorded as a state in the
//! [`HistoryStore`]. Contents go to a file-per-blob store; a per-folder index
//! of buckets maps each path to its states. Retention limits and garbage
//! collection keep both bounded.

pub mod config;
pub mod error;
pub mod path;
pub mod store;
pub mod watcher;

pub use config::Config;
pub use error::{HistoryError, Result};
pub use path::HistoryPath;
pub use store::policy::HistoryPolicy;
pub use store::tree::Depth;
pub use store::{FileInfo, FileState, HistoryStore, Resource, ResourceKind};
