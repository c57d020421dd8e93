//! Personal productivity data layer
//!
//! This library stores tasks, ideas, domains, idea folders and calendar
//! events behind one storage interface with a local or remote backend, and
//! moves deleted items through a recoverable trash before they are purged.

mod backup;
mod cli;
mod config;
mod coordinator;
mod document_store;
mod errors;
mod helper;
mod local_store;
mod model;
mod observer;
mod remote_store;
mod scheduler;
mod search;
mod settings;
mod storage;
mod sync_status;
mod trash;
mod types;

// Re-export key components
pub use backup::*;
pub use cli::*;
pub use config::*;
pub use coordinator::*;
pub use document_store::*;
pub use errors::*;
pub use helper::*;
pub use local_store::*;
pub use model::*;
pub use observer::*;
pub use remote_store::*;
pub use scheduler::*;
pub use search::*;
pub use settings::*;
pub use storage::*;
pub use sync_status::*;
pub use trash::*;
pub use types::*;
