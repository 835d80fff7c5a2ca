//! Offline-first sync engine for the Audioshelf library client.
//!
//! Pulls every entity family into a local SQLite store, replays queued local
//! edits, caches cover art and follows the server's event stream. The host
//! application drives it through [`SyncRuntime`] and reads state from the
//! store and the status channel.

pub mod config;
pub mod error;
pub mod runtime;
pub mod sync;
pub mod token_provider;

pub use config::{ConfigError, SyncConfig};
pub use error::{ErrorKind, SyncError};
pub use runtime::{RuntimeError, SyncRuntime};
pub use sync::events::{EventBus, LibraryEvent};
pub use sync::orchestrator::{CycleOutcome, SyncOrchestrator};
pub use sync::push::{PushReport, PushSyncOrchestrator};
pub use sync::records::EntityFamily;
pub use sync::status::{SyncFailure, SyncPhase, SyncStatus};
pub use sync::store::LibraryStore;
pub use token_provider::{Credentials, TokenProvider};
