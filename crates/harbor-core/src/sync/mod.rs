//! Offline sync: the remote backend seam, conflict handling and the engine
//! that drives upload and download passes.

mod conflict;
mod engine;
mod error;
mod events;
mod http;
mod memory;
mod remote;
mod retry;

pub use conflict::{
    strategy_from_name, ConflictOutcome, ConflictResolver, ConflictStrategy, LocalWins, Manual,
    RemoteWins, Resolution, ShallowMerge, STRATEGY_NAMES,
};
pub use engine::{SyncEngine, DEFAULT_PAGE_SIZE};
pub use error::{RemoteResult, SyncError};
pub use events::{SkipReason, SyncEvent, SyncOutcome, SyncPhase, SyncReport};
pub use http::PostgrestBackend;
pub use memory::{InMemoryBackend, RemoteCall, RemoteCallKind};
pub use remote::{parse_timestamp, RemoteBackend, RemotePosition, RemoteRow};
pub use retry::RetryPolicy;
