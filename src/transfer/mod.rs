//! Transfer pipeline
//!
//! Concurrency-limited upload/download of files and directory trees, with a
//! registry of transfer records for progress rendering.

pub mod backend;
pub mod control;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod paths;
pub mod registry;
pub mod remote;
pub mod tree;
pub mod types;

pub use backend::CloudBackend;
pub use control::{ControlGuard, TransferControl, TransferControls};
pub use engine::{
    chunk_stream, ChunkStream, DirectoryDownload, DirectoryOutcome, DownloadOutcome,
    TransferEngine, UploadOutcome,
};
pub use error::TransferError;
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use paths::TransferPaths;
pub use registry::{ListUpdate, RegistrySnapshot, TransferRegistry};
pub use remote::{BackendWorker, BridgeBackend};
pub use types::*;
