//! Chunked transfer engine.
//!
//! Splits files into fixed-size chunks, pushes them concurrently to an object
//! store followed by a manifest, and reassembles them on download:
//! - [`codec`]: splitting a source into chunks and merging chunks back
//! - [`upload::Uploader`]: one put per chunk, manifest only if all succeeded
//! - [`download::Downloader`]: manifest, retrying fetch waves, ordered merge
//! - [`service::TransferService`]: the surface the HTTP layer calls

pub mod codec;
pub mod config;
pub mod download;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod retry;
pub mod service;
pub mod staging;
pub mod status;
pub mod store;
pub mod upload;

pub use codec::{Chunk, ChunkSplitter, chunk_count, merge, split};
pub use config::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, DEFAULT_MAX_CHUNKS, TransferConfig};
pub use download::{Downloader, StagedTransfer};
pub use error::{CodecError, StoreError, TransferError};
pub use ledger::ChunkLedger;
pub use manifest::{Manifest, chunk_key, manifest_key};
pub use retry::RetryPolicy;
pub use service::{ChunkAck, TransferService, sanitize_file_name, validate_transfer_id};
pub use staging::StagingArea;
pub use status::{TransferRecord, TransferRegistry, TransferState};
pub use store::{Backend, FsStore, HttpStore, MemoryStore, ObjectStore, S3Store};
pub use upload::Uploader;

// Re-exported so callers can build cancellation tokens without a direct dep.
pub use tokio_util::sync::CancellationToken;
