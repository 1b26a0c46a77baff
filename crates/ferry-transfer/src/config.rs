use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::TransferError;
use crate::retry::RetryPolicy;

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Default number of store operations allowed in flight per transfer.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Default ceiling on chunks per transfer: 5 TiB at the default chunk size.
pub const DEFAULT_MAX_CHUNKS: u64 = 1 << 20;

/// Tunables shared by the upload and download orchestrators.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Size of every chunk except possibly the last.
    pub chunk_size: usize,
    /// Retry schedule for a single chunk fetch.
    pub retry: RetryPolicy,
    /// Pause before re-scanning for missing chunks after an incomplete wave.
    pub rescan_delay: Duration,
    /// Waves the download loop runs before failing. `None` = until complete.
    pub max_waves: Option<NonZeroU32>,
    /// Store operations in flight per transfer.
    pub concurrency: usize,
    /// Parent directory for per-download staging areas.
    pub staging_dir: PathBuf,
    /// Largest chunk count a transfer may declare. Bounds the per-download
    /// ledger and the fetch waves.
    pub max_chunks: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            rescan_delay: Duration::from_millis(200),
            max_waves: None,
            concurrency: DEFAULT_CONCURRENCY,
            staging_dir: std::env::temp_dir().join("ferry-staging"),
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

impl TransferConfig {
    /// Semaphore size, never zero.
    pub(crate) fn permits(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Reject chunk counts above `max_chunks`.
    pub(crate) fn check_chunk_count(&self, total: u64) -> Result<(), TransferError> {
        if total > self.max_chunks {
            return Err(TransferError::TooManyChunks {
                total,
                max: self.max_chunks,
            });
        }
        Ok(())
    }
}
