use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::codec::ChunkSplitter;
use crate::config::TransferConfig;
use crate::error::{Result, StoreError, TransferError};
use crate::manifest::{Manifest, chunk_key};
use crate::store::ObjectStore;

type PutOutcome = std::result::Result<u64, (u64, StoreError)>;

/// Pushes a transfer's chunks to the object store, then its manifest.
///
/// Every chunk gets exactly one `put`. The manifest is written only when all
/// of them succeeded, so a transfer either becomes downloadable as a whole or
/// not at all. Chunks stored before a failure are left where they are.
pub struct Uploader<S> {
    store: Arc<S>,
    config: TransferConfig,
}

impl<S: ObjectStore> Uploader<S> {
    pub fn new(store: Arc<S>, config: TransferConfig) -> Self {
        Self { store, config }
    }

    /// Upload chunks that are already in memory, in index order.
    pub async fn upload_chunks(
        &self,
        transfer_id: &str,
        file_name: &str,
        chunks: Vec<Bytes>,
    ) -> Result<Manifest> {
        let started = Instant::now();
        let total = chunks.len() as u64;
        self.config.check_chunk_count(total)?;
        let permits = Arc::new(Semaphore::new(self.config.permits()));
        let mut tasks = JoinSet::new();

        for (index, data) in chunks.into_iter().enumerate() {
            let permit = permits.clone().acquire_owned().await.ok();
            self.spawn_put(&mut tasks, permit, transfer_id, index as u64, data);
        }

        wait_for_puts(transfer_id, tasks).await?;
        let manifest = self.finish(transfer_id, file_name, total).await?;

        info!(
            transfer_id,
            chunks = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upload complete"
        );
        Ok(manifest)
    }

    /// Split `reader` into chunks and upload them as they are read.
    ///
    /// A permit is taken before each chunk is read, so at most `concurrency`
    /// chunk buffers are alive at once.
    pub async fn upload_reader<R: AsyncRead + Unpin>(
        &self,
        transfer_id: &str,
        file_name: &str,
        reader: R,
    ) -> Result<Manifest> {
        let started = Instant::now();
        let mut splitter = ChunkSplitter::new(reader, self.config.chunk_size);
        let permits = Arc::new(Semaphore::new(self.config.permits()));
        let mut tasks = JoinSet::new();

        let read = loop {
            let permit = permits.clone().acquire_owned().await.ok();
            match splitter.next_chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = self.config.check_chunk_count(chunk.index + 1) {
                        break Err(e);
                    }
                    self.spawn_put(&mut tasks, permit, transfer_id, chunk.index, chunk.data)
                }
                Ok(None) => break Ok(splitter.emitted()),
                Err(e) => break Err(TransferError::from(e)),
            }
        };

        // Chunks already dispatched always settle before anything is reported.
        let uploaded = wait_for_puts(transfer_id, tasks).await;
        let total = read?;
        uploaded?;

        let manifest = self.finish(transfer_id, file_name, total).await?;
        info!(
            transfer_id,
            chunks = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upload complete"
        );
        Ok(manifest)
    }

    /// Store a single chunk without any orchestration. Returns its key.
    pub async fn put_chunk(&self, transfer_id: &str, index: u64, data: Bytes) -> Result<String> {
        self.config.check_chunk_count(index.saturating_add(1))?;
        let key = chunk_key(transfer_id, index);
        self.store
            .put(&key, data)
            .await
            .map_err(|source| TransferError::ChunkUpload { index, source })?;
        Ok(key)
    }

    /// Persist `manifest`, making its transfer downloadable.
    pub async fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        self.config.check_chunk_count(manifest.total_chunks)?;
        let encoded = manifest.to_bytes().map_err(TransferError::ManifestEncode)?;
        self.store
            .put(&manifest.key(), encoded)
            .await
            .map_err(TransferError::ManifestWrite)
    }

    async fn finish(&self, transfer_id: &str, file_name: &str, total: u64) -> Result<Manifest> {
        let manifest = Manifest::new(transfer_id, file_name, total);
        self.write_manifest(&manifest).await?;
        Ok(manifest)
    }

    fn spawn_put(
        &self,
        tasks: &mut JoinSet<PutOutcome>,
        permit: Option<OwnedSemaphorePermit>,
        transfer_id: &str,
        index: u64,
        data: Bytes,
    ) {
        let store = self.store.clone();
        let key = chunk_key(transfer_id, index);
        let transfer_id = transfer_id.to_string();

        tasks.spawn(async move {
            let _permit = permit;
            let size = data.len();
            match store.put(&key, data).await {
                Ok(()) => {
                    debug!(transfer_id = %transfer_id, index, size, "Chunk uploaded");
                    Ok(index)
                }
                Err(e) => {
                    warn!(transfer_id = %transfer_id, index, "Chunk upload failed: {}", e);
                    Err((index, e))
                }
            }
        });
    }
}

/// Wait for every dispatched put, then report the first failure observed.
async fn wait_for_puts(transfer_id: &str, mut tasks: JoinSet<PutOutcome>) -> Result<()> {
    let mut first_failure = None;
    let mut failed = 0usize;

    while let Some(joined) = tasks.join_next().await {
        let failure = match joined {
            Ok(Ok(_)) => continue,
            Ok(Err((index, source))) => TransferError::ChunkUpload { index, source },
            Err(join_err) => TransferError::Task(join_err),
        };
        failed += 1;
        first_failure.get_or_insert(failure);
    }

    match first_failure {
        Some(err) => {
            warn!(transfer_id, failed, "Upload aborted, manifest not written");
            Err(err)
        }
        None => Ok(()),
    }
}
