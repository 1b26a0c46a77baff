use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::ledger::ChunkLedger;
use crate::manifest::{Manifest, manifest_key};
use crate::retry::RetryPolicy;
use crate::staging::{StagingArea, write_staged_chunk};
use crate::store::ObjectStore;

/// Read buffer used when streaming staged chunks.
const STREAM_BUF_SIZE: usize = 64 * 1024;

/// A failing fetch logs at `warn` every this many attempts, `debug` otherwise.
const WARN_EVERY_ATTEMPTS: u32 = 20;

/// Reassembles a transfer from the object store.
///
/// A download runs in three steps:
/// 1. Read the manifest. Without one the transfer does not exist (yet).
/// 2. Fetch every chunk into a private staging area. Chunks are fetched in
///    waves: each wave dispatches one task per chunk still missing, every task
///    retries its chunk until it is staged, and after the wave the missing set
///    is re-scanned so chunks whose task gave up are dispatched again.
/// 3. Merge the staged chunks in index order into the caller's output, then
///    remove the staging area.
pub struct Downloader<S> {
    store: Arc<S>,
    config: TransferConfig,
}

impl<S: ObjectStore> Downloader<S> {
    pub fn new(store: Arc<S>, config: TransferConfig) -> Self {
        Self { store, config }
    }

    /// Fetch and parse the manifest for `transfer_id`. Never retried.
    pub async fn fetch_manifest(&self, transfer_id: &str) -> Result<Manifest> {
        let not_found = |reason: String| TransferError::ManifestNotFound {
            transfer_id: transfer_id.to_string(),
            reason,
        };

        let data = self
            .store
            .get(&manifest_key(transfer_id))
            .await
            .map_err(|e| not_found(e.to_string()))?;
        let manifest = Manifest::from_slice(&data)
            .map_err(|e| not_found(format!("unparsable manifest: {}", e)))?;

        if manifest.transfer_id != transfer_id {
            return Err(not_found(format!(
                "manifest belongs to transfer {}",
                manifest.transfer_id
            )));
        }
        if let Err(e) = self.config.check_chunk_count(manifest.total_chunks) {
            return Err(not_found(format!("manifest rejected: {}", e)));
        }
        Ok(manifest)
    }

    /// Fetch every chunk named by `manifest` into a new staging area.
    ///
    /// Returns once all chunks are staged. With the default config this never
    /// gives up on a chunk; only `cancel` or a `max_waves` budget ends it early.
    pub async fn stage(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<StagedTransfer> {
        self.config.check_chunk_count(manifest.total_chunks)?;
        let started = Instant::now();
        let staging = StagingArea::create(&self.config.staging_dir, &manifest.transfer_id)
            .await
            .map_err(TransferError::Staging)?;

        info!(
            transfer_id = %manifest.transfer_id,
            chunks = manifest.total_chunks,
            "Starting download"
        );

        let waves = match self.fetch_waves(manifest, staging.path(), cancel).await {
            Ok(waves) => waves,
            Err(e) => {
                if let Err(remove_err) = staging.remove().await {
                    warn!(
                        transfer_id = %manifest.transfer_id,
                        "Failed to remove staging area: {}", remove_err
                    );
                }
                return Err(e);
            }
        };

        info!(
            transfer_id = %manifest.transfer_id,
            chunks = manifest.total_chunks,
            waves,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "All chunks staged"
        );
        Ok(StagedTransfer {
            manifest: manifest.clone(),
            staging,
        })
    }

    /// Dispatch fetch waves until every chunk is staged in `dir`. Returns the
    /// number of waves it took.
    async fn fetch_waves(
        &self,
        manifest: &Manifest,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let ledger = Arc::new(ChunkLedger::new(manifest.total_chunks));
        let permits = Arc::new(Semaphore::new(self.config.permits()));

        let mut wave = 0u32;
        while !ledger.is_complete() {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if self.config.max_waves.is_some_and(|max| wave >= max.get()) {
                let missing = ledger.missing();
                warn!(
                    transfer_id = %manifest.transfer_id,
                    waves = wave,
                    "Giving up with {} chunks missing",
                    missing.len()
                );
                return Err(TransferError::ChunksUnavailable { missing });
            }
            wave += 1;

            let missing = ledger.missing();
            debug!(
                transfer_id = %manifest.transfer_id,
                wave,
                missing = missing.len(),
                "Dispatching fetch wave"
            );

            let mut tasks = JoinSet::new();
            for index in missing {
                tasks.spawn(fetch_chunk(FetchJob {
                    store: self.store.clone(),
                    key: manifest.chunk_key(index),
                    transfer_id: manifest.transfer_id.clone(),
                    index,
                    dir: dir.to_path_buf(),
                    ledger: ledger.clone(),
                    permits: permits.clone(),
                    retry: self.config.retry.clone(),
                    cancel: cancel.clone(),
                }));
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(transfer_id = %manifest.transfer_id, "Fetch task failed: {}", e);
                }
            }

            if !ledger.is_complete() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(self.config.rescan_delay) => {}
                }
            }
        }
        Ok(wave)
    }

    /// Run the whole download protocol into `out`.
    pub async fn download_to<W>(
        &self,
        transfer_id: &str,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> Result<Manifest>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let manifest = self.fetch_manifest(transfer_id).await?;
        let staged = self.stage(&manifest, cancel).await?;
        staged.merge_into(out).await?;
        Ok(manifest)
    }
}

struct FetchJob<S> {
    store: Arc<S>,
    key: String,
    transfer_id: String,
    index: u64,
    dir: PathBuf,
    ledger: Arc<ChunkLedger>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

/// Fetch one chunk until it is staged, the retry budget runs out, or the
/// download is cancelled. Only success marks the ledger.
async fn fetch_chunk<S: ObjectStore>(job: FetchJob<S>) {
    let FetchJob {
        store,
        key,
        transfer_id,
        index,
        dir,
        ledger,
        permits,
        retry,
        cancel,
    } = job;

    let _permit = tokio::select! {
        _ = cancel.cancelled() => return,
        permit = permits.acquire_owned() => permit.ok(),
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return,
            fetched = store.get(&key) => fetched,
        };

        match fetched {
            Ok(data) => {
                if let Err(e) = write_staged_chunk(&dir, index, &data).await {
                    warn!(transfer_id = %transfer_id, index, "Failed to stage chunk: {}", e);
                    return;
                }
                ledger.mark(index);
                debug!(transfer_id = %transfer_id, index, attempt, size = data.len(), "Chunk staged");
                return;
            }
            Err(e) => {
                if retry.is_exhausted(attempt) {
                    warn!(transfer_id = %transfer_id, index, attempt, "Chunk fetch attempts exhausted: {}", e);
                    return;
                }
                if attempt % WARN_EVERY_ATTEMPTS == 0 {
                    warn!(transfer_id = %transfer_id, index, attempt, "Chunk still unavailable: {}", e);
                } else {
                    debug!(transfer_id = %transfer_id, index, attempt, "Chunk fetch failed, retrying: {}", e);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(retry.delay_for_attempt(attempt)) => {}
                }
            }
        }
    }
}

/// A transfer whose chunks are all present in its staging area.
#[derive(Debug)]
pub struct StagedTransfer {
    manifest: Manifest,
    staging: StagingArea,
}

impl StagedTransfer {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    /// Write the chunks to `out` in index order, flushing after each one, then
    /// remove the staging area whether or not the merge succeeded.
    pub async fn merge_into<W>(self, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let merged = self.merge_chunks(out).await;
        let transfer_id = self.manifest.transfer_id;
        if let Err(e) = self.staging.remove().await {
            warn!(transfer_id = %transfer_id, "Failed to remove staging area: {}", e);
        }

        match &merged {
            Ok(bytes) => info!(transfer_id = %transfer_id, bytes, "Download delivered"),
            Err(e) => warn!(transfer_id = %transfer_id, "Download aborted: {}", e),
        }
        merged
    }

    async fn merge_chunks<W>(&self, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0;
        for index in 0..self.manifest.total_chunks {
            let file = self
                .staging
                .open_chunk(index)
                .await
                .map_err(|source| TransferError::ChunkMerge { index, source })?;
            total += codec::write_chunk(index, file, &mut *out).await?;
        }
        Ok(total)
    }

    /// Stream the chunks in index order, e.g. as an HTTP response body.
    ///
    /// A merge failure yields one error item and ends the stream. The staging
    /// area is removed when the stream finishes or is dropped.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let StagedTransfer { manifest, staging } = self;

        async_stream::stream! {
            let mut buf = vec![0u8; STREAM_BUF_SIZE];
            let mut delivered: u64 = 0;
            let mut failure = None;

            'chunks: for index in 0..manifest.total_chunks {
                let mut file = match staging.open_chunk(index).await {
                    Ok(f) => f,
                    Err(source) => {
                        failure = Some(TransferError::ChunkMerge { index, source });
                        break 'chunks;
                    }
                };

                loop {
                    match file.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            delivered += n as u64;
                            yield Ok(Bytes::copy_from_slice(&buf[..n]));
                        }
                        Err(source) => {
                            failure = Some(TransferError::ChunkMerge { index, source });
                            break 'chunks;
                        }
                    }
                }
            }

            if let Err(e) = staging.remove().await {
                warn!(transfer_id = %manifest.transfer_id, "Failed to remove staging area: {}", e);
            }
            match failure {
                Some(err) => {
                    warn!(transfer_id = %manifest.transfer_id, "Download aborted: {}", err);
                    yield Err(io::Error::other(err));
                }
                None => {
                    info!(transfer_id = %manifest.transfer_id, bytes = delivered, "Download delivered");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::upload::Uploader;
    use std::time::Duration;

    fn config(staging: &Path) -> TransferConfig {
        TransferConfig {
            chunk_size: 4,
            retry: RetryPolicy::fixed(Duration::from_millis(5)),
            rescan_delay: Duration::from_millis(5),
            staging_dir: staging.to_path_buf(),
            ..TransferConfig::default()
        }
    }

    #[tokio::test]
    async fn missing_manifest_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(Arc::new(MemoryStore::new()), config(root.path()));

        let err = downloader.fetch_manifest("ghost").await.unwrap_err();
        assert!(matches!(err, TransferError::ManifestNotFound { .. }));
    }

    #[tokio::test]
    async fn garbage_manifest_is_reported_as_not_found() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .put(&manifest_key("bad"), Bytes::from_static(b"{oops"))
            .await
            .unwrap();
        let downloader = Downloader::new(store, config(root.path()));

        let err = downloader.fetch_manifest("bad").await.unwrap_err();
        assert!(matches!(err, TransferError::ManifestNotFound { .. }));
    }

    #[tokio::test]
    async fn stream_delivers_chunks_in_order_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(store.clone(), config(root.path()));
        uploader
            .upload_reader("s1", "alpha.txt", &b"abcdefghijklmnopq"[..])
            .await
            .unwrap();

        let downloader = Downloader::new(store, config(root.path()));
        let manifest = downloader.fetch_manifest("s1").await.unwrap();
        let staged = downloader
            .stage(&manifest, &CancellationToken::new())
            .await
            .unwrap();
        let staging_dir = staged.staging_path().to_path_buf();
        assert!(staging_dir.join("chunk_4").exists());

        use futures_util::StreamExt;
        let mut out = Vec::new();
        let mut stream = Box::pin(staged.into_stream());
        while let Some(item) = stream.next().await {
            out.extend_from_slice(&item.unwrap());
        }

        assert_eq!(out, b"abcdefghijklmnopq");
        assert!(!staging_dir.exists());
    }

    async fn staged_upload(root: &Path, transfer_id: &str, data: &'static [u8]) -> StagedTransfer {
        let store = Arc::new(MemoryStore::new());
        Uploader::new(store.clone(), config(root))
            .upload_reader(transfer_id, "s.bin", data)
            .await
            .unwrap();
        let downloader = Downloader::new(store, config(root));
        let manifest = downloader.fetch_manifest(transfer_id).await.unwrap();
        downloader
            .stage(&manifest, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn stream_ends_with_one_error_when_a_chunk_vanishes() {
        use futures_util::StreamExt;

        let root = tempfile::tempdir().unwrap();
        let staged = staged_upload(root.path(), "e1", b"0123456789").await;
        let staging_dir = staged.staging_path().to_path_buf();
        std::fs::remove_file(staging_dir.join("chunk_1")).unwrap();

        let mut stream = Box::pin(staged.into_stream());
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"0123"));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("chunk 1"), "unexpected error: {err}");
        assert!(stream.next().await.is_none());
        assert!(!staging_dir.exists());
    }

    #[tokio::test]
    async fn dropping_stream_midway_removes_staging() {
        use futures_util::StreamExt;

        let root = tempfile::tempdir().unwrap();
        let staged = staged_upload(root.path(), "d1", b"0123456789").await;
        let staging_dir = staged.staging_path().to_path_buf();

        let mut stream = Box::pin(staged.into_stream());
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"0123"));
        drop(stream);

        let mut gone = false;
        for _ in 0..200 {
            if !staging_dir.exists() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone, "staging area survived a dropped stream");
    }

    #[tokio::test]
    async fn oversized_manifest_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let huge = Manifest::new("huge", "huge.bin", 1 << 40);
        store.put(&huge.key(), huge.to_bytes().unwrap()).await.unwrap();

        let downloader = Downloader::new(store, config(root.path()));
        let err = downloader.fetch_manifest("huge").await.unwrap_err();
        match err {
            TransferError::ManifestNotFound { reason, .. } => {
                assert!(reason.contains("limit"), "unexpected reason: {reason}")
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = downloader
            .stage(&huge, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TooManyChunks { .. }));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_staged_chunk_aborts_merge() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(store.clone(), config(root.path()));
        uploader
            .upload_reader("m1", "m.bin", &b"0123456789"[..])
            .await
            .unwrap();

        let downloader = Downloader::new(store, config(root.path()));
        let manifest = downloader.fetch_manifest("m1").await.unwrap();
        let staged = downloader
            .stage(&manifest, &CancellationToken::new())
            .await
            .unwrap();
        let staging_dir = staged.staging_path().to_path_buf();
        std::fs::remove_file(staging_dir.join("chunk_1")).unwrap();

        let mut out = Vec::new();
        let err = staged.merge_into(&mut out).await.unwrap_err();

        assert!(matches!(err, TransferError::ChunkMerge { index: 1, .. }));
        // The prefix before the failure already reached the consumer.
        assert_eq!(out, b"0123");
        assert!(!staging_dir.exists());
    }

    #[tokio::test]
    async fn cancelled_download_stops_and_removes_staging() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        // Manifest with a chunk that never exists.
        store
            .put(&manifest_key("c1"), Manifest::new("c1", "c.bin", 1).to_bytes().unwrap())
            .await
            .unwrap();
        let downloader = Downloader::new(store, config(root.path()));
        let manifest = downloader.fetch_manifest("c1").await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = downloader.stage(&manifest, &cancel).await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn wave_budget_reports_missing_chunks() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .put(&manifest_key("w1"), Manifest::new("w1", "w.bin", 3).to_bytes().unwrap())
            .await
            .unwrap();
        store.put("files/w1/chunk_0", Bytes::from_static(b"a")).await.unwrap();
        store.put("files/w1/chunk_2", Bytes::from_static(b"c")).await.unwrap();

        let mut cfg = config(root.path());
        cfg.retry.max_attempts = std::num::NonZeroU32::new(2);
        cfg.max_waves = std::num::NonZeroU32::new(3);
        let downloader = Downloader::new(store, cfg);
        let manifest = downloader.fetch_manifest("w1").await.unwrap();

        let err = downloader
            .stage(&manifest, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            TransferError::ChunksUnavailable { missing } => assert_eq!(missing, vec![1]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn zero_chunk_transfer_downloads_empty() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .put(&manifest_key("z"), Manifest::new("z", "empty", 0).to_bytes().unwrap())
            .await
            .unwrap();
        let downloader = Downloader::new(store, config(root.path()));

        let mut out = Vec::new();
        let manifest = downloader
            .download_to("z", &mut out, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(manifest.total_chunks, 0);
        assert!(out.is_empty());
    }
}
