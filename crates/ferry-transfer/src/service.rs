use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::download::{Downloader, StagedTransfer};
use crate::error::{Result, TransferError};
use crate::manifest::Manifest;
use crate::status::{TransferRecord, TransferRegistry};
use crate::store::ObjectStore;
use crate::upload::Uploader;

/// Longest transfer id accepted from clients.
const MAX_TRANSFER_ID_LEN: usize = 128;

/// Name used when a client supplies nothing usable.
const FALLBACK_FILE_NAME: &str = "download";

/// Acknowledgement for a single client-chunked upload.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkAck {
    pub message: &'static str,
    #[serde(rename = "fileID")]
    pub transfer_id: String,
    #[serde(rename = "chunkNo")]
    pub index: u64,
    #[serde(rename = "s3_key")]
    pub key: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
}

/// Entry point the HTTP layer talks to.
///
/// Cheap to clone; clones share the store, the orchestrators and the status
/// registry.
pub struct TransferService<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    uploader: Uploader<S>,
    downloader: Downloader<S>,
    registry: TransferRegistry,
    config: TransferConfig,
}

impl<S> Clone for TransferService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: ObjectStore> TransferService<S> {
    pub fn new(store: Arc<S>, config: TransferConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                uploader: Uploader::new(store.clone(), config.clone()),
                downloader: Downloader::new(store, config.clone()),
                registry: TransferRegistry::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Accept a spooled upload and push it to the store in the background.
    ///
    /// Returns the new transfer id immediately. Progress and failures are
    /// visible only through [`TransferService::status`]. The spool file is
    /// deleted once the background upload ends, successfully or not.
    pub fn begin_upload(&self, spool: PathBuf, display_name: &str) -> String {
        let transfer_id = Uuid::new_v4().to_string();
        let file_name = sanitize_file_name(display_name);
        self.inner.registry.register(&transfer_id, &file_name);
        info!(transfer_id = %transfer_id, file_name = %file_name, "Upload accepted");

        let service = self.clone();
        let id = transfer_id.clone();
        tokio::spawn(async move {
            service.run_upload(&id, &file_name, &spool).await;
        });

        transfer_id
    }

    async fn run_upload(&self, transfer_id: &str, file_name: &str, spool: &Path) {
        let registry = &self.inner.registry;
        registry.mark_uploading(transfer_id);

        let result = match tokio::fs::File::open(spool).await {
            Ok(file) => {
                self.inner
                    .uploader
                    .upload_reader(transfer_id, file_name, file)
                    .await
            }
            Err(e) => Err(TransferError::IoRead(e)),
        };

        match result {
            Ok(manifest) => {
                registry.mark_complete(transfer_id, manifest.total_chunks);
            }
            Err(e) => {
                warn!(transfer_id, "Upload failed: {}", e);
                registry.mark_failed(transfer_id, e.to_string());
            }
        }

        if let Err(e) = tokio::fs::remove_file(spool).await {
            warn!(transfer_id, "Failed to remove spool file {}: {}", spool.display(), e);
        }
    }

    /// Store one chunk a client split itself. No manifest is written.
    pub async fn upload_chunk(
        &self,
        transfer_id: &str,
        index: u64,
        display_name: &str,
        data: Bytes,
    ) -> Result<ChunkAck> {
        validate_transfer_id(transfer_id)?;
        let size = data.len();
        let key = self.inner.uploader.put_chunk(transfer_id, index, data).await?;
        info!(transfer_id, index, size, "Chunk stored");

        Ok(ChunkAck {
            message: "Chunk uploaded successfully",
            transfer_id: transfer_id.to_string(),
            index,
            key,
            file_name: sanitize_file_name(display_name),
        })
    }

    /// Write the manifest for a client-chunked upload, making it downloadable.
    ///
    /// The chunks themselves are not checked; a missing chunk shows up as a
    /// download that keeps retrying it.
    pub async fn complete_upload(
        &self,
        transfer_id: &str,
        display_name: &str,
        total_chunks: u64,
    ) -> Result<Manifest> {
        validate_transfer_id(transfer_id)?;
        let manifest = Manifest::new(transfer_id, sanitize_file_name(display_name), total_chunks);
        self.inner.uploader.write_manifest(&manifest).await?;
        info!(transfer_id, total_chunks, "Client-chunked upload completed");
        Ok(manifest)
    }

    /// Fetch the manifest and stage every chunk, ready to be streamed.
    pub async fn download(
        &self,
        transfer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StagedTransfer> {
        validate_transfer_id(transfer_id)?;
        let downloader = &self.inner.downloader;
        let manifest = downloader.fetch_manifest(transfer_id).await?;
        downloader.stage(&manifest, cancel).await
    }

    pub fn status(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.inner.registry.get(transfer_id)
    }

    /// Drop status records of transfers that finished more than `retention` ago.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        self.inner.registry.prune_finished(retention)
    }
}

/// Transfer ids become object keys and staging paths, so only a conservative
/// character set is accepted.
pub fn validate_transfer_id(transfer_id: &str) -> Result<()> {
    let valid = !transfer_id.is_empty()
        && transfer_id.len() <= MAX_TRANSFER_ID_LEN
        && transfer_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TransferError::InvalidTransferId(transfer_id.to_string()))
    }
}

/// Reduce a client-supplied name to something safe for `Content-Disposition`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != '"')
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::manifest_key;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn completion_beyond_chunk_limit_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let config = TransferConfig {
            max_chunks: 1000,
            ..TransferConfig::default()
        };
        let service = TransferService::new(store.clone(), config);

        let err = service
            .complete_upload("greedy", "x.bin", 1 << 40)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TooManyChunks { max: 1000, .. }));
        assert!(!store.contains(&manifest_key("greedy")));

        let err = service
            .download("greedy", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ManifestNotFound { .. }));

        service.complete_upload("modest", "x.bin", 1000).await.unwrap();
        assert!(store.contains(&manifest_key("modest")));
    }

    #[test]
    fn transfer_ids_are_restricted() {
        assert!(validate_transfer_id("0b9e5c1e-5f0a-4c52-9f1e-1d2a3b4c5d6e").is_ok());
        assert!(validate_transfer_id("client_chunked-01").is_ok());
        for bad in ["", "../x", "a/b", "a b", "x.json"] {
            assert!(validate_transfer_id(bad).is_err(), "{bad:?} accepted");
        }
        assert!(validate_transfer_id(&"a".repeat(MAX_TRANSFER_ID_LEN + 1)).is_err());
    }

    #[test]
    fn file_names_are_reduced_to_basename() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("/home/u/report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("C:\\Users\\u\\a b.txt"), "a b.txt");
        assert_eq!(sanitize_file_name("evil\"\r\nname.txt"), "evilname.txt");
        assert_eq!(sanitize_file_name("dir/"), "download");
        assert_eq!(sanitize_file_name(".."), "download");
    }
}
