use std::io;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tracing::info;

use super::ObjectStore;
use crate::error::StoreError;

/// Object store on the local filesystem.
///
/// Each key is a relative path under `root`; `files/{id}/chunk_3` lands at
/// `{root}/files/{id}/chunk_3`. Writes go through a temp file and a rename so a
/// reader never sees a half-written object.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub async fn new(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root).await?;
        info!("Object store directory: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path, refusing anything that could escape `root`.
    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StoreError::Io {
                key: key.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "invalid object key"),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for FsStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let tmp = path.with_file_name(format!(
            ".{}.{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("object"),
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = fs::write(&tmp, &data).await {
            fs::remove_file(&tmp).await.ok();
            return Err(io_err(e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            fs::remove_file(&tmp).await.ok();
            return Err(io_err(e));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}
