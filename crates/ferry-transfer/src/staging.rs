use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

/// Local directory holding fetched chunks for one download.
///
/// Chunks arrive out of order and wait here until the merge reaches them.
/// The directory belongs to exactly one download and is removed when that
/// download ends: explicitly through [`StagingArea::remove`], or on drop if the
/// download is abandoned early.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
    removed: bool,
}

/// File name of a staged chunk.
pub fn chunk_file_name(index: u64) -> String {
    format!("chunk_{}", index)
}

impl StagingArea {
    /// Create a fresh staging directory for `transfer_id` under `root`.
    pub async fn create(root: &Path, transfer_id: &str) -> io::Result<Self> {
        let dir = root.join(format!("{}.{}", transfer_id, uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir).await?;
        debug!("Staging area created at {}", dir.display());
        Ok(Self {
            dir,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_path(&self, index: u64) -> PathBuf {
        self.dir.join(chunk_file_name(index))
    }

    pub async fn open_chunk(&self, index: u64) -> io::Result<fs::File> {
        fs::File::open(self.chunk_path(index)).await
    }

    /// Delete the directory and everything in it.
    pub async fn remove(mut self) -> io::Result<()> {
        self.removed = true;
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                debug!("Staging area {} removed", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Staging area {} already gone", self.dir.display());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let dir = std::mem::take(&mut self.dir);
        // Removing a large tree blocks; keep it off the async workers.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_abandoned(&dir));
            }
            Err(_) => remove_abandoned(&dir),
        }
    }
}

fn remove_abandoned(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!("Abandoned staging area {} removed", dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staging area {}: {}", dir.display(), e),
    }
}

/// Write a fetched chunk into the staging directory at `dir`.
pub(crate) async fn write_staged_chunk(dir: &Path, index: u64, data: &[u8]) -> io::Result<()> {
    fs::write(dir.join(chunk_file_name(index)), data).await
}
