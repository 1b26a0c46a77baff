//! Blob storage consumed by the transfer engine.
//!
//! The engine only ever needs `put` and `get` on opaque string keys; chunk
//! and manifest keys are built in [`crate::manifest`].

mod fs;
mod http;
mod memory;
mod s3;

use std::future::Future;

use bytes::Bytes;

pub use fs::FsStore;
pub use http::HttpStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

use crate::error::StoreError;

/// Durable key/value blob store.
pub trait ObjectStore: Send + Sync + 'static {
    /// Store `data` under `key`, replacing anything already there.
    fn put(&self, key: &str, data: Bytes) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fetch the blob stored under `key`.
    fn get(&self, key: &str) -> impl Future<Output = Result<Bytes, StoreError>> + Send;
}

/// Store backend selected at startup.
pub enum Backend {
    Memory(MemoryStore),
    Fs(FsStore),
    Http(HttpStore),
    S3(S3Store),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Fs(_) => "fs",
            Self::Http(_) => "http",
            Self::S3(_) => "s3",
        }
    }
}

impl ObjectStore for Backend {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.put(key, data).await,
            Self::Fs(store) => store.put(key, data).await,
            Self::Http(store) => store.put(key, data).await,
            Self::S3(store) => store.put(key, data).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        match self {
            Self::Memory(store) => store.get(key).await,
            Self::Fs(store) => store.get(key).await,
            Self::Http(store) => store.get(key).await,
            Self::S3(store) => store.get(key).await,
        }
    }
}
