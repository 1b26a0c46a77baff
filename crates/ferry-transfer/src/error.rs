use std::io;

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStreamError;

/// Errors returned by an [`ObjectStore`](crate::store::ObjectStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("object store returned {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("S3 GetObject failed for {key}: {source}")]
    S3Get {
        key: String,
        #[source]
        source: Box<SdkError<GetObjectError>>,
    },

    #[error("S3 PutObject failed for {key}: {source}")]
    S3Put {
        key: String,
        #[source]
        source: Box<SdkError<PutObjectError>>,
    },

    #[error("failed to read S3 object body for {key}: {source}")]
    S3Body {
        key: String,
        #[source]
        source: ByteStreamError,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from splitting a source into chunks or writing chunks back out.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to read source: {0}")]
    Read(#[source] io::Error),

    #[error("failed to merge chunk {index}: {source}")]
    Merge {
        index: u64,
        #[source]
        source: io::Error,
    },
}

/// Errors produced by the upload and download orchestrators.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid transfer id: {0:?}")]
    InvalidTransferId(String),

    #[error("failed to read local file: {0}")]
    IoRead(#[source] io::Error),

    #[error("failed to upload chunk {index}: {source}")]
    ChunkUpload {
        index: u64,
        #[source]
        source: StoreError,
    },

    #[error("failed to write manifest: {0}")]
    ManifestWrite(#[source] StoreError),

    #[error("failed to encode manifest: {0}")]
    ManifestEncode(#[source] serde_json::Error),

    #[error("transfer has {total} chunks, limit is {max}")]
    TooManyChunks { total: u64, max: u64 },

    #[error("manifest not found for transfer {transfer_id}: {reason}")]
    ManifestNotFound { transfer_id: String, reason: String },

    #[error("failed to merge chunk {index}: {source}")]
    ChunkMerge {
        index: u64,
        #[source]
        source: io::Error,
    },

    #[error("staging area error: {0}")]
    Staging(#[source] io::Error),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("chunks still unavailable after retry budget: {missing:?}")]
    ChunksUnavailable { missing: Vec<u64> },

    #[error("transfer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<CodecError> for TransferError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Read(source) => Self::IoRead(source),
            CodecError::Merge { index, source } => Self::ChunkMerge { index, source },
        }
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
