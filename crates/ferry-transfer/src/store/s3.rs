use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tracing::info;

use super::ObjectStore;
use crate::error::StoreError;

/// Object store on an S3 bucket, reached through the AWS SDK.
///
/// Credentials come from the SDK's default provider chain
/// (`AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY`, profile, instance role).
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a client from the ambient AWS configuration.
    ///
    /// `endpoint` points the client at an S3-compatible service (MinIO,
    /// localstack) and switches to path-style addressing.
    pub async fn connect(bucket: &str, region: &str, endpoint: Option<&str>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(endpoint.is_some())
            .build();
        info!(
            "S3 object store: bucket {} in {}{}",
            bucket,
            region,
            endpoint.map(|e| format!(" via {}", e)).unwrap_or_default()
        );
        Self::from_client(Client::from_conf(config), bucket)
    }

    pub fn from_client(client: Client, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

impl ObjectStore for S3Store {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StoreError::S3Put {
                key: key.to_string(),
                source: Box::new(e),
            })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                });
            }
            Err(e) => {
                return Err(StoreError::S3Get {
                    key: key.to_string(),
                    source: Box::new(e),
                });
            }
        };

        let body = output.body.collect().await.map_err(|source| StoreError::S3Body {
            key: key.to_string(),
            source,
        })?;
        Ok(body.into_bytes())
    }
}
