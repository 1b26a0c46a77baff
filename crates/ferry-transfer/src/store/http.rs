use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::info;

use super::ObjectStore;
use crate::error::StoreError;

/// Object store reached over plain HTTP `PUT`/`GET`.
///
/// Objects live at `{endpoint}/{bucket}/{key}`. Intended for S3-compatible
/// gateways and bucket proxies that accept unsigned requests.
pub struct HttpStore {
    client: Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(endpoint: &str, bucket: &str, region: &str) -> Self {
        let endpoint = endpoint.trim_end_matches('/');
        let base_url = if bucket.is_empty() {
            endpoint.to_string()
        } else {
            format!("{}/{}", endpoint, bucket.trim_matches('/'))
        };
        info!("HTTP object store at {} (region {})", base_url, region);
        Self {
            client: Client::new(),
            base_url,
        }
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

impl ObjectStore for HttpStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let resp = self
            .client
            .put(self.object_url(key))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(StoreError::Status {
                key: key.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let resp = self.client.get(self.object_url(key)).send().await?;

        match resp.status() {
            status if status.is_success() => Ok(resp.bytes().await?),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            status => Err(StoreError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}
