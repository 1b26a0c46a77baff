use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};
use ferry_transfer::{
    Backend, DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, FsStore, HttpStore, MemoryStore,
    RetryPolicy, S3Store, TransferConfig,
};

/// Default request body limit: 4 GB.
const DEFAULT_MAX_UPLOAD_BYTES: usize = 4 * 1024 * 1024 * 1024;

/// How long finished transfers stay visible on `/transfers/{id}`.
const DEFAULT_STATUS_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Where chunks and manifests are kept.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreConfig {
    Memory,
    Fs {
        dir: PathBuf,
    },
    Http {
        endpoint: String,
        bucket: String,
        region: String,
    },
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
    },
}

impl StoreConfig {
    pub async fn connect(&self) -> anyhow::Result<Backend> {
        let backend = match self {
            Self::Memory => Backend::Memory(MemoryStore::new()),
            Self::Fs { dir } => Backend::Fs(
                FsStore::new(dir.clone())
                    .await
                    .with_context(|| format!("opening object store at {}", dir.display()))?,
            ),
            Self::Http {
                endpoint,
                bucket,
                region,
            } => Backend::Http(HttpStore::new(endpoint, bucket, region)),
            Self::S3 {
                bucket,
                region,
                endpoint,
            } => Backend::S3(S3Store::connect(bucket, region, endpoint.as_deref()).await),
        };
        Ok(backend)
    }
}

/// Server settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub store: StoreConfig,
    pub transfer: TransferConfig,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub status_retention: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let store = match env.string("FERRY_STORE_BACKEND", "fs").as_str() {
            "memory" => StoreConfig::Memory,
            "fs" => StoreConfig::Fs {
                dir: env.string("FERRY_STORE_DIR", "./object-store").into(),
            },
            "http" => StoreConfig::Http {
                endpoint: env
                    .get("FERRY_STORE_ENDPOINT")
                    .context("FERRY_STORE_ENDPOINT is required for the http backend")?,
                bucket: env.string("AWS_BUCKET_NAME", ""),
                region: env.string("AWS_REGION", "ap-south-1"),
            },
            "s3" => StoreConfig::S3 {
                bucket: env
                    .get("AWS_BUCKET_NAME")
                    .context("AWS_BUCKET_NAME is required for the s3 backend")?,
                region: env.string("AWS_REGION", "ap-south-1"),
                endpoint: env.get("FERRY_STORE_ENDPOINT"),
            },
            other => bail!(
                "unknown FERRY_STORE_BACKEND {:?} (expected fs, s3, http or memory)",
                other
            ),
        };

        let chunk_size = env.parse("FERRY_CHUNK_SIZE")?.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            bail!("FERRY_CHUNK_SIZE must be greater than zero");
        }

        let max_upload_bytes = env
            .parse("FERRY_MAX_UPLOAD_BYTES")?
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        // A transfer cannot have more chunks than the largest upload could fill.
        let max_chunks = match env.parse::<u64>("FERRY_MAX_CHUNKS")? {
            Some(0) => bail!("FERRY_MAX_CHUNKS must be greater than zero"),
            Some(n) => n,
            None => (max_upload_bytes as u64).div_ceil(chunk_size as u64).max(1),
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            initial_delay: env
                .parse("FERRY_RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: env
                .parse("FERRY_RETRY_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            backoff_factor: env
                .parse("FERRY_RETRY_BACKOFF")?
                .unwrap_or(defaults.backoff_factor),
            max_attempts: env.parse::<NonZeroU32>("FERRY_RETRY_MAX_ATTEMPTS")?,
        };

        let base = TransferConfig::default();
        let transfer = TransferConfig {
            chunk_size,
            retry,
            rescan_delay: env
                .parse("FERRY_RESCAN_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(base.rescan_delay),
            max_waves: env.parse("FERRY_MAX_WAVES")?,
            concurrency: env.parse("FERRY_CONCURRENCY")?.unwrap_or(DEFAULT_CONCURRENCY),
            staging_dir: env.get("FERRY_STAGING_DIR").map(PathBuf::from).unwrap_or(base.staging_dir),
            max_chunks,
        };

        Ok(Self {
            host: env.string("FERRY_HOST", "0.0.0.0"),
            port: env.parse("FERRY_PORT")?.unwrap_or(8080),
            base_url: env.string("BASE_URL", "").trim_end_matches('/').to_string(),
            store,
            transfer,
            upload_dir: env
                .get("FERRY_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("ferry-uploads")),
            max_upload_bytes,
            status_retention: env
                .parse("FERRY_STATUS_RETENTION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STATUS_RETENTION),
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Empty values count as unset.
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.get(name)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .with_context(|| format!("invalid value for {}: {:?}", name, raw))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.base_url, "");
        assert_eq!(
            config.store,
            StoreConfig::Fs {
                dir: "./object-store".into()
            }
        );
        assert_eq!(config.transfer.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.transfer.retry, RetryPolicy::default());
        assert_eq!(config.transfer.rescan_delay, Duration::from_millis(200));
        assert!(config.transfer.max_waves.is_none());
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert_eq!(config.transfer.max_chunks, 820);
        assert_eq!(config.status_retention, Duration::from_secs(86400));
    }

    #[test]
    fn overrides() {
        let config = config(&[
            ("FERRY_PORT", "9000"),
            ("BASE_URL", "https://files.example.com/"),
            ("FERRY_STORE_BACKEND", "http"),
            ("FERRY_STORE_ENDPOINT", "http://127.0.0.1:9000"),
            ("AWS_BUCKET_NAME", "uploads"),
            ("FERRY_CHUNK_SIZE", "1024"),
            ("FERRY_RETRY_DELAY_MS", "50"),
            ("FERRY_RETRY_MAX_ATTEMPTS", "7"),
            ("FERRY_MAX_WAVES", "3"),
            ("FERRY_STAGING_DIR", "/var/tmp/staging"),
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.base_url, "https://files.example.com");
        assert_eq!(
            config.store,
            StoreConfig::Http {
                endpoint: "http://127.0.0.1:9000".into(),
                bucket: "uploads".into(),
                region: "ap-south-1".into(),
            }
        );
        assert_eq!(config.transfer.chunk_size, 1024);
        assert_eq!(config.transfer.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(config.transfer.retry.max_attempts.map(|n| n.get()), Some(7));
        assert_eq!(config.transfer.max_waves.map(|n| n.get()), Some(3));
        assert_eq!(config.transfer.staging_dir, PathBuf::from("/var/tmp/staging"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config(&[("FERRY_PORT", "eighty")]).is_err());
        assert!(config(&[("FERRY_CHUNK_SIZE", "0")]).is_err());
        assert!(config(&[("FERRY_MAX_WAVES", "0")]).is_err());
        assert!(config(&[("FERRY_STORE_BACKEND", "s3")]).is_err());
        assert!(config(&[("FERRY_STORE_BACKEND", "gcs")]).is_err());
        assert!(config(&[("FERRY_MAX_CHUNKS", "0")]).is_err());
        assert!(config(&[("FERRY_STORE_BACKEND", "http")]).is_err());
    }

    #[test]
    fn chunk_limit_follows_upload_limit() {
        let derived = config(&[
            ("FERRY_CHUNK_SIZE", "1000"),
            ("FERRY_MAX_UPLOAD_BYTES", "10001"),
        ])
        .unwrap();
        assert_eq!(derived.transfer.max_chunks, 11);

        let explicit = config(&[("FERRY_CHUNK_SIZE", "1000"), ("FERRY_MAX_CHUNKS", "5")]).unwrap();
        assert_eq!(explicit.transfer.max_chunks, 5);
    }

    #[test]
    fn s3_backend() {
        let aws = config(&[
            ("FERRY_STORE_BACKEND", "s3"),
            ("AWS_BUCKET_NAME", "shares"),
            ("AWS_REGION", "eu-west-1"),
            ("FERRY_STATUS_RETENTION_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(
            aws.store,
            StoreConfig::S3 {
                bucket: "shares".into(),
                region: "eu-west-1".into(),
                endpoint: None,
            }
        );
        assert_eq!(aws.status_retention, Duration::from_secs(60));

        let minio = config(&[
            ("FERRY_STORE_BACKEND", "s3"),
            ("AWS_BUCKET_NAME", "shares"),
            ("FERRY_STORE_ENDPOINT", "http://127.0.0.1:9000"),
        ])
        .unwrap();
        assert_eq!(
            minio.store,
            StoreConfig::S3 {
                bucket: "shares".into(),
                region: "ap-south-1".into(),
                endpoint: Some("http://127.0.0.1:9000".into()),
            }
        );
    }

    #[tokio::test]
    async fn memory_backend_connects() {
        let backend = StoreConfig::Memory.connect().await.unwrap();
        assert_eq!(backend.name(), "memory");
    }
}
