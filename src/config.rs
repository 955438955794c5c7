use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

use crate::dishes::card::ReconciliationPolicy;

pub const DEFAULT_PLACEHOLDER_IMAGE: &str = "https://via.placeholder.com/300";
pub const DEFAULT_UPLOAD_CHUNK_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Remote,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Base URL under which bucket objects are publicly readable. When unset,
    /// download links are presigned.
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub app_name: String,
    pub project_id: String,
    pub database_url: String,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub placeholder_image: String,
    pub upload_chunk_bytes: usize,
    pub availability_policy: ReconciliationPolicy,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let kind = match std::env::var("BACKEND").as_deref() {
            Ok("memory") => BackendKind::Memory,
            Ok("remote") | Err(_) => BackendKind::Remote,
            Ok(other) => anyhow::bail!("unknown BACKEND {other:?}; expected remote or memory"),
        };

        let backend = match kind {
            BackendKind::Remote => BackendConfig {
                kind,
                app_name: app_name(),
                project_id: std::env::var("PROJECT_ID").context("PROJECT_ID")?,
                database_url: std::env::var("DATABASE_URL").context("DATABASE_URL")?,
                storage: StorageConfig {
                    endpoint: std::env::var("STORAGE_ENDPOINT").context("STORAGE_ENDPOINT")?,
                    bucket: std::env::var("STORAGE_BUCKET").context("STORAGE_BUCKET")?,
                    access_key: std::env::var("STORAGE_ACCESS_KEY")
                        .context("STORAGE_ACCESS_KEY")?,
                    secret_key: std::env::var("STORAGE_SECRET_KEY")
                        .context("STORAGE_SECRET_KEY")?,
                    region: std::env::var("STORAGE_REGION").unwrap_or_else(|_| "us-east-1".into()),
                    public_url: std::env::var("STORAGE_PUBLIC_URL").ok(),
                },
            },
            BackendKind::Memory => BackendConfig::memory(),
        };

        let availability_policy = reconcile_policy(
            std::env::var("AVAILABILITY_RECONCILE").ok().as_deref(),
            env_parse("AVAILABILITY_RETRY_ATTEMPTS", 3),
            env_parse("AVAILABILITY_RETRY_BASE_MS", 200),
        )?;

        Ok(Self {
            backend,
            placeholder_image: std::env::var("PLACEHOLDER_IMAGE_URL")
                .unwrap_or_else(|_| DEFAULT_PLACEHOLDER_IMAGE.into()),
            upload_chunk_bytes: chunk_size(
                kind,
                env_parse("UPLOAD_CHUNK_BYTES", DEFAULT_UPLOAD_CHUNK_BYTES),
            ),
            availability_policy,
        })
    }

    /// Configuration for in-process stores with every default applied.
    #[cfg(test)]
    pub fn memory() -> Self {
        Self {
            backend: BackendConfig::memory(),
            placeholder_image: DEFAULT_PLACEHOLDER_IMAGE.into(),
            upload_chunk_bytes: DEFAULT_UPLOAD_CHUNK_BYTES,
            availability_policy: ReconciliationPolicy::Revert,
        }
    }
}

impl BackendConfig {
    fn memory() -> Self {
        Self {
            kind: BackendKind::Memory,
            app_name: app_name(),
            project_id: std::env::var("PROJECT_ID").unwrap_or_else(|_| "local".into()),
            database_url: String::new(),
            storage: StorageConfig {
                endpoint: "memory".into(),
                bucket: "dishes".into(),
                access_key: String::new(),
                secret_key: String::new(),
                region: "us-east-1".into(),
                public_url: Some("memory://dishes".into()),
            },
        }
    }
}

fn app_name() -> String {
    std::env::var("APP_NAME").unwrap_or_else(|_| "[DEFAULT]".into())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// S3 rejects multipart parts under 5 MiB (except the last), so the remote
/// backend never goes below that.
fn chunk_size(kind: BackendKind, requested: usize) -> usize {
    match kind {
        BackendKind::Remote if requested < DEFAULT_UPLOAD_CHUNK_BYTES => {
            warn!(
                requested,
                min = DEFAULT_UPLOAD_CHUNK_BYTES,
                "UPLOAD_CHUNK_BYTES below the S3 part minimum; using the minimum"
            );
            DEFAULT_UPLOAD_CHUNK_BYTES
        }
        _ => requested.max(1),
    }
}

fn reconcile_policy(
    name: Option<&str>,
    attempts: u32,
    base_ms: u64,
) -> anyhow::Result<ReconciliationPolicy> {
    match name {
        None | Some("revert") => Ok(ReconciliationPolicy::Revert),
        Some("retry") => Ok(ReconciliationPolicy::Retry {
            attempts: attempts.max(1),
            base_delay: Duration::from_millis(base_ms),
        }),
        Some(other) => anyhow::bail!("unknown AVAILABILITY_RECONCILE {other:?}"),
    }
}
