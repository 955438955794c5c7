pub mod documents;
pub mod memory;

use std::sync::Arc;

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::config::{BackendConfig, BackendKind};
use crate::storage::{ObjectStore, Storage};
use documents::{DocumentStore, PgDocumentStore};
use memory::{MemoryDocumentStore, MemoryObjectStore};

/// Handles to the document store and the object store, built once from the
/// backend configuration and shared by every view.
#[derive(Clone)]
pub struct Backend {
    name: Arc<str>,
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    pool: Option<PgPool>,
}

impl Backend {
    pub async fn connect(cfg: &BackendConfig) -> anyhow::Result<Self> {
        match cfg.kind {
            BackendKind::Memory => {
                info!(app = %cfg.app_name, "using in-memory backend");
                Ok(Self::in_memory(
                    &cfg.app_name,
                    Arc::new(MemoryDocumentStore::new()),
                    Arc::new(MemoryObjectStore::new(
                        cfg.storage.public_url.clone().unwrap_or_default(),
                    )),
                ))
            }
            BackendKind::Remote => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(&cfg.database_url)
                    .await
                    .context("connect to database")?;

                let storage = Storage::new(&cfg.storage)
                    .await
                    .context("configure object storage")?;

                info!(
                    app = %cfg.app_name,
                    project = %cfg.project_id,
                    bucket = %cfg.storage.bucket,
                    "backend initialized"
                );
                Ok(Self {
                    name: cfg.app_name.as_str().into(),
                    documents: Arc::new(PgDocumentStore::new(pool.clone(), &cfg.project_id)),
                    objects: Arc::new(storage),
                    pool: Some(pool),
                })
            }
        }
    }

    pub fn in_memory(
        name: &str,
        documents: Arc<MemoryDocumentStore>,
        objects: Arc<MemoryObjectStore>,
    ) -> Self {
        Self {
            name: name.into(),
            documents,
            objects,
            pool: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    /// The Postgres pool behind the document store, when there is one.
    pub fn pg_pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }
}
