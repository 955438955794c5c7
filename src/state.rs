use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::AppConfig;
use crate::dishes::list::MenuFeed;
use crate::images::upload::UploadRegistry;

const UPLOAD_SWEEP_EVERY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub backend: Backend,
    pub config: Arc<AppConfig>,
    pub uploads: UploadRegistry,
    pub feed: MenuFeed,
    /// Cancelled on graceful shutdown; uploads and card writes hold children.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn init(shutdown: CancellationToken) -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;
        let backend = Backend::connect(&config.backend).await?;
        let state = Self::from_parts(backend, config, shutdown);
        state.uploads.spawn_sweeper(UPLOAD_SWEEP_EVERY);
        Ok(state)
    }

    pub fn from_parts(backend: Backend, config: AppConfig, shutdown: CancellationToken) -> Self {
        let uploads = UploadRegistry::new(
            backend.objects().clone(),
            config.upload_chunk_bytes,
            shutdown.clone(),
        );
        Self {
            backend,
            config: Arc::new(config),
            uploads,
            feed: MenuFeed::new(),
            shutdown,
        }
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        let (state, _, _) = Self::fake_with_stores(AppConfig::memory());
        state
    }

    /// State over in-memory stores, returned alongside so tests can inspect
    /// them and inject failures.
    #[cfg(test)]
    pub fn fake_with_stores(
        config: AppConfig,
    ) -> (
        Self,
        Arc<crate::backend::memory::MemoryDocumentStore>,
        Arc<crate::backend::memory::MemoryObjectStore>,
    ) {
        use crate::backend::memory::{MemoryDocumentStore, MemoryObjectStore};

        let docs = Arc::new(MemoryDocumentStore::new());
        let objects = Arc::new(MemoryObjectStore::new("memory://dishes"));
        let backend = Backend::in_memory("test", docs.clone(), objects.clone());
        (
            Self::from_parts(backend, config, CancellationToken::new()),
            docs,
            objects,
        )
    }
}
