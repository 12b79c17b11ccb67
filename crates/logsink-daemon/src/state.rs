//! Shared daemon state.
//!
//! One [`AppState`] is built at startup and handed to every handler and
//! background worker. There is no hidden process-wide state; the
//! singletons (blacklist cache, embedding worker, cleanup scheduler)
//! live here.

use std::sync::Arc;

use logsink_core::{Config, Result};
use tokio::sync::watch;

use crate::admission::Admission;
use crate::blacklist_cache::BlacklistCache;
use crate::cleanup::CleanupScheduler;
use crate::embedding::{EmbeddingWorker, HttpEmbeddingProvider};
use crate::images::ImageStore;
use crate::lifecycle::Lifecycle;
use crate::llm::{HttpLlmScorer, SimilarityScorer};
use crate::store::Store;

/// Everything handlers and workers share.
pub struct AppState {
    /// The loaded configuration.
    pub config: Config,
    /// The persistent store.
    pub store: Store,
    /// Screenshot storage.
    pub images: ImageStore,
    /// Blacklist cache singleton.
    pub blacklist: Arc<BlacklistCache>,
    /// Admission pipeline.
    pub admission: Admission,
    /// Lifecycle engine.
    pub lifecycle: Lifecycle,
    /// Embedding worker singleton.
    pub embedding: Arc<EmbeddingWorker>,
    /// Cleanup scheduler singleton.
    pub cleanup: Arc<CleanupScheduler>,
    /// Shutdown signal for background workers.
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Wires up the store, caches, engines, and workers from
    /// configuration.
    pub fn build(config: Config) -> Result<Arc<Self>> {
        let store = Store::open(&config.store.path, config.store.busy_timeout)?;
        Self::build_with_store(config, store)
    }

    /// Same as [`Self::build`], with a caller-provided store. Used by
    /// integration tests to run against an in-memory database.
    pub fn build_with_store(config: Config, store: Store) -> Result<Arc<Self>> {
        let images = ImageStore::new(&config.storage)?;
        let blacklist = Arc::new(BlacklistCache::new(
            store.clone(),
            images.clone(),
            config.blacklist.clone(),
        )?);
        let admission = Admission::new(
            store.clone(),
            images.clone(),
            Arc::clone(&blacklist),
            config.embedding.enabled,
        );
        let lifecycle = Lifecycle::new(store.clone(), images.clone());

        let provider = if config.embedding.enabled {
            Some(Arc::new(HttpEmbeddingProvider::new(&config.embedding)?)
                as Arc<dyn crate::embedding::EmbeddingProvider>)
        } else {
            None
        };
        let embedding = EmbeddingWorker::new(store.clone(), provider, config.embedding.clone());

        let scorer = if config.llm.enabled {
            Some(Arc::new(HttpLlmScorer::new(&config.llm)?) as Arc<dyn SimilarityScorer>)
        } else {
            None
        };
        let cleanup = CleanupScheduler::new(
            store.clone(),
            images.clone(),
            config.cleanup.clone(),
            scorer,
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            images,
            blacklist,
            admission,
            lifecycle,
            embedding,
            cleanup,
            shutdown,
        }))
    }

    /// Spawns the background workers onto the current runtime.
    pub fn spawn_workers(self: &Arc<Self>) {
        let embedding = Arc::clone(&self.embedding);
        tokio::spawn(embedding.run(self.shutdown.subscribe()));
        let cleanup = Arc::clone(&self.cleanup);
        tokio::spawn(cleanup.run_loop(self.shutdown.subscribe()));
    }

    /// Signals the background workers to stop.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
