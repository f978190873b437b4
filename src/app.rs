use crate::bridge::FetchBridge;
use crate::bridge::rate_limit::RateLimitState;
use crate::cache::LocationCache;
use crate::cache::storage::{BlobStorage, FileStorage};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::peer::graphql::GraphqlSource;
use crate::peer::{LocationSource, PeerGuard, PeerHandle, spawn_peer};
use crate::utils::fmt_duration;
use anyhow::Context;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

/// Main application struct wiring the cache, peer, bridge and coordinator together
pub struct App {
    config: Config,
    coordinator: Coordinator,
    peer: PeerGuard,
}

impl App {
    /// Build the application against the configured GraphQL endpoint
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let graphql = config
            .graphql()
            .context("graphql_url must be set to resolve names")?;
        let source = GraphqlSource::new(graphql).context("Failed to create GraphQL client")?;
        let storage = open_storage(&config).await?;

        Ok(Self::with_source(config, Arc::new(source), storage).await)
    }

    /// Build the application around an arbitrary source and storage backend
    pub async fn with_source(
        config: Config,
        source: Arc<dyn LocationSource>,
        storage: Arc<dyn BlobStorage>,
    ) -> Self {
        let cache = open_cache(&config, storage).await;

        let PeerHandle {
            requests,
            messages,
            guard,
        } = spawn_peer(source);
        let bridge = Arc::new(FetchBridge::new(
            requests,
            messages,
            Arc::new(RateLimitState::new()),
            config.bridge_timeout,
        ));
        bridge.setup();

        let coordinator = Coordinator::new(cache, bridge, config.coordinator());
        info!(
            max_concurrent = config.max_concurrent,
            min_interval = fmt_duration(config.min_interval),
            bridge_timeout = fmt_duration(config.bridge_timeout),
            "coordinator ready"
        );

        Self {
            config,
            coordinator,
            peer: guard,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Persist the cache, then stop the coordinator and the peer.
    pub async fn shutdown(self) {
        self.coordinator.cache().flush().await;
        self.coordinator.shutdown();
        self.peer.shutdown();
        info!("application shut down");
    }
}

/// File-backed storage rooted at the configured directory, created if missing.
pub async fn open_storage(config: &Config) -> Result<Arc<dyn BlobStorage>, anyhow::Error> {
    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create storage directory {}",
                config.storage_dir.display()
            )
        })?;
    Ok(Arc::new(FileStorage::new(&config.storage_dir)))
}

/// Construct the caches and rehydrate them from `storage`.
pub async fn open_cache(config: &Config, storage: Arc<dyn BlobStorage>) -> LocationCache {
    let start = Instant::now();
    let cache = LocationCache::new(config.max_cache_size, storage, config.store());
    let restored = cache.load().await;
    info!(
        restored,
        profiles = cache.profile_count(),
        duration = fmt_duration(start.elapsed()),
        "cache loaded"
    );
    cache
}
