/// The synchronization engine facade.
///
/// [`SyncEngine`] owns the durable store, the in-memory broadcaster and the
/// mutation processor, and exposes the three engine operations: apply a
/// mutation batch, pull changes (optionally long-polling), and subscribe to
/// version notifications. Request handlers receive a clone of it; there is
/// no process-wide singleton, so tests can run as many engines as they like.
///
/// # Example
///
/// ```ignore
/// use scorecard_sync::{MutationOp, SyncEngine};
/// use serde_json::json;
/// use std::time::Duration;
///
/// let engine = SyncEngine::start_in_memory().await?;
///
/// engine
///     .mutate("t1", "c1", vec![MutationOp::upsert("score", "5", json!({"strokes": 4}), 0)])
///     .await?;
///
/// let response = engine.sync("t1", 0, Duration::ZERO).await?;
/// assert_eq!(response.changes.len(), 1);
/// ```
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::mutation::MutationProcessor;
use crate::storage::{StoreStats, SyncStore};
use crate::subscriptions::{Broadcaster, Subscription};
use crate::sync;
use crate::types::{Entity, EntityKey, MutationOp, MutationOutcome, SyncResponse};
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;

/// The synchronization engine. Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<SyncStore>,
    broadcaster: Arc<Broadcaster>,
    processor: MutationProcessor,
    config: Arc<SyncConfig>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("db_path", &self.config.db_path)
            .field("broadcaster", &self.broadcaster)
            .finish()
    }
}

impl SyncEngine {
    /// Open the database named by `config` and start an engine on it.
    pub async fn start(config: SyncConfig) -> SyncResult<Self> {
        let path = config.db_path.clone();
        let store = tokio::task::spawn_blocking(move || SyncStore::open(path))
            .await
            .map_err(|e| SyncError::StorageError(format!("open task failed: {}", e)))??;
        tracing::info!("Opened sync store at {}", config.db_path.display());
        Ok(Self::from_store(Arc::new(store), config))
    }

    /// Start an engine on a private in-memory database.
    pub async fn start_in_memory() -> SyncResult<Self> {
        Self::start_in_memory_with(SyncConfig::default()).await
    }

    /// In-memory database with custom policy/capacity settings; `db_path` is ignored.
    pub async fn start_in_memory_with(config: SyncConfig) -> SyncResult<Self> {
        let store = SyncStore::open_in_memory()?;
        Ok(Self::from_store(Arc::new(store), config))
    }

    /// Build an engine around an existing store.
    pub fn from_store(store: Arc<SyncStore>, config: SyncConfig) -> Self {
        let broadcaster = Arc::new(Broadcaster::with_capacity(config.inbox_capacity));
        let processor = MutationProcessor::new(
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            config.delete_policy,
        );
        Self {
            store,
            broadcaster,
            processor,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Apply a mutation batch to `namespace` on behalf of `client_id`.
    ///
    /// The whole batch commits atomically. Operations that lose the
    /// optimistic-concurrency check are listed in
    /// [`MutationOutcome::conflicts`] and otherwise ignored.
    pub async fn mutate(
        &self,
        namespace: &str,
        client_id: &str,
        mutations: Vec<MutationOp>,
    ) -> SyncResult<MutationOutcome> {
        self.processor.apply(namespace, client_id, mutations).await
    }

    /// Changes in `namespace` after `since`, long-polling up to `wait`.
    ///
    /// `wait` is capped at the configured maximum.
    pub async fn sync(
        &self,
        namespace: &str,
        since: i64,
        wait: Duration,
    ) -> SyncResult<SyncResponse> {
        let wait = wait.min(self.config.max_wait);
        sync::pull(&self.store, &self.broadcaster, namespace, since, wait).await
    }

    /// Register a subscriber on `namespace`.
    pub fn subscribe(&self, namespace: &str) -> Subscription {
        self.broadcaster.subscribe(namespace)
    }

    /// Stream of version numbers committed to `namespace` from now on.
    ///
    /// The stream owns its subscription and borrows nothing from `self`.
    pub fn events(&self, namespace: &str) -> impl Stream<Item = i64> + Send + 'static + use<> {
        sync::version_stream(self.subscribe(namespace))
    }

    /// Latest assigned global version.
    pub async fn current_version(&self) -> SyncResult<i64> {
        self.store.run(|s| s.current_version()).await
    }

    /// Current state of one entity.
    pub async fn get_entity(
        &self,
        namespace: &str,
        entity_type: &str,
        id: &str,
    ) -> SyncResult<Option<Entity>> {
        let key = EntityKey::new(namespace, entity_type, id);
        self.store.run(move |s| s.get_entity(&key)).await
    }

    /// All entities of `entity_type` in `namespace`.
    pub async fn list_entities(
        &self,
        namespace: &str,
        entity_type: &str,
    ) -> SyncResult<Vec<Entity>> {
        let ns = namespace.to_string();
        let ty = entity_type.to_string();
        self.store.run(move |s| s.list_entities(&ns, &ty)).await
    }

    /// Store statistics plus live subscriber counts.
    pub async fn stats(&self) -> SyncResult<EngineStats> {
        let store = self.store.run(|s| s.stats()).await?;
        Ok(EngineStats {
            store,
            subscribers: self.broadcaster.total_subscribers(),
            subscribed_namespaces: self.broadcaster.namespace_count(),
        })
    }
}

/// Snapshot returned by [`SyncEngine::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub store: StoreStats,
    pub subscribers: usize,
    pub subscribed_namespaces: usize,
}
