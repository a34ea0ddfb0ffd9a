use std::sync::Arc;
use std::time::Instant;

use camino::Utf8Path;
use serde::Serialize;

use crate::cache::WriteThroughCache;
use crate::checkpoint::{CheckpointStore, ImportCheckpoint};
use crate::config::ResolvedConfig;
use crate::domain::{Clock, Entity, EntityId, EntityKind, EntitySummary};
use crate::error::MirrorError;
use crate::fetch::EntityFetcher;
use crate::import::{CancelToken, ImportCoordinator, ImportOptions, ImportReport};
use crate::store::{EntityStore, SearchHit};

pub use crate::import::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Serialize)]
pub struct EntityResult {
    pub summary: EntitySummary,
    pub entity: Entity,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub query: String,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResult {
    pub database: String,
    pub total: u64,
    pub items: u64,
    pub properties: u64,
    pub checkpoint: Option<ImportCheckpoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexResult {
    pub indexed: u64,
    pub elapsed_secs: f64,
}

/// Read API over the mirror: local store, write-through cache and import.
pub struct App<F: EntityFetcher> {
    config: ResolvedConfig,
    store: Arc<EntityStore>,
    cache: WriteThroughCache<F>,
    clock: Arc<dyn Clock>,
}

impl<F: EntityFetcher> App<F> {
    pub fn open(config: ResolvedConfig, fetcher: F, clock: Arc<dyn Clock>) -> Result<Self, MirrorError> {
        let store = Arc::new(EntityStore::open(
            config.database_path.clone(),
            config.search_settings(),
        )?);
        Ok(Self::new(config, store, fetcher, clock))
    }

    pub fn new(config: ResolvedConfig, store: Arc<EntityStore>, fetcher: F, clock: Arc<dyn Clock>) -> Self {
        let cache = WriteThroughCache::new(
            Arc::clone(&store),
            fetcher,
            Arc::clone(&clock),
            config.cache_policy(),
        );
        Self {
            config,
            store,
            cache,
            clock,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn get(&self, id: &str, sink: &dyn ProgressSink) -> Result<EntityResult, MirrorError> {
        let id: EntityId = id.parse()?;
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; looking up {id}"),
            elapsed: None,
        });
        let entity = self.cache.get(&id)?;
        Ok(self.entity_result(entity))
    }

    /// Local store only; a miss is `NotFound`.
    pub fn get_offline(&self, id: &str) -> Result<EntityResult, MirrorError> {
        let id: EntityId = id.parse()?;
        let entity = self
            .cache
            .get_local(&id)?
            .ok_or_else(|| MirrorError::NotFound(id.to_string()))?;
        Ok(self.entity_result(entity))
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<SearchResult, MirrorError> {
        let hits = self.store.search(query, limit)?;
        Ok(SearchResult {
            query: query.to_string(),
            hits,
        })
    }

    pub fn stats(&self) -> Result<StatsResult, MirrorError> {
        let stats = self.store.stats()?;
        let checkpoint = CheckpointStore::for_database(self.store.path()).load()?;
        Ok(StatsResult {
            database: self.store.path().to_string(),
            total: stats.total,
            items: stats.by_kind.get(&EntityKind::Item).copied().unwrap_or(0),
            properties: stats.by_kind.get(&EntityKind::Property).copied().unwrap_or(0),
            checkpoint,
        })
    }

    pub fn import(
        &self,
        dump: Option<&Utf8Path>,
        options: ImportOptions,
        cancel: CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<ImportReport, MirrorError> {
        let dump = dump.unwrap_or(&self.config.dump_path);
        let mut coordinator = ImportCoordinator::new(
            self.store.clone(),
            CheckpointStore::for_database(self.store.path()),
            Arc::clone(&self.clock),
            options,
        )
        .with_cancel_token(cancel);
        coordinator.run(dump, sink)
    }

    pub fn reindex(&self, sink: &dyn ProgressSink) -> Result<ReindexResult, MirrorError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: "phase=Reindex; rebuilding search index".to_string(),
            elapsed: None,
        });
        let indexed = self.store.rebuild_search_index()?;
        let elapsed = started.elapsed();
        tracing::info!(indexed, elapsed_secs = elapsed.as_secs_f64(), "search index rebuilt");
        sink.event(ProgressEvent {
            message: format!("phase=Reindex; indexed {indexed} entities"),
            elapsed: Some(elapsed),
        });
        Ok(ReindexResult {
            indexed,
            elapsed_secs: elapsed.as_secs_f64(),
        })
    }

    fn entity_result(&self, entity: Entity) -> EntityResult {
        EntityResult {
            summary: entity.summary(&self.config.display_language),
            entity,
        }
    }
}
