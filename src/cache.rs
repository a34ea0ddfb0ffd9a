//! Write-through cache over the entity store.
//!
//! Local misses (and expired API-sourced rows) are fetched upstream, decoded,
//! written to the store and returned. Concurrent misses for one id share a
//! single upstream call. A redirected id is stored under its target along
//! with the redirect, so later lookups of either id stay local.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

use crate::decoder::{ApiPayload, DecodeContext, decode_api_payload};
use crate::domain::{Clock, Entity, EntityId, Source};
use crate::error::MirrorError;
use crate::fetch::{EntityFetcher, FetchOutcome};
use crate::store::EntityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Age after which an API-sourced row is fetched again.
    pub ttl: TimeDelta,
    /// How long a not-found or unavailable answer is remembered.
    pub negative_ttl: TimeDelta,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: TimeDelta::days(365),
            negative_ttl: TimeDelta::minutes(5),
        }
    }
}

pub struct WriteThroughCache<F: EntityFetcher> {
    store: Arc<EntityStore>,
    fetcher: F,
    clock: Arc<dyn Clock>,
    policy: CachePolicy,
    in_flight: Mutex<HashMap<EntityId, Arc<Flight>>>,
    negative: Mutex<HashMap<EntityId, NegativeEntry>>,
}

struct NegativeEntry {
    expires_at: DateTime<Utc>,
    error: MirrorError,
}

impl<F: EntityFetcher> WriteThroughCache<F> {
    pub fn new(
        store: Arc<EntityStore>,
        fetcher: F,
        clock: Arc<dyn Clock>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            store,
            fetcher,
            clock,
            policy,
            in_flight: Mutex::new(HashMap::new()),
            negative: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Store lookup only; never calls upstream.
    pub fn get_local(&self, id: &EntityId) -> Result<Option<Entity>, MirrorError> {
        self.store.get(id)
    }

    pub fn get(&self, id: &EntityId) -> Result<Entity, MirrorError> {
        let cached = self.store.get(id)?;
        match &cached {
            Some(entity) if !self.is_stale(entity) => return Ok(entity.clone()),
            Some(entity) => {
                if self.negative_hit(id).is_some() {
                    tracing::debug!(%id, "upstream recently failed; serving expired entity");
                    return Ok(entity.clone());
                }
                tracing::debug!(%id, "cached entity expired; refreshing");
            }
            None => {
                if let Some(err) = self.negative_hit(id) {
                    tracing::debug!(%id, "negative cache hit");
                    return Err(err);
                }
            }
        }

        match self.fetch_coalesced(id) {
            Ok(entity) => Ok(entity),
            Err(err) => match cached {
                Some(stale) => {
                    tracing::warn!(%id, error = %err, "refresh failed; serving expired entity");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    pub fn is_stale(&self, entity: &Entity) -> bool {
        entity.source == Source::Api && self.clock.now() - entity.fetched_at > self.policy.ttl
    }

    fn fetch_coalesced(&self, id: &EntityId) -> Result<Entity, MirrorError> {
        let (flight, leader) = {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| MirrorError::UpstreamUnavailable("in-flight lock poisoned".to_string()))?;
            match in_flight.get(id) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight::default());
                    in_flight.insert(id.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            tracing::debug!(%id, "joining in-flight fetch");
            return flight.wait();
        }

        let guard = FlightGuard {
            cache_flights: &self.in_flight,
            flight: &flight,
            id,
        };
        let result = self.fill(id);
        guard.finish(result.clone());
        result
    }

    fn fill(&self, id: &EntityId) -> Result<Entity, MirrorError> {
        // Another flight may have filled the row, or failed, since our miss.
        if let Some(entity) = self.store.get(id)? {
            if !self.is_stale(&entity) {
                return Ok(entity);
            }
        }
        if let Some(err) = self.negative_hit(id) {
            return Err(err);
        }

        let now = self.clock.now();
        tracing::debug!(%id, "fetching entity upstream");
        let outcome = match self.fetcher.fetch(id) {
            Ok(outcome) => outcome,
            Err(err) => {
                if matches!(
                    err,
                    MirrorError::UpstreamUnavailable(_) | MirrorError::UpstreamStatus { .. }
                ) {
                    self.remember_negative(id, now, err.clone());
                }
                return Err(err);
            }
        };

        let payload = match outcome {
            FetchOutcome::Found(payload) => payload,
            FetchOutcome::NotFound => {
                let err = MirrorError::NotFound(id.to_string());
                self.remember_negative(id, now, err.clone());
                return Err(err);
            }
        };

        let ctx = DecodeContext::new(Source::Api, now);
        match decode_api_payload(id, &payload.bytes, &ctx)? {
            ApiPayload::Entity(entity) => {
                let token = self.store.upsert_redirected(id, &entity)?;
                self.forget_negative(id);
                tracing::info!(%id, resolved = %entity.id, "cached entity from upstream");
                if token.stale > 0 {
                    tracing::debug!(%id, "stored copy is newer than fetched entity");
                    return Ok(self.store.get(&entity.id)?.unwrap_or(entity));
                }
                Ok(entity)
            }
            ApiPayload::Missing => {
                let err = MirrorError::NotFound(id.to_string());
                self.remember_negative(id, now, err.clone());
                Err(err)
            }
        }
    }

    fn negative_hit(&self, id: &EntityId) -> Option<MirrorError> {
        let mut negative = self.negative.lock().ok()?;
        let now = self.clock.now();
        match negative.get(id) {
            Some(entry) if now < entry.expires_at => Some(entry.error.clone()),
            Some(_) => {
                negative.remove(id);
                None
            }
            None => None,
        }
    }

    fn remember_negative(&self, id: &EntityId, now: DateTime<Utc>, error: MirrorError) {
        if self.policy.negative_ttl <= TimeDelta::zero() {
            return;
        }
        if let Ok(mut negative) = self.negative.lock() {
            negative.insert(
                id.clone(),
                NegativeEntry {
                    expires_at: now + self.policy.negative_ttl,
                    error,
                },
            );
        }
    }

    fn forget_negative(&self, id: &EntityId) {
        if let Ok(mut negative) = self.negative.lock() {
            negative.remove(id);
        }
    }
}

#[derive(Default)]
struct Flight {
    result: Mutex<Option<Result<Entity, MirrorError>>>,
    done: Condvar,
}

impl Flight {
    fn wait(&self) -> Result<Entity, MirrorError> {
        let poisoned = || MirrorError::UpstreamUnavailable("in-flight fetch lock poisoned".to_string());
        let mut slot = self.result.lock().map_err(|_| poisoned())?;
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.done.wait(slot).map_err(|_| poisoned())?;
        }
    }

    fn complete(&self, result: Result<Entity, MirrorError>) {
        if let Ok(mut slot) = self.result.lock() {
            if slot.is_none() {
                *slot = Some(result);
            }
        }
        self.done.notify_all();
    }
}

/// Publishes the leader's result and unregisters the flight, also when the
/// leader unwinds.
struct FlightGuard<'a> {
    cache_flights: &'a Mutex<HashMap<EntityId, Arc<Flight>>>,
    flight: &'a Flight,
    id: &'a EntityId,
}

impl FlightGuard<'_> {
    fn finish(self, result: Result<Entity, MirrorError>) {
        self.flight.complete(result);
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.complete(Err(MirrorError::UpstreamUnavailable(format!(
            "fetch for {} was abandoned",
            self.id
        ))));
        if let Ok(mut flights) = self.cache_flights.lock() {
            flights.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::domain::SystemClock;
    use crate::fetch::RawEntityPayload;
    use crate::store::SearchSettings;

    #[derive(Default)]
    struct CountingFetcher(AtomicUsize);

    impl EntityFetcher for CountingFetcher {
        fn fetch(&self, _id: &EntityId) -> Result<FetchOutcome, MirrorError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(FetchOutcome::Found(RawEntityPayload {
                bytes: br#"{"entities":{"Q7":{"id":"Q7","type":"item","labels":{}}}}"#.to_vec(),
            }))
        }
    }

    #[test]
    fn new_flight_honors_answer_recorded_after_the_miss() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = Arc::new(EntityStore::open(root.join("wikidata.db"), SearchSettings::default()).unwrap());
        let cache = WriteThroughCache::new(
            store,
            CountingFetcher::default(),
            Arc::new(SystemClock),
            CachePolicy::default(),
        );
        let id: EntityId = "Q7".parse().unwrap();

        // A previous flight answered NotFound between our miss and our flight.
        cache.remember_negative(&id, cache.clock.now(), MirrorError::NotFound(id.to_string()));
        assert_matches!(cache.fetch_coalesced(&id), Err(MirrorError::NotFound(_)));
        assert_eq!(cache.fetcher.0.load(Ordering::SeqCst), 0);
    }
}
