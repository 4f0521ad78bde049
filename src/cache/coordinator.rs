//! The cache coordinator: the single synchronization point of the service.
//!
//! Owns the in-memory table mapping cache keys to entry states and
//! guarantees at most one in-flight origin fetch per key. Concurrent
//! callers for the same key attach to the existing fill through a shared
//! watch channel and all observe the same final outcome; callers for
//! different keys never contend beyond the map shard they hash to.
//!
//! A fill runs on its own task, so a caller abandoning its request (client
//! disconnect) never cancels the retrieval other waiters depend on.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CacheSettings;
use crate::fetch::OriginFetch;
use crate::storage::{PutObject, StorageGateway, StoredObject};

use super::entry::{EntryState, FetchFailure, FillSlot, Outcome};
use super::keys::{CacheKey, Resource};

pub const METRIC_CACHE_HIT_TOTAL: &str = "staffetta_cache_hit_total";
pub const METRIC_CACHE_MISS_TOTAL: &str = "staffetta_cache_miss_total";
pub const METRIC_CACHE_FILL_FAIL_TOTAL: &str = "staffetta_cache_fill_fail_total";
pub const METRIC_CACHE_FILL_MS: &str = "staffetta_cache_fill_ms";

pub struct CacheCoordinator {
    entries: DashMap<CacheKey, EntryState>,
    fetcher: Arc<dyn OriginFetch>,
    storage: Arc<dyn StorageGateway>,
    settings: CacheSettings,
}

/// What a caller does after consulting the table, decided atomically
/// under the entry guard.
enum Role {
    /// This caller starts the fill and owns the sender half.
    Lead(watch::Sender<FillSlot>, watch::Receiver<FillSlot>),
    /// A fill is already running; wait on its handle.
    Attach(watch::Receiver<FillSlot>),
    /// No fill needed; the outcome is already known.
    Ready(Outcome),
}

impl CacheCoordinator {
    pub fn new(
        settings: CacheSettings,
        fetcher: Arc<dyn OriginFetch>,
        storage: Arc<dyn StorageGateway>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            fetcher,
            storage,
            settings,
        }
    }

    /// Resolve a resource to a stored object, filling the cache if needed.
    pub async fn resolve(self: &Arc<Self>, resource: &Resource) -> Outcome {
        match self.admit(resource) {
            Role::Ready(outcome) => outcome,
            Role::Attach(rx) => {
                debug!(key = %resource.key, "Attached to in-flight fill");
                self.await_fill(&resource.key, rx).await
            }
            Role::Lead(tx, rx) => {
                let coordinator = Arc::clone(self);
                let resource = resource.clone();
                let key = resource.key.clone();
                tokio::spawn(async move {
                    let result = coordinator.fill(&resource).await;
                    let state = match &result {
                        Ok(object) => EntryState::Present(object.clone()),
                        Err(failure) => EntryState::Failed {
                            failure: failure.clone(),
                            failed_at: Instant::now(),
                        },
                    };
                    coordinator.entries.insert(resource.key.clone(), state);
                    // Waiters read the broadcast value, not the table, so
                    // ordering past this point is not observable.
                    let _ = tx.send(Some(result));
                });
                self.await_fill(&key, rx).await
            }
        }
    }

    /// Seed the table with objects already in durable storage.
    pub fn warm_start(&self, objects: Vec<StoredObject>) -> usize {
        let mut loaded = 0;
        for object in objects {
            let key = CacheKey::from_stored(object.key.clone());
            self.entries
                .entry(key)
                .or_insert_with(|| EntryState::Present(object));
            loaded += 1;
        }
        loaded
    }

    /// Current `Present` entries, sorted by display name.
    pub fn snapshot(&self) -> Vec<StoredObject> {
        let mut objects: Vec<StoredObject> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                EntryState::Present(object) => Some(object.clone()),
                _ => None,
            })
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        objects
    }

    /// One atomic look at the entry; never held across an await.
    fn admit(&self, resource: &Resource) -> Role {
        match self.entries.entry(resource.key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                EntryState::Present(object) => {
                    counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
                    debug!(key = %resource.key, name = %object.name, "Cache hit");
                    Role::Ready(Outcome::Hit(object.clone()))
                }
                EntryState::Fetching(rx) => Role::Attach(rx.clone()),
                EntryState::Failed { failure, failed_at } => {
                    if failed_at.elapsed() < self.settings.retry_cooldown {
                        debug!(key = %resource.key, "Failed entry still cooling down");
                        Role::Ready(Outcome::Failure(failure.clone()))
                    } else {
                        let (tx, rx) = watch::channel(None);
                        occupied.insert(EntryState::Fetching(rx.clone()));
                        Role::Lead(tx, rx)
                    }
                }
            },
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(EntryState::Fetching(rx.clone()));
                Role::Lead(tx, rx)
            }
        }
    }

    async fn await_fill(&self, key: &CacheKey, mut rx: watch::Receiver<FillSlot>) -> Outcome {
        match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => match slot.as_ref() {
                Some(Ok(object)) => Outcome::Miss(object.clone()),
                Some(Err(failure)) => Outcome::Failure(failure.clone()),
                None => Outcome::Failure(FetchFailure::internal("fill resolved without a result")),
            },
            Err(_) => {
                // The fill task died without publishing (panic). Clear the
                // stale Fetching entry so the next request can start over.
                self.entries.remove_if(key, |_, state| {
                    matches!(state, EntryState::Fetching(rx) if rx.has_changed().is_err())
                });
                warn!(key = %key, "Fill task terminated without a result");
                Outcome::Failure(FetchFailure::internal("fill task terminated unexpectedly"))
            }
        }
    }

    /// Fetch from the origin and write through to durable storage.
    /// Partial success is never surfaced: a store failure after a good
    /// fetch is an overall failure.
    async fn fill(&self, resource: &Resource) -> Result<StoredObject, FetchFailure> {
        let started = std::time::Instant::now();

        let fetched = self.fetcher.fetch(&resource.url).await.map_err(|err| {
            counter!(METRIC_CACHE_FILL_FAIL_TOTAL).increment(1);
            warn!(key = %resource.key, url = %resource.url, error = %err, "Origin fetch failed");
            FetchFailure::from(&err)
        })?;

        if fetched.is_html() {
            counter!(METRIC_CACHE_FILL_FAIL_TOTAL).increment(1);
            info!(url = %resource.url, "Refusing to cache a text/html body");
            return Err(FetchFailure::not_cacheable("origin answered with text/html"));
        }
        let size = fetched.bytes.len() as u64;
        if size < self.settings.min_object_bytes {
            counter!(METRIC_CACHE_FILL_FAIL_TOTAL).increment(1);
            info!(url = %resource.url, size, "Refusing to cache a suspiciously small body");
            return Err(FetchFailure::not_cacheable(format!(
                "body of {size} bytes looks like an error page"
            )));
        }

        let stored = self
            .storage
            .put(
                &resource.key,
                PutObject {
                    origin_url: resource.url.clone(),
                    name: resource.name.clone(),
                    bytes: fetched.bytes,
                    content_type: fetched.content_type,
                    etag: fetched.etag,
                },
            )
            .await
            .map_err(|err| {
                counter!(METRIC_CACHE_FILL_FAIL_TOTAL).increment(1);
                warn!(key = %resource.key, error = %err, "Storage write failed");
                FetchFailure::from(&err)
            })?;

        counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
        histogram!(METRIC_CACHE_FILL_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        info!(
            key = %stored.key,
            name = %stored.name,
            size = stored.size,
            location = %stored.location,
            "Cache fill complete"
        );
        Ok(stored)
    }
}
