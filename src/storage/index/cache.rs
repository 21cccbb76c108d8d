use std::any::Any;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::Result;

use super::epoch::{SchemaEpoch, SchemaGeneration};

/// Hit/miss counters of a [`SchemaStateCache`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SchemaStateCacheStats {
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry {
    generation: SchemaGeneration,
    value: Arc<dyn Any + Send + Sync>,
}

/// Process-wide memoization of values derived from the committed schema.
///
/// Each entry remembers the schema generation it was produced under. An entry from an
/// older generation is treated as absent, so [`invalidate`](Self::invalidate) is a single
/// epoch bump and every lookup that starts after it returns observes an empty cache.
/// A producer that was already running when the bump happened stores its value under the
/// old generation, where nobody will read it.
pub struct SchemaStateCache<K = String> {
    epoch: Arc<SchemaEpoch>,
    entries: RwLock<FxHashMap<K, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K> SchemaStateCache<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(epoch: Arc<SchemaEpoch>) -> Self {
        Self {
            epoch,
            entries: RwLock::new(FxHashMap::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn epoch(&self) -> &Arc<SchemaEpoch> {
        &self.epoch
    }

    /// Returns the value memoized for `key`, invoking `producer` when there is none for the
    /// current schema generation.
    ///
    /// The producer runs without holding the cache lock. When it fails nothing is stored
    /// and the error is returned unchanged. A value stored under the same key with a
    /// different type counts as a miss and is replaced.
    pub fn get_or_create<V, F>(&self, key: &K, producer: F) -> Result<Arc<V>>
    where
        V: Any + Send + Sync,
        F: FnOnce(&K) -> Result<V>,
    {
        let generation = self.epoch.current();
        if let Some(hit) = self.lookup::<V>(key, generation) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(generation = generation.0, "schema_state.hit");
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = Arc::new(producer(key)?);
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(existing) if existing.generation > generation => {}
            Some(existing) if existing.generation == generation => {
                // a concurrent producer stored first; everyone shares its value
                if let Ok(winner) = Arc::clone(&existing.value).downcast::<V>() {
                    return Ok(winner);
                }
                let stored: Arc<dyn Any + Send + Sync> = value.clone();
                entries.insert(
                    key.clone(),
                    CacheEntry {
                        generation,
                        value: stored,
                    },
                );
            }
            _ => {
                let stored: Arc<dyn Any + Send + Sync> = value.clone();
                entries.insert(
                    key.clone(),
                    CacheEntry {
                        generation,
                        value: stored,
                    },
                );
            }
        }
        trace!(generation = generation.0, "schema_state.store");
        Ok(value)
    }

    /// Drops every entry by moving to a new schema generation.
    pub fn invalidate(&self) -> SchemaGeneration {
        let next = self.epoch.bump();
        trace!(generation = next.0, "schema_state.invalidate");
        next
    }

    /// Physically removes entries left behind by earlier generations.
    pub fn purge_stale(&self) -> usize {
        let current = self.epoch.current();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.generation == current);
        before - entries.len()
    }

    /// Number of entries valid for the current generation.
    pub fn len(&self) -> usize {
        let current = self.epoch.current();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.generation == current)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SchemaStateCacheStats {
        SchemaStateCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn lookup<V>(&self, key: &K, generation: SchemaGeneration) -> Option<Arc<V>>
    where
        V: Any + Send + Sync,
    {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.generation != generation {
            return None;
        }
        Arc::clone(&entry.value).downcast::<V>().ok()
    }
}
