//! Keeps shared memory maps of frequently passed values alive between invocations, so the
//! same object is not copied into a new map every time.

use {
    std::{collections::HashMap, sync::{Arc, Weak}},
    tracing::debug,
    parking_lot::Mutex,
    crate::shared_memory::{SharedMemoryManager, SharedMemoryMetadata},
};

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct FunctionDataCacheKey {
    pub id: String,
    pub version: String,
}

impl FunctionDataCacheKey {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

pub trait FunctionDataCache: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Inserts the entry unless the key is already present. The returned handle holds one
    /// active reference. With `delete_on_failure` the map is freed if it was not inserted.
    fn try_put(&self, key: FunctionDataCacheKey, metadata: SharedMemoryMetadata, delete_on_failure: bool) -> Option<CacheHandle>;

    fn try_get(&self, key: &FunctionDataCacheKey) -> Option<CacheHandle>;

    /// Removes the entry. Its map is freed right away, or once the last handle to it is
    /// dropped.
    fn try_remove(&self, key: &FunctionDataCacheKey) -> bool;
}

/// Active reference to a cache entry. The entry can not be evicted while a handle exists.
pub struct CacheHandle {
    key: FunctionDataCacheKey,
    metadata: SharedMemoryMetadata,
    cache: Weak<Mutex<CacheState>>,
    shared_memory: Arc<SharedMemoryManager>,
}

impl CacheHandle {
    pub fn key(&self) -> &FunctionDataCacheKey {
        &self.key
    }

    pub fn metadata(&self) -> &SharedMemoryMetadata {
        &self.metadata
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", &self.key)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        let Some(state) = self.cache.upgrade() else {
            return;
        };
        let release = {
            let mut state = state.lock();
            let entry = state.entries.get_mut(&self.key)
                .filter(|entry| entry.metadata == self.metadata);
            match entry {
                Some(entry) => {
                    entry.active_references = entry.active_references.saturating_sub(1);
                    false
                },
                None => state.release_removed(&self.metadata.name),
            }
        };

        if release {
            debug!(name = self.metadata.name, "freeing removed function data cache entry");
            self.shared_memory.free(&self.metadata.name);
        }
    }
}

struct CacheEntry {
    metadata: SharedMemoryMetadata,
    active_references: usize,
    last_used: u64,
}

struct CacheState {
    entries: HashMap<FunctionDataCacheKey, CacheEntry>,
    /// Maps of removed entries that handles still point to, with their reference counts.
    removed: HashMap<String, usize>,
    used_bytes: u64,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Drops one reference to a removed map. Returns true when it was the last one.
    fn release_removed(&mut self, name: &str) -> bool {
        let Some(references) = self.removed.get_mut(name) else {
            return false;
        };
        *references = references.saturating_sub(1);
        if *references > 0 {
            return false;
        }
        self.removed.remove(name);
        true
    }
}

/// LRU cache bounded by the total size of the cached maps.
pub struct SharedFunctionDataCache {
    state: Arc<Mutex<CacheState>>,
    capacity_bytes: u64,
    shared_memory: Arc<SharedMemoryManager>,
}

impl SharedFunctionDataCache {
    pub fn new(capacity_bytes: u64, shared_memory: Arc<SharedMemoryManager>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                removed: HashMap::new(),
                used_bytes: 0,
                clock: 0,
            })),
            capacity_bytes,
            shared_memory,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, key: FunctionDataCacheKey, metadata: SharedMemoryMetadata) -> CacheHandle {
        CacheHandle {
            key,
            metadata,
            cache: Arc::downgrade(&self.state),
            shared_memory: self.shared_memory.clone(),
        }
    }

    /// Evicts unreferenced entries, least recently used first, until `required` bytes fit.
    /// Returns the maps to free once the lock is released.
    fn make_room(&self, state: &mut CacheState, required: u64) -> Option<Vec<String>> {
        let mut evicted = Vec::new();
        while state.used_bytes + required > self.capacity_bytes {
            let victim = state.entries.iter()
                .filter(|(_, entry)| entry.active_references == 0)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                return None;
            };
            if let Some(entry) = state.entries.remove(&victim) {
                state.used_bytes -= entry.metadata.count;
                debug!(id = victim.id, version = victim.version, "evicted function data cache entry");
                evicted.push(entry.metadata.name);
            }
        }
        Some(evicted)
    }
}

impl FunctionDataCache for SharedFunctionDataCache {
    fn is_enabled(&self) -> bool {
        true
    }

    fn try_put(&self, key: FunctionDataCacheKey, metadata: SharedMemoryMetadata, delete_on_failure: bool) -> Option<CacheHandle> {
        let (inserted, evicted) = {
            let mut state = self.state.lock();
            if state.entries.contains_key(&key) || metadata.count > self.capacity_bytes {
                (false, Vec::new())
            } else {
                match self.make_room(&mut state, metadata.count) {
                    Some(evicted) => {
                        let last_used = state.tick();
                        state.used_bytes += metadata.count;
                        state.entries.insert(key.clone(), CacheEntry {
                            metadata: metadata.clone(),
                            active_references: 1,
                            last_used,
                        });
                        (true, evicted)
                    },
                    None => (false, Vec::new()),
                }
            }
        };

        for name in evicted {
            self.shared_memory.free(&name);
        }

        if inserted {
            Some(self.handle(key, metadata))
        } else {
            if delete_on_failure {
                self.shared_memory.free(&metadata.name);
            }
            None
        }
    }

    fn try_get(&self, key: &FunctionDataCacheKey) -> Option<CacheHandle> {
        let mut state = self.state.lock();
        let last_used = state.tick();
        let entry = state.entries.get_mut(key)?;
        entry.active_references += 1;
        entry.last_used = last_used;
        let metadata = entry.metadata.clone();
        drop(state);
        Some(self.handle(key.clone(), metadata))
    }

    fn try_remove(&self, key: &FunctionDataCacheKey) -> bool {
        let unreferenced = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.remove(key) else {
                return false;
            };
            state.used_bytes -= entry.metadata.count;
            if entry.active_references > 0 {
                // the last handle frees the map
                state.removed.insert(entry.metadata.name.clone(), entry.active_references);
                None
            } else {
                Some(entry.metadata.name)
            }
        };

        if let Some(name) = unreferenced {
            self.shared_memory.free(&name);
        }
        true
    }
}

/// Used when caching is disabled.
pub struct NullFunctionDataCache;

impl FunctionDataCache for NullFunctionDataCache {
    fn is_enabled(&self) -> bool {
        false
    }

    fn try_put(&self, _key: FunctionDataCacheKey, _metadata: SharedMemoryMetadata, _delete_on_failure: bool) -> Option<CacheHandle> {
        None
    }

    fn try_get(&self, _key: &FunctionDataCacheKey) -> Option<CacheHandle> {
        None
    }

    fn try_remove(&self, _key: &FunctionDataCacheKey) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use {
        crate::config::SharedMemoryConfig,
        super::*,
    };

    fn shared_memory(dir: &tempfile::TempDir) -> Arc<SharedMemoryManager> {
        Arc::new(SharedMemoryManager::new(&SharedMemoryConfig {
            directories: vec![dir.path().to_owned()],
            ..SharedMemoryConfig::default()
        }).unwrap())
    }

    #[test]
    fn second_put_with_same_key_fails_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let shared_memory = shared_memory(&dir);
        let cache = SharedFunctionDataCache::new(1024, shared_memory.clone());
        let key = FunctionDataCacheKey::new("blob", "1");

        let first = shared_memory.put(b"first").unwrap();
        let second = shared_memory.put(b"second").unwrap();

        let handle = cache.try_put(key.clone(), first.clone(), false);
        assert!(handle.is_some());
        assert!(cache.try_put(key.clone(), second.clone(), false).is_none());

        let cached = cache.try_get(&key).unwrap();
        assert_eq!(cached.metadata(), &first);
        assert_eq!(cache.used_bytes(), 5);
        assert_eq!(shared_memory.get(&second.name, 0, 6).unwrap(), b"second");
    }

    #[test]
    fn failed_put_can_free_the_map() {
        let dir = tempfile::tempdir().unwrap();
        let shared_memory = shared_memory(&dir);
        let cache = SharedFunctionDataCache::new(4, shared_memory.clone());

        let too_big = shared_memory.put(b"too big").unwrap();
        assert!(cache.try_put(FunctionDataCacheKey::new("big", "1"), too_big.clone(), true).is_none());
        assert!(shared_memory.get(&too_big.name, 0, 1).is_err());
    }

    #[test]
    fn referenced_entries_are_not_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let shared_memory = shared_memory(&dir);
        let cache = SharedFunctionDataCache::new(8, shared_memory.clone());

        let a = shared_memory.put(b"aaaa").unwrap();
        let b = shared_memory.put(b"bbbb").unwrap();
        let c = shared_memory.put(b"cccc").unwrap();

        let handle_a = cache.try_put(FunctionDataCacheKey::new("a", "1"), a.clone(), false).unwrap();
        let handle_b = cache.try_put(FunctionDataCacheKey::new("b", "1"), b.clone(), false).unwrap();

        // both entries are referenced, nothing can be evicted
        assert!(cache.try_put(FunctionDataCacheKey::new("c", "1"), c.clone(), false).is_none());

        drop(handle_b);
        drop(handle_a);
        // a was used before b, so it goes first
        let touched = cache.try_get(&FunctionDataCacheKey::new("a", "1")).unwrap();
        drop(touched);

        let handle_c = cache.try_put(FunctionDataCacheKey::new("c", "1"), c.clone(), false);
        assert!(handle_c.is_some());
        assert!(cache.try_get(&FunctionDataCacheKey::new("b", "1")).is_none());
        assert!(cache.try_get(&FunctionDataCacheKey::new("a", "1")).is_some());
        assert!(shared_memory.get(&b.name, 0, 1).is_err());
        assert_eq!(cache.used_bytes(), 8);
    }

    #[test]
    fn remove_frees_the_map() {
        let dir = tempfile::tempdir().unwrap();
        let shared_memory = shared_memory(&dir);
        let cache = SharedFunctionDataCache::new(64, shared_memory.clone());
        let key = FunctionDataCacheKey::new("blob", "2");

        let metadata = shared_memory.put(b"value").unwrap();
        drop(cache.try_put(key.clone(), metadata.clone(), false).unwrap());

        assert!(cache.try_remove(&key));
        assert!(!cache.try_remove(&key));
        assert!(cache.is_empty());
        assert!(shared_memory.get(&metadata.name, 0, 1).is_err());
    }

    #[test]
    fn removed_entry_stays_readable_until_last_handle_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let shared_memory = shared_memory(&dir);
        let cache = SharedFunctionDataCache::new(64, shared_memory.clone());
        let key = FunctionDataCacheKey::new("blob", "3");

        let metadata = shared_memory.put(b"payload").unwrap();
        drop(cache.try_put(key.clone(), metadata.clone(), false).unwrap());
        let first = cache.try_get(&key).unwrap();
        let second = cache.try_get(&key).unwrap();

        assert!(cache.try_remove(&key));
        assert!(cache.try_get(&key).is_none());
        assert_eq!(cache.used_bytes(), 0);
        assert_eq!(shared_memory.get(&first.metadata().name, 0, 7).unwrap(), b"payload");

        drop(first);
        assert_eq!(shared_memory.get(&metadata.name, 0, 7).unwrap(), b"payload");

        drop(second);
        assert!(shared_memory.get(&metadata.name, 0, 1).is_err());
    }

    #[test]
    fn handle_of_removed_entry_does_not_touch_a_new_entry_with_the_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let shared_memory = shared_memory(&dir);
        let cache = SharedFunctionDataCache::new(64, shared_memory.clone());
        let key = FunctionDataCacheKey::new("blob", "4");

        let old = shared_memory.put(b"old").unwrap();
        let held = cache.try_put(key.clone(), old.clone(), false).unwrap();
        assert!(cache.try_remove(&key));

        let new = shared_memory.put(b"new").unwrap();
        drop(cache.try_put(key.clone(), new.clone(), false).unwrap());

        drop(held);
        assert!(shared_memory.get(&old.name, 0, 1).is_err());
        assert_eq!(shared_memory.get(&new.name, 0, 3).unwrap(), b"new");
        assert!(cache.try_get(&key).is_some());
    }

    #[test]
    fn null_cache_always_misses() {
        let cache = NullFunctionDataCache;
        let key = FunctionDataCacheKey::new("blob", "1");
        let metadata = SharedMemoryMetadata { name: "map".to_owned(), count: 1 };

        assert!(!cache.is_enabled());
        assert!(cache.try_put(key.clone(), metadata, false).is_none());
        assert!(cache.try_get(&key).is_none());
        assert!(!cache.try_remove(&key));
    }
}
