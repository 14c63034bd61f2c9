//! Large argument and output values travel between host and worker through file-backed
//! memory maps instead of the RPC stream.

use {
    std::{collections::HashMap, fs, path::PathBuf},
    tracing::{debug, warn},
    parking_lot::Mutex,
    fx_rpc::{RpcSharedMemory, TypedData},
    crate::{config::SharedMemoryConfig, error::SharedMemoryError},
};

pub use self::{
    directories::{SUBDIRECTORY, SharedMemoryDirectories, default_directories},
    map::{ControlFlag, HEADER_SIZE, SharedMemoryMap},
};

mod directories;
mod map;

/// Name and content length of a map holding one value.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SharedMemoryMetadata {
    pub name: String,
    pub count: u64,
}

impl SharedMemoryMetadata {
    pub fn to_rpc(&self, data: &TypedData) -> Option<RpcSharedMemory> {
        data.shared_memory_type().map(|data_type| RpcSharedMemory {
            name: self.name.clone(),
            offset: 0,
            count: self.count,
            data_type,
        })
    }
}

pub struct SharedMemoryManager {
    directories: SharedMemoryDirectories,
    min_object_bytes: u64,
    max_object_bytes: u64,
    /// Maps this process created or opened and still holds.
    maps: Mutex<HashMap<String, SharedMemoryMap>>,
    /// Maps allocated for in-flight invocations, freed when the invocation completes.
    invocation_maps: Mutex<HashMap<String, Vec<String>>>,
}

impl SharedMemoryManager {
    /// Host side manager. Cleans up maps left behind by a previous run.
    pub fn new(config: &SharedMemoryConfig) -> Result<Self, SharedMemoryError> {
        let directories = SharedMemoryDirectories::prepare(&config.directories, config.min_free_bytes)?;
        Ok(Self::with_directories(directories, config))
    }

    /// Worker side manager, sharing the directories of the host.
    pub fn for_worker(config: &SharedMemoryConfig) -> Result<Self, SharedMemoryError> {
        let directories = SharedMemoryDirectories::open(&config.directories, config.min_free_bytes)?;
        Ok(Self::with_directories(directories, config))
    }

    fn with_directories(directories: SharedMemoryDirectories, config: &SharedMemoryConfig) -> Self {
        Self {
            directories,
            min_object_bytes: config.min_object_bytes,
            max_object_bytes: config.max_object_bytes,
            maps: Mutex::new(HashMap::new()),
            invocation_maps: Mutex::new(HashMap::new()),
        }
    }

    pub fn directories(&self) -> &[PathBuf] {
        self.directories.roots()
    }

    /// True if the value is a string or bytes with a size within the configured bounds.
    pub fn is_supported(&self, data: &TypedData) -> bool {
        data.payload_bytes()
            .map(|bytes| bytes.len() as u64)
            .is_some_and(|size| size >= self.min_object_bytes && size <= self.max_object_bytes)
    }

    /// Copies `bytes` into a new map and marks it ready to read.
    pub fn put(&self, bytes: &[u8]) -> Result<SharedMemoryMetadata, SharedMemoryError> {
        let size = bytes.len() as u64;
        if size == 0 {
            return Err(SharedMemoryError::InvalidSize { size });
        }

        let directory = self.directories.select(HEADER_SIZE as u64 + size)?;
        let name = uuid::Uuid::new_v4().to_string();
        let mut map = SharedMemoryMap::create(directory, &name, size)?;
        let written = map.write(0, bytes).and_then(|_| map.mark_ready());
        if let Err(err) = written {
            let path = map.path().to_owned();
            drop(map);
            if let Err(remove_err) = fs::remove_file(&path) {
                warn!("failed to remove partially written map {path:?}: {remove_err:?}");
            }
            return Err(err);
        }

        debug!(map = name, size, "allocated shared memory map");
        self.maps.lock().insert(name.clone(), map);
        Ok(SharedMemoryMetadata { name, count: size })
    }

    /// Like [`SharedMemoryManager::put`], freed by `free_for_invocation`.
    pub fn put_for_invocation(&self, invocation_id: &str, bytes: &[u8]) -> Result<SharedMemoryMetadata, SharedMemoryError> {
        let metadata = self.put(bytes)?;
        self.track(invocation_id, &metadata.name);
        Ok(metadata)
    }

    /// Frees the map together with the maps of the invocation.
    pub fn track(&self, invocation_id: &str, name: &str) {
        self.invocation_maps.lock()
            .entry(invocation_id.to_owned())
            .or_default()
            .push(name.to_owned());
    }

    pub fn get(&self, name: &str, offset: u64, count: u64) -> Result<Vec<u8>, SharedMemoryError> {
        validate_name(name)?;
        let mut maps = self.maps.lock();
        if !maps.contains_key(name) {
            let directory = self.directories.find(name)
                .ok_or_else(|| SharedMemoryError::NotFound { name: name.to_owned() })?;
            let map = SharedMemoryMap::open(directory, name)?;
            maps.insert(name.to_owned(), map);
        }

        match maps.get_mut(name) {
            Some(map) => map.read(offset, count),
            None => Err(SharedMemoryError::NotFound { name: name.to_owned() }),
        }
    }

    pub fn get_typed(&self, shared_memory: &RpcSharedMemory) -> Result<TypedData, SharedMemoryError> {
        let bytes = self.get(&shared_memory.name, shared_memory.offset, shared_memory.count)?;
        TypedData::from_shared_memory(bytes, shared_memory.data_type)
            .map_err(|_| SharedMemoryError::InvalidHeader { name: shared_memory.name.clone() })
    }

    /// Unmaps and deletes the map. Returns false if no such map exists.
    pub fn free(&self, name: &str) -> bool {
        if validate_name(name).is_err() {
            return false;
        }

        let path = match self.maps.lock().remove(name) {
            Some(map) => Some(map.path().to_owned()),
            None => self.directories.find(name).map(|directory| directory.join(name)),
        };
        let Some(path) = path else {
            return false;
        };

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(map = name, "freed shared memory map");
                true
            },
            Err(err) => {
                debug!(map = name, "failed to remove shared memory map: {err:?}");
                false
            }
        }
    }

    /// Unmaps a map created by another process without deleting it.
    pub fn close(&self, name: &str) -> bool {
        self.maps.lock().remove(name).is_some()
    }

    /// Frees every map allocated for the invocation. Returns the number of maps freed.
    pub fn free_for_invocation(&self, invocation_id: &str) -> usize {
        let names = self.invocation_maps.lock().remove(invocation_id).unwrap_or_default();
        names.iter().filter(|name| self.free(name)).count()
    }
}

fn validate_name(name: &str) -> Result<(), SharedMemoryError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SharedMemoryError::InvalidName { name: name.to_owned() })
    }
}
