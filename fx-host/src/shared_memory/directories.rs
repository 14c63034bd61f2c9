use {
    std::{env, fs, io, path::{Path, PathBuf}},
    tracing::{debug, warn},
    nix::sys::statvfs::statvfs,
    crate::error::SharedMemoryError,
};

/// Private subdirectory created inside every allowed directory.
pub const SUBDIRECTORY: &str = "fx-shm";

const DEV_SHM: &str = "/dev/shm";

pub fn default_directories() -> Vec<PathBuf> {
    let mut directories = Vec::new();
    let dev_shm = PathBuf::from(DEV_SHM);
    if dev_shm.is_dir() {
        directories.push(dev_shm);
    }
    directories.push(env::temp_dir());
    directories
}

/// Directories map files are created in, in order of preference.
pub struct SharedMemoryDirectories {
    roots: Vec<PathBuf>,
    directories: Vec<PathBuf>,
    min_free_bytes: u64,
}

impl SharedMemoryDirectories {
    /// Host side: removes leftovers of a previous run and creates fresh subdirectories.
    pub fn prepare(roots: &[PathBuf], min_free_bytes: u64) -> Result<Self, SharedMemoryError> {
        Self::init(roots, min_free_bytes, true)
    }

    /// Worker side: uses the subdirectories prepared by the host.
    pub fn open(roots: &[PathBuf], min_free_bytes: u64) -> Result<Self, SharedMemoryError> {
        Self::init(roots, min_free_bytes, false)
    }

    fn init(roots: &[PathBuf], min_free_bytes: u64, clean: bool) -> Result<Self, SharedMemoryError> {
        let roots = if roots.is_empty() { default_directories() } else { roots.to_vec() };

        let mut usable_roots = Vec::new();
        let mut directories = Vec::new();
        for root in roots {
            if !root.is_dir() {
                warn!("skipping shared memory directory {root:?}: not a directory");
                continue;
            }

            let directory = root.join(SUBDIRECTORY);
            if clean {
                match fs::remove_dir_all(&directory) {
                    Ok(()) => debug!("removed stale shared memory directory {directory:?}"),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {},
                    Err(err) => warn!("failed to remove stale shared memory directory {directory:?}: {err:?}"),
                }
            }
            if let Err(err) = fs::create_dir_all(&directory) {
                warn!("skipping shared memory directory {directory:?}: {err:?}");
                continue;
            }

            usable_roots.push(root);
            directories.push(directory);
        }

        if directories.is_empty() {
            return Err(SharedMemoryError::NoSpace { required: 0 });
        }

        Ok(Self {
            roots: usable_roots,
            directories,
            min_free_bytes,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// First directory with more than `size + min_free_bytes` bytes available.
    pub fn select(&self, size: u64) -> Result<&Path, SharedMemoryError> {
        let required = size.saturating_add(self.min_free_bytes);
        for directory in &self.directories {
            match free_space(directory) {
                Ok(free) if free > required => return Ok(directory),
                Ok(free) => debug!("shared memory directory {directory:?} has only {free} bytes free"),
                Err(err) => warn!("failed to check free space of {directory:?}: {err:?}"),
            }
        }
        Err(SharedMemoryError::NoSpace { required })
    }

    /// Directory containing an existing map with this name.
    pub fn find(&self, name: &str) -> Option<&Path> {
        self.directories.iter()
            .find(|directory| directory.join(name).is_file())
            .map(PathBuf::as_path)
    }
}

fn free_space(path: &Path) -> Result<u64, nix::Error> {
    let stat = statvfs(path)?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
}
