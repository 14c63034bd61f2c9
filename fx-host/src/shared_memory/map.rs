//! One file-backed memory map.
//!
//! Layout: `[control flag: u32 LE][content length: u64 LE][content...]`.

use {
    std::{fs::OpenOptions, path::{Path, PathBuf}},
    memmap2::MmapMut,
    crate::error::SharedMemoryError,
};

pub const HEADER_SIZE: usize = CONTROL_FLAG_SIZE + CONTENT_LENGTH_SIZE;

const CONTROL_FLAG_SIZE: usize = 4;
const CONTENT_LENGTH_SIZE: usize = 8;

/// Ownership handoff marker stored at the start of every map.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u32)]
pub enum ControlFlag {
    Unknown = 0,
    WriteInProgress = 1,
    ReadyToRead = 2,
    PendingRead = 3,
    ReadyToDispose = 4,
}

impl ControlFlag {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::WriteInProgress,
            2 => Self::ReadyToRead,
            3 => Self::PendingRead,
            4 => Self::ReadyToDispose,
            _ => Self::Unknown,
        }
    }
}

pub struct SharedMemoryMap {
    name: String,
    path: PathBuf,
    mmap: MmapMut,
}

impl SharedMemoryMap {
    /// Creates a new map file able to hold `content_length` bytes. The flag is left in
    /// `WriteInProgress` until [`SharedMemoryMap::mark_ready`].
    pub fn create(dir: &Path, name: &str, content_length: u64) -> Result<Self, SharedMemoryError> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => SharedMemoryError::AlreadyExists { name: name.to_owned() },
                _ => SharedMemoryError::Io(err),
            })?;
        file.set_len(HEADER_SIZE as u64 + content_length)?;

        // SAFETY: the file was just created by us with create_new and has the mapped length.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut map = Self {
            name: name.to_owned(),
            path,
            mmap,
        };
        map.set_control_flag(ControlFlag::WriteInProgress);
        map.mmap[CONTROL_FLAG_SIZE..HEADER_SIZE].copy_from_slice(&content_length.to_le_bytes());
        Ok(map)
    }

    pub fn open(dir: &Path, name: &str) -> Result<Self, SharedMemoryError> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => SharedMemoryError::NotFound { name: name.to_owned() },
                _ => SharedMemoryError::Io(err),
            })?;
        let file_length = file.metadata()?.len();
        if file_length < HEADER_SIZE as u64 {
            return Err(SharedMemoryError::InvalidHeader { name: name.to_owned() });
        }

        // SAFETY: length checked above. Other processes only write the header flag and,
        // before `ReadyToRead`, the content.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let map = Self {
            name: name.to_owned(),
            path,
            mmap,
        };
        if HEADER_SIZE as u64 + map.content_length() > file_length {
            return Err(SharedMemoryError::InvalidHeader { name: name.to_owned() });
        }
        Ok(map)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content_length(&self) -> u64 {
        let mut bytes = [0u8; CONTENT_LENGTH_SIZE];
        bytes.copy_from_slice(&self.mmap[CONTROL_FLAG_SIZE..HEADER_SIZE]);
        u64::from_le_bytes(bytes)
    }

    pub fn control_flag(&self) -> ControlFlag {
        let mut bytes = [0u8; CONTROL_FLAG_SIZE];
        bytes.copy_from_slice(&self.mmap[..CONTROL_FLAG_SIZE]);
        ControlFlag::from_u32(u32::from_le_bytes(bytes))
    }

    pub fn set_control_flag(&mut self, flag: ControlFlag) {
        self.mmap[..CONTROL_FLAG_SIZE].copy_from_slice(&(flag as u32).to_le_bytes());
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), SharedMemoryError> {
        let range = self.content_range(offset, bytes.len() as u64)?;
        self.mmap[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Flushes the content and hands the map over to readers.
    pub fn mark_ready(&mut self) -> Result<(), SharedMemoryError> {
        self.mmap.flush()?;
        self.set_control_flag(ControlFlag::ReadyToRead);
        self.mmap.flush_range(0, CONTROL_FLAG_SIZE)?;
        Ok(())
    }

    /// Copies `count` bytes starting at `offset` of the content.
    pub fn read(&mut self, offset: u64, count: u64) -> Result<Vec<u8>, SharedMemoryError> {
        match self.control_flag() {
            ControlFlag::Unknown | ControlFlag::WriteInProgress => {
                return Err(SharedMemoryError::NotReadable { name: self.name.clone() });
            },
            ControlFlag::ReadyToRead | ControlFlag::PendingRead | ControlFlag::ReadyToDispose => {},
        }

        let range = self.content_range(offset, count)?;
        self.set_control_flag(ControlFlag::PendingRead);
        let bytes = self.mmap[range].to_vec();
        self.set_control_flag(ControlFlag::ReadyToDispose);
        Ok(bytes)
    }

    fn content_range(&self, offset: u64, count: u64) -> Result<std::ops::Range<usize>, SharedMemoryError> {
        let length = self.content_length();
        let end = offset.checked_add(count).filter(|end| *end <= length);
        match end {
            Some(end) => Ok(HEADER_SIZE + offset as usize..HEADER_SIZE + end as usize),
            None => Err(SharedMemoryError::OutOfBounds {
                name: self.name.clone(),
                offset,
                count,
                length,
            }),
        }
    }
}
