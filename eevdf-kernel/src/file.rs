//! Open-file references as seen by the process table and the mapping manager.
//! Opening, writing and naming files belong to the filesystem layer.

use crate::error::IoError;
use alloc::sync::Arc;

/// Backing storage that supports positioned reads
pub trait Inode: Send + Sync {
    /// Read up to `destination.len()` bytes at `offset`, returning how many
    /// were read. Reading past the end yields a short count, not an error.
    fn read_at(&self, destination: &mut [u8], offset: usize) -> Result<usize, IoError>;
}

/// An open file, shared between descriptor tables and mappings
pub struct File {
    pub readable: bool,
    pub writable: bool,
    pub ip: Arc<dyn Inode>,
}

impl File {
    #[must_use]
    pub fn new(ip: Arc<dyn Inode>, readable: bool, writable: bool) -> Arc<Self> {
        Arc::new(Self {
            readable,
            writable,
            ip,
        })
    }
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}
