//! Error values for the recoverable failures of each subsystem.
//!
//! Broken invariants (the root process exiting, a scheduler switch with the
//! wrong lock state) are `panic!`s and never show up here.

/// Coarse classification shared by every error in the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No free process slot, mapping slot, descriptor or physical page
    ResourceExhausted,
    /// Misaligned or out of range argument, bad flag combination
    InvalidArgument,
    /// Access not allowed by a mapping or an open file
    PermissionDenied,
    /// Unknown pid, no matching child, no covering mapping
    NotFound,
}

/// Failures of the page table and user-copy helpers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The page pool or the table allocator is empty
    OutOfMemory,
    /// A translation already exists at this address
    Remap(usize),
    /// No translation at this address
    NotMapped(usize),
    /// Address beyond the user address space
    BadAddress(usize),
    /// Translation exists but lacks the required permission
    PermissionDenied(usize),
}

impl VmError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory => ErrorKind::ResourceExhausted,
            Self::Remap(_) | Self::BadAddress(_) => ErrorKind::InvalidArgument,
            Self::NotMapped(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
        }
    }
}

/// A positioned read on a backing file failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoError;

/// Failures of the process lifecycle and scheduling calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    NoFreeSlot,
    NoFreeFd,
    BadFd(usize),
    NoSuchProcess(i32),
    NoChildren,
    Killed,
    InvalidNice(i32),
    Vm(VmError),
    Mmap(MmapError),
}

impl ProcError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoFreeSlot | Self::NoFreeFd => ErrorKind::ResourceExhausted,
            Self::BadFd(_) | Self::InvalidNice(_) => ErrorKind::InvalidArgument,
            Self::NoSuchProcess(_) | Self::NoChildren => ErrorKind::NotFound,
            Self::Killed => ErrorKind::PermissionDenied,
            Self::Vm(err) => err.kind(),
            Self::Mmap(err) => err.kind(),
        }
    }
}

impl From<MmapError> for ProcError {
    fn from(value: MmapError) -> Self {
        Self::Mmap(value)
    }
}

impl From<VmError> for ProcError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

/// Failures of mmap, munmap and mapping fault resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    Misaligned,
    BadLength,
    BadProt,
    BadFlags,
    OutOfRange,
    BadFd,
    FilePermission,
    Overlap,
    TableFull,
    NoMatch,
    /// No mapping of the faulting process covers this address
    NoMapping(usize),
    /// Write fault against a mapping without write permission
    WriteProtected(usize),
    Io(IoError),
    Vm(VmError),
}

impl MmapError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TableFull => ErrorKind::ResourceExhausted,
            Self::Misaligned
            | Self::BadLength
            | Self::BadProt
            | Self::BadFlags
            | Self::OutOfRange
            | Self::BadFd
            | Self::Overlap
            | Self::NoMatch
            | Self::Io(_) => ErrorKind::InvalidArgument,
            Self::FilePermission | Self::WriteProtected(_) => ErrorKind::PermissionDenied,
            Self::NoMapping(_) => ErrorKind::NotFound,
            Self::Vm(err) => err.kind(),
        }
    }
}

impl From<VmError> for MmapError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

impl From<IoError> for MmapError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_vm_errors_keep_their_kind() {
        assert_eq!(
            ProcError::from(VmError::OutOfMemory).kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            MmapError::from(VmError::PermissionDenied(0x1000)).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(MmapError::Overlap.kind(), ErrorKind::InvalidArgument);
        assert_eq!(ProcError::NoChildren.kind(), ErrorKind::NotFound);
    }
}
