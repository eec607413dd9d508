//! Fixed kernel parameters.

/// Maximum number of processes
pub const NPROC: usize = 64;
/// Maximum number of CPUs
pub const NCPU: usize = 8;
/// Open files per process
pub const NOFILE: usize = 16;

/// Slots in the global mapping table
pub const MAX_MMAP_AREA: usize = 64;
/// Base of the reserved window all mappings live in
pub const MMAPBASE: usize = 0x4000_0000;
/// Size of the mapping window
pub const MMAP_REGION_SIZE: usize = 0x1000_0000;

/// Ticks granted per quantum
pub const QUANTUM: u32 = 5;
/// Nice value every new slot starts with
pub const DEFAULT_NICE: i32 = 20;
/// Weight of a nice 20 process, the unit all weights are relative to
pub const WEIGHT_UNIT: u64 = 1024;
/// Fixed-point factor applied to virtual time (milliticks)
pub const TICK_SCALE: u64 = 1000;

/// Kernel stack pages reserved per slot
pub const KSTACK_PAGES: usize = 1;
