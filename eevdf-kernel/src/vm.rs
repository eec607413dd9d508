use crate::error::VmError;
use crate::kalloc::{page_bytes, PageAllocator};
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use bitfield::{bitfield, BitRange, BitRangeMut};
use bitflags::bitflags;
use core::{mem::size_of, slice::from_raw_parts_mut};

const ENTRIES: usize = PAGE_SIZE / size_of::<PageTableEntry>();
const TABLE_LAYOUT: Layout = unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) };

bitflags! {
    /// Permission bits of a leaf [`PageTableEntry`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
    }
}

/// A full Sv39 Page Table.
///
/// Interior tables come from the global allocator and are released on drop.
/// Leaf pages belong to whoever mapped them and must be unmapped (and
/// freed) before the table goes away.
#[repr(transparent)]
pub struct PageTable {
    first_level: &'static mut [PageTableEntry],
}

impl core::fmt::Debug for PageTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageTable({:p})", self.first_level.as_ptr())
    }
}

fn alloc_table() -> Option<&'static mut [PageTableEntry]> {
    #[allow(clippy::cast_ptr_alignment)]
    let page_table_page = unsafe { alloc_zeroed(TABLE_LAYOUT).cast::<PageTableEntry>() };
    if page_table_page.is_null() {
        None
    } else {
        Some(unsafe { from_raw_parts_mut(page_table_page, ENTRIES) })
    }
}

/// Index into the table at `level` for `virtual_address`
#[inline]
fn px(level: usize, virtual_address: usize) -> usize {
    (virtual_address >> (12 + (9 * level))) & 0x1FF
}

impl PageTable {
    /// Creates a new, empty page table, located on the heap
    pub fn new() -> Result<Self, VmError> {
        let first_level = alloc_table().ok_or(VmError::OutOfMemory)?;
        Ok(PageTable { first_level })
    }

    /// Map a contiguous region of virtual addresses to a contigous region of physical addresses
    /// `virtual_base` and `region_size` need not be page aligned
    pub fn map_pages(
        &mut self,
        virtual_base: usize,
        region_size: usize,
        physical_base: usize,
        permissions: PteFlags,
    ) -> Result<(), VmError> {
        assert!(region_size != 0, "map_pages: size");

        let virtual_page_start = PGROUNDDOWN!(virtual_base);
        let virtual_page_end = PGROUNDDOWN!(virtual_base + region_size - 1);
        for virtual_addr in (virtual_page_start..=virtual_page_end).step_by(PAGE_SIZE) {
            self.walk_mut(virtual_addr, true, |pte| {
                if pte.valid() {
                    return Err(VmError::Remap(virtual_addr));
                }
                pte.set_mapping(virtual_addr - virtual_page_start + physical_base);
                pte.set_flags(permissions | PteFlags::V);
                Ok(())
            })??;
        }
        Ok(())
    }

    /// Remove `page_count` translations starting at `virtual_base`, freeing
    /// the backing pages into `free_into` when given. Missing translations
    /// are skipped. Returns how many translations were removed.
    pub fn unmap(
        &mut self,
        virtual_base: usize,
        page_count: usize,
        free_into: Option<&dyn PageAllocator>,
    ) -> usize {
        assert!(virtual_base % PAGE_SIZE == 0, "unmap: not aligned");

        let mut removed = 0;
        for virtual_addr in (virtual_base..virtual_base + page_count * PAGE_SIZE).step_by(PAGE_SIZE)
        {
            let physical = self
                .walk_mut(virtual_addr, false, |pte| {
                    if pte.valid() {
                        let physical = pte.pa_int();
                        *pte = PageTableEntry(0);
                        Some(physical)
                    } else {
                        None
                    }
                })
                .ok()
                .flatten();
            if let Some(physical) = physical {
                removed += 1;
                if let Some(kmem) = free_into {
                    kmem.free_page(physical);
                }
            }
        }
        removed
    }

    /// Physical page and permissions backing `virtual_address`, if mapped
    #[must_use]
    pub fn lookup(&self, virtual_address: usize) -> Option<(usize, PteFlags)> {
        self.walk_const(PGROUNDDOWN!(virtual_address), |pte| {
            pte.valid().then(|| (pte.pa_int(), pte.flags()))
        })
        .ok()
        .flatten()
    }

    pub fn walk_mut<T>(
        &mut self,
        virtual_address: usize,
        should_allocate: bool,
        pte_edit: impl FnOnce(&mut PageTableEntry) -> T,
    ) -> Result<T, VmError> {
        if virtual_address >= MAX_VIRTUAL_ADDRESS {
            return Err(VmError::BadAddress(virtual_address));
        }

        let mut page_table = self.first_level.as_mut_ptr();

        for level in (1..=2).rev() {
            let page_table_entry = unsafe { &mut *page_table.add(px(level, virtual_address)) };
            if page_table_entry.valid() {
                page_table = page_table_entry.pa_int() as *mut PageTableEntry;
            } else if !should_allocate {
                return Err(VmError::NotMapped(virtual_address));
            } else {
                page_table = alloc_table().ok_or(VmError::OutOfMemory)?.as_mut_ptr();
                page_table_entry.set_mapping(page_table as usize);
                page_table_entry.set_valid(true);
            }
        }

        Ok(pte_edit(unsafe {
            &mut *page_table.add(px(0, virtual_address))
        }))
    }

    pub fn walk_const<T>(
        &self,
        virtual_address: usize,
        pte_lookup: impl FnOnce(&PageTableEntry) -> T,
    ) -> Result<T, VmError> {
        if virtual_address >= MAX_VIRTUAL_ADDRESS {
            return Err(VmError::BadAddress(virtual_address));
        }

        let mut page_table = self.first_level.as_ptr();

        for level in (1..=2).rev() {
            let page_table_entry = unsafe { &*page_table.add(px(level, virtual_address)) };
            if page_table_entry.valid() {
                page_table = page_table_entry.pa_int() as *const PageTableEntry;
            } else {
                return Err(VmError::NotMapped(virtual_address));
            }
        }
        Ok(pte_lookup(unsafe {
            &*page_table.add(px(0, virtual_address))
        }))
    }

    /// Grow user memory from `old_size` to `new_size` with zeroed pages
    pub fn uvm_alloc(
        &mut self,
        kmem: &dyn PageAllocator,
        old_size: usize,
        new_size: usize,
        extra_permissions: PteFlags,
    ) -> Result<usize, VmError> {
        if new_size < old_size {
            return Ok(old_size);
        }

        for virtual_addr in (PGROUNDUP!(old_size)..new_size).step_by(PAGE_SIZE) {
            let Some(memory) = kmem.alloc_page() else {
                self.uvm_dealloc(kmem, virtual_addr, old_size);
                return Err(VmError::OutOfMemory);
            };
            let page = unsafe { page_bytes(memory) };
            page.fill(0);
            if let Err(err) = self.map_pages(
                virtual_addr,
                PAGE_SIZE,
                memory,
                PteFlags::R | PteFlags::U | extra_permissions,
            ) {
                kmem.free_page(memory);
                self.uvm_dealloc(kmem, virtual_addr, old_size);
                return Err(err);
            }
        }
        Ok(new_size)
    }

    /// Shrink user memory from `old_size` to `new_size`, returning the new size
    pub fn uvm_dealloc(&mut self, kmem: &dyn PageAllocator, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        if PGROUNDUP!(new_size) < PGROUNDUP!(old_size) {
            let page_count = (PGROUNDUP!(old_size) - PGROUNDUP!(new_size)) / PAGE_SIZE;
            self.unmap(PGROUNDUP!(new_size), page_count, Some(kmem));
        }
        new_size
    }

    /// Copy every page mapped in `[start, end)` into fresh pages of `child`,
    /// keeping permissions. Holes are skipped. On failure the pages already
    /// copied into `child` for this range are released.
    pub fn copy_pages(
        &self,
        child: &mut PageTable,
        kmem: &dyn PageAllocator,
        start: usize,
        end: usize,
    ) -> Result<(), VmError> {
        for virtual_addr in (start..end).step_by(PAGE_SIZE) {
            let Some((physical, flags)) = self.lookup(virtual_addr) else {
                continue;
            };
            let result = match kmem.alloc_page() {
                None => Err(VmError::OutOfMemory),
                Some(copy) => {
                    let (page, original) = unsafe { (page_bytes(copy), page_bytes(physical)) };
                    page.copy_from_slice(original);
                    child
                        .map_pages(virtual_addr, PAGE_SIZE, copy, flags)
                        .inspect_err(|_| kmem.free_page(copy))
                }
            };
            if let Err(err) = result {
                child.unmap(start, (virtual_addr - start) / PAGE_SIZE, Some(kmem));
                return Err(err);
            }
        }
        Ok(())
    }

    /// Copy `source` into user memory at `destination`
    pub fn copyout(&self, mut destination: usize, mut source: &[u8]) -> Result<(), VmError> {
        while !source.is_empty() {
            let page_base = PGROUNDDOWN!(destination);
            let (physical, flags) = self
                .lookup(page_base)
                .ok_or(VmError::NotMapped(page_base))?;
            if !flags.contains(PteFlags::U | PteFlags::W) {
                return Err(VmError::PermissionDenied(page_base));
            }
            let offset = destination - page_base;
            let count = core::cmp::min(PAGE_SIZE - offset, source.len());
            let page = unsafe { page_bytes(physical) };
            page[offset..offset + count].copy_from_slice(&source[..count]);
            source = &source[count..];
            destination = page_base + PAGE_SIZE;
        }
        Ok(())
    }

    /// Fill `destination` from user memory at `source`
    pub fn copyin(&self, mut destination: &mut [u8], mut source: usize) -> Result<(), VmError> {
        while !destination.is_empty() {
            let page_base = PGROUNDDOWN!(source);
            let (physical, flags) = self
                .lookup(page_base)
                .ok_or(VmError::NotMapped(page_base))?;
            if !flags.contains(PteFlags::U) {
                return Err(VmError::PermissionDenied(page_base));
            }
            let offset = source - page_base;
            let count = core::cmp::min(PAGE_SIZE - offset, destination.len());
            let (head, tail) = destination.split_at_mut(count);
            head.copy_from_slice(&unsafe { page_bytes(physical) }[offset..offset + count]);
            destination = tail;
            source = page_base + PAGE_SIZE;
        }
        Ok(())
    }

    /// Release the user pages in `[0, size)`
    pub fn free(&mut self, kmem: &dyn PageAllocator, size: usize) {
        if size > 0 {
            self.unmap(0, PGROUNDUP!(size) / PAGE_SIZE, Some(kmem));
        }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        unsafe { free_table(self.first_level.as_mut_ptr(), 2) };
    }
}

/// # Safety
/// `table` must be a table page from [`alloc_table`] at `level`, unreachable afterwards.
unsafe fn free_table(table: *mut PageTableEntry, level: usize) {
    if level > 0 {
        for index in 0..ENTRIES {
            let pte = unsafe { *table.add(index) };
            if pte.valid() && !pte.is_leaf() {
                unsafe { free_table(pte.pa_int() as *mut PageTableEntry, level - 1) };
            }
        }
    }
    unsafe { dealloc(table.cast(), TABLE_LAYOUT) };
}

bitfield! {
    /// A wrapper around a Sv39 Page Table Entry
    #[derive(PartialEq, Eq, Copy, Clone)]
    #[repr(transparent)]
    pub struct PageTableEntry(u64);
    impl Debug;
    /// Find if the referenced page is valid
    pub valid, set_valid: 0;
    /// Can this page be read?
    pub readable, set_readable: 1;
    /// Can this page be written to?
    pub writeable, set_writeable: 2;
    /// Can memory in this page be executed?
    pub executable, set_executable: 3;
    /// Can user code access this page?
    pub user_accessible, set_user_accessible: 4;
    /// Physical Page to map to
    u64, pa, set_pa: 53, 10;
}

impl PageTableEntry {
    /// Physical address this PTE points to
    #[must_use]
    #[allow(clippy::trivially_copy_pass_by_ref, clippy::cast_possible_truncation)]
    pub fn pa_int(&self) -> usize {
        (self.pa() << 12) as usize
    }

    /// Set the physical address this PTE points to
    pub fn set_mapping(&mut self, physical_address: usize) {
        self.set_pa(physical_address as u64 >> 12);
    }

    /// A leaf maps memory; anything else points at the next level
    #[must_use]
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn is_leaf(&self) -> bool {
        self.readable() || self.writeable() || self.executable()
    }

    #[must_use]
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn flags(&self) -> PteFlags {
        let bits: u8 = self.bit_range(4, 0);
        PteFlags::from_bits_truncate(bits)
    }

    pub fn set_flags(&mut self, flags: PteFlags) {
        self.set_bit_range(4, 0, flags.bits());
    }
}

/// The size of pages
pub const PAGE_SIZE: usize = 4096;
/// One beyond the highest possible virtual address.
/// `MAX_VIRTUAL_ADDRESS` is actually one bit less than the max allowed by
/// Sv39, to avoid having to sign-extend virtual addresses
/// that have the high bit set.
pub const MAX_VIRTUAL_ADDRESS: usize = 1 << (9 + 9 + 9 + 12 - 1);
pub const TRAMPOLINE: usize = MAX_VIRTUAL_ADDRESS - PAGE_SIZE;
pub const TRAPFRAME: usize = TRAMPOLINE - PAGE_SIZE;

macro_rules! PGROUNDUP {
    ($e:expr) => {
        ($e as usize + $crate::vm::PAGE_SIZE - 1) & !($crate::vm::PAGE_SIZE - 1)
    };
}

macro_rules! PGROUNDDOWN {
    ($e:expr) => {
        $e as usize & !($crate::vm::PAGE_SIZE - 1)
    };
}

pub(crate) use PGROUNDDOWN;
pub(crate) use PGROUNDUP;
