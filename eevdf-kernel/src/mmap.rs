//! Memory-mapped regions.
//!
//! Every mapping lives in a fixed window starting at [`MMAPBASE`] and is
//! described by one record in a global table. Pages are installed when first
//! touched, or all at once with [`MapFlags::POPULATE`].
//!
//! Records are only ever changed by their owner, but the table itself is
//! shared, so it sits behind a lock. File reads and page allocation happen
//! with the lock released.

use crate::error::MmapError;
use crate::file::File;
use crate::kalloc::page_bytes;
use crate::param::{MAX_MMAP_AREA, MMAPBASE, MMAP_REGION_SIZE, NOFILE};
use crate::proc::ProcRef;
use crate::vm::{PageTable, PteFlags, PAGE_SIZE, PGROUNDDOWN};
use crate::Kernel;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use log::{debug, trace};
use spin::mutex::Mutex;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1;
        const WRITE = 2;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const ANONYMOUS = 1;
        const POPULATE = 2;
    }
}

/// Returned by the `mmap` system call on failure
pub const MAP_FAILED: usize = 0;
/// The descriptor anonymous mappings must pass
pub const NO_FD: i32 = -1;

/// Access that caused a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct MmapArea {
    /// `None` marks a free slot
    pub owner: Option<ProcRef>,
    pub file: Option<Arc<File>>,
    pub addr: usize,
    pub length: usize,
    pub offset: usize,
    pub prot: Prot,
    pub flags: MapFlags,
}

impl MmapArea {
    const fn empty() -> Self {
        Self {
            owner: None,
            file: None,
            addr: 0,
            length: 0,
            offset: 0,
            prot: Prot::empty(),
            flags: MapFlags::empty(),
        }
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.addr + self.length
    }

    fn owned_by(&self, me: ProcRef) -> bool {
        self.owner == Some(me)
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end() && self.addr < end
    }

    fn contains(&self, virtual_address: usize) -> bool {
        (self.addr..self.end()).contains(&virtual_address)
    }

    fn pte_flags(&self) -> PteFlags {
        if self.prot.contains(Prot::WRITE) {
            PteFlags::U | PteFlags::R | PteFlags::W
        } else {
            PteFlags::U | PteFlags::R
        }
    }

    /// Fill a fresh page for `page_address` with the bytes it should start with
    fn fill_page(&self, physical: usize, page_address: usize) -> Result<(), MmapError> {
        let page = unsafe { page_bytes(physical) };
        page.fill(0);
        if let Some(file) = &self.file {
            file.ip
                .read_at(page, self.offset + (page_address - self.addr))?;
        }
        Ok(())
    }
}

pub(crate) struct MmapTable {
    areas: Mutex<[MmapArea; MAX_MMAP_AREA]>,
}

impl MmapTable {
    pub(crate) fn new() -> Self {
        Self {
            areas: Mutex::new(core::array::from_fn(|_| MmapArea::empty())),
        }
    }
}

impl Kernel {
    /// Map `length` bytes at `MMAPBASE + addr`, returning the mapped address.
    ///
    /// Anonymous mappings pass [`NO_FD`] and offset 0. File mappings need an
    /// open descriptor whose access covers `prot`.
    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &self,
        me: ProcRef,
        addr: usize,
        length: usize,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        offset: usize,
    ) -> Result<usize, MmapError> {
        if addr % PAGE_SIZE != 0 || length % PAGE_SIZE != 0 {
            return Err(MmapError::Misaligned);
        }
        if length == 0 {
            return Err(MmapError::BadLength);
        }
        let start = MMAPBASE.checked_add(addr).ok_or(MmapError::OutOfRange)?;
        let end = start.checked_add(length).ok_or(MmapError::OutOfRange)?;
        if end > MMAPBASE + MMAP_REGION_SIZE {
            return Err(MmapError::OutOfRange);
        }
        if prot != Prot::READ && prot != Prot::READ | Prot::WRITE {
            return Err(MmapError::BadProt);
        }

        let file = if flags.contains(MapFlags::ANONYMOUS) {
            if fd != NO_FD || offset != 0 {
                return Err(MmapError::BadFlags);
            }
            None
        } else {
            let file = usize::try_from(fd)
                .ok()
                .filter(|&fd| fd < NOFILE)
                .and_then(|fd| self.file(me, fd))
                .ok_or(MmapError::BadFd)?;
            if (prot.contains(Prot::WRITE) && !file.writable)
                || (prot.contains(Prot::READ) && !file.readable)
            {
                return Err(MmapError::FilePermission);
            }
            if offset % PAGE_SIZE != 0 {
                return Err(MmapError::Misaligned);
            }
            Some(file)
        };

        let area = MmapArea {
            owner: Some(me),
            file,
            addr: start,
            length,
            offset,
            prot,
            flags,
        };
        let slot = {
            let mut areas = self.mmaps.areas.lock();
            if areas
                .iter()
                .any(|other| other.owned_by(me) && other.overlaps(start, end))
            {
                return Err(MmapError::Overlap);
            }
            let slot = areas
                .iter()
                .position(|other| other.owner.is_none())
                .ok_or(MmapError::TableFull)?;
            areas[slot] = area.clone();
            slot
        };

        if flags.contains(MapFlags::POPULATE) {
            if let Err(err) = self.populate(me, &area) {
                self.with_data(me, |data| {
                    data.page_table()
                        .unmap(start, length / PAGE_SIZE, Some(self.kmem))
                });
                self.machine.flush_tlb();
                self.mmaps.areas.lock()[slot] = MmapArea::empty();
                debug!("mmap: pid {} populate failed: {err:?}", me.pid());
                return Err(err);
            }
        }

        debug!(
            "mmap: pid {} mapped {start:#x}..{end:#x} {prot:?} {flags:?}",
            me.pid()
        );
        Ok(start)
    }

    fn populate(&self, me: ProcRef, area: &MmapArea) -> Result<(), MmapError> {
        for page_address in (area.addr..area.end()).step_by(PAGE_SIZE) {
            self.install_page(me, area, page_address)?;
        }
        Ok(())
    }

    /// Allocate, fill and map the page of `area` at `page_address`. A page
    /// that is already present is left alone.
    fn install_page(
        &self,
        me: ProcRef,
        area: &MmapArea,
        page_address: usize,
    ) -> Result<(), MmapError> {
        let physical = self
            .kmem
            .alloc_page()
            .ok_or(crate::error::VmError::OutOfMemory)?;
        if let Err(err) = area.fill_page(physical, page_address) {
            self.kmem.free_page(physical);
            return Err(err);
        }

        let mapped = self.with_data(me, |data| -> Result<bool, MmapError> {
            let page_table = data.page_table();
            if page_table.lookup(page_address).is_some() {
                return Ok(false);
            }
            page_table.map_pages(page_address, PAGE_SIZE, physical, area.pte_flags())?;
            Ok(true)
        });
        match mapped {
            Ok(true) => {
                self.machine.flush_tlb();
                Ok(())
            }
            Ok(false) => {
                self.kmem.free_page(physical);
                Ok(())
            }
            Err(err) => {
                self.kmem.free_page(physical);
                Err(err)
            }
        }
    }

    /// Unmap `length` bytes at `addr`. Only a whole mapping, or a prefix of
    /// one starting at its base, can be removed.
    pub fn munmap(&self, me: ProcRef, addr: usize, length: usize) -> Result<(), MmapError> {
        if length == 0 {
            return Err(MmapError::BadLength);
        }
        if addr % PAGE_SIZE != 0 || length % PAGE_SIZE != 0 {
            return Err(MmapError::Misaligned);
        }
        if addr < MMAPBASE
            || addr
                .checked_add(length)
                .map_or(true, |end| end > MMAPBASE + MMAP_REGION_SIZE)
        {
            return Err(MmapError::OutOfRange);
        }

        {
            let mut areas = self.mmaps.areas.lock();
            let area = areas
                .iter_mut()
                .find(|area| area.owned_by(me) && area.addr == addr)
                .ok_or(MmapError::NoMatch)?;
            if length > area.length {
                return Err(MmapError::NoMatch);
            }
            if length == area.length {
                *area = MmapArea::empty();
            } else {
                area.addr += length;
                area.offset += length;
                area.length -= length;
            }
        }

        let freed = self.with_data(me, |data| {
            data.page_table()
                .unmap(addr, length / PAGE_SIZE, Some(self.kmem))
        });
        self.machine.flush_tlb();
        debug!(
            "munmap: pid {} unmapped {addr:#x}+{length:#x}, freed {freed} page(s)",
            me.pid()
        );
        Ok(())
    }

    /// Resolve a page fault at `virtual_address` inside the mapping window
    pub fn handle_mmap_fault(
        &self,
        me: ProcRef,
        virtual_address: usize,
        kind: FaultKind,
    ) -> Result<(), MmapError> {
        let area = self
            .mmaps
            .areas
            .lock()
            .iter()
            .find(|area| area.owned_by(me) && area.contains(virtual_address))
            .cloned()
            .ok_or(MmapError::NoMapping(virtual_address))?;

        if kind == FaultKind::Write && !area.prot.contains(Prot::WRITE) {
            return Err(MmapError::WriteProtected(virtual_address));
        }

        let page_address = PGROUNDDOWN!(virtual_address);
        let present = self.with_data(me, |data| data.page_table().lookup(page_address).is_some());
        if present {
            return Ok(());
        }

        trace!(
            "mmap fault: pid {} {kind:?} at {virtual_address:#x}",
            me.pid()
        );
        self.install_page(me, &area, page_address)
    }

    /// Give `child` a copy of every mapping of `parent`, including the pages
    /// populated so far. Pages still lazy stay lazy in the child.
    pub(crate) fn dup_mappings(
        &self,
        parent: ProcRef,
        child: ProcRef,
        parent_table: &PageTable,
        child_table: &mut PageTable,
    ) -> Result<(), MmapError> {
        let mut areas = self.mmaps.areas.lock();
        let owned: Vec<usize> = (0..MAX_MMAP_AREA)
            .filter(|&index| areas[index].owned_by(parent))
            .collect();

        for index in owned {
            let copied = match areas.iter().position(|area| area.owner.is_none()) {
                None => Err(MmapError::TableFull),
                Some(slot) => {
                    let area = MmapArea {
                        owner: Some(child),
                        ..areas[index].clone()
                    };
                    parent_table
                        .copy_pages(child_table, self.kmem, area.addr, area.end())
                        .map(|()| areas[slot] = area)
                        .map_err(MmapError::from)
                }
            };
            if let Err(err) = copied {
                for area in areas.iter_mut().filter(|area| area.owned_by(child)) {
                    child_table.unmap(area.addr, area.length / PAGE_SIZE, Some(self.kmem));
                    *area = MmapArea::empty();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Copies of the mapping records owned by `me`
    pub fn mappings(&self, me: ProcRef) -> Vec<MmapArea> {
        self.mmaps
            .areas
            .lock()
            .iter()
            .filter(|area| area.owned_by(me))
            .cloned()
            .collect()
    }
}
