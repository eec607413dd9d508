use crate::vm::PAGE_SIZE;
use core::cell::Cell;
use core::ptr::{self, NonNull};
use log::debug;
use spin::mutex::Mutex;

/// Source of physical pages for user memory and trap frames.
///
/// Addresses are physical and page aligned. Contents of a fresh page are
/// unspecified; callers zero what they hand to user space.
pub trait PageAllocator: Sync {
    fn alloc_page(&self) -> Option<usize>;

    /// Return a page obtained from [`PageAllocator::alloc_page`]
    fn free_page(&self, physical_address: usize);

    /// Number of pages currently free
    fn free_pages(&self) -> usize;
}

/// One page of backing memory, suitable for handing to [`KernelPageAllocator::from_pages`]
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }
}

#[repr(C)]
struct Run {
    pub next: Cell<Option<NonNull<Run>>>,
}

/// Free-list allocator over a contiguous range of pages
pub struct KernelPageAllocator {
    freelist: Mutex<Cell<Option<NonNull<Run>>>>,
    start: usize,
    end: usize,
}

unsafe impl Sync for KernelPageAllocator {}
unsafe impl Send for KernelPageAllocator {}

impl KernelPageAllocator {
    /// Hands every page in `[start, end)` to the allocator
    /// # Safety
    /// The range must be memory nothing else uses for the life of the allocator.
    #[must_use]
    pub unsafe fn new(start: usize, end: usize) -> Self {
        let allocator = Self {
            freelist: Mutex::new(Cell::new(None)),
            start: crate::vm::PGROUNDUP!(start),
            end: crate::vm::PGROUNDDOWN!(end),
        };
        debug!(
            "Initializing allocator over {:x}..{:x}",
            allocator.start, allocator.end
        );
        for page in (allocator.start..allocator.end).step_by(PAGE_SIZE) {
            allocator.free_page(page);
        }
        allocator
    }

    /// Builds an allocator over pages leaked for the life of the program
    #[must_use]
    pub fn from_pages(pages: &'static mut [Page]) -> Self {
        let range = pages.as_mut_ptr_range();
        unsafe { Self::new(range.start as usize, range.end as usize) }
    }
}

impl PageAllocator for KernelPageAllocator {
    fn alloc_page(&self) -> Option<usize> {
        let freelist = self.freelist.lock();
        let run = freelist.get()?;
        freelist.set(unsafe { run.as_ref() }.next.get());
        core::mem::drop(freelist);

        let page = run.cast::<u8>().as_ptr();
        unsafe { ptr::write_bytes(page, 5, PAGE_SIZE) };
        Some(page as usize)
    }

    #[allow(clippy::cast_ptr_alignment)]
    fn free_page(&self, physical_address: usize) {
        if physical_address % PAGE_SIZE != 0
            || physical_address < self.start
            || physical_address >= self.end
        {
            panic!("KPA_free: Out of bounds");
        }

        let page = physical_address as *mut u8;
        unsafe { ptr::write_bytes(page, 1, PAGE_SIZE) };
        let run = page.cast::<Run>();
        let freelist = self.freelist.lock();
        unsafe {
            run.write(Run {
                next: Cell::new(freelist.get()),
            });
        }
        freelist.set(NonNull::new(run));
    }

    fn free_pages(&self) -> usize {
        let mut free_pages = 0usize;
        let freelist = self.freelist.lock();
        let mut optional_run_ref = freelist.get();
        while let Some(run) = optional_run_ref {
            free_pages += 1;
            optional_run_ref = unsafe { run.as_ref() }.next.get();
        }
        free_pages
    }
}

/// View a physical page as bytes
/// # Safety
/// `physical_address` must be a page owned by the caller, and no other
/// reference to it may be live while the slice is.
pub(crate) unsafe fn page_bytes<'a>(physical_address: usize) -> &'a mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(physical_address as *mut u8, PAGE_SIZE) }
}
