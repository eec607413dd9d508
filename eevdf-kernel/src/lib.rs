#![cfg_attr(not(test), no_std)]

/*!
   Copyright 2024 Claire Moore

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

   http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

//! Process management core of an xv6-style kernel: an EEVDF scheduler,
//! process lifecycle, sleep and wakeup, and lazily populated memory mappings.
//!
//! Everything hangs off one [`Kernel`] value. The hardware underneath is
//! reached through [`Machine`], physical pages through [`PageAllocator`].

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod file;
pub mod kalloc;
pub mod mmap;
pub mod param;
pub mod println;
pub mod proc;
pub mod sched;
pub mod sleep;
pub mod syscall;
pub mod trap;
pub mod vm;

pub use arch::Machine;
pub use config::KernelConfig;
pub use kalloc::{KernelPageAllocator, Page, PageAllocator};
pub use proc::{Pid, ProcRef, ProcState};

use log::info;
use mmap::MmapTable;
use proc::ProcTable;
use spin::mutex::Mutex;

pub struct Kernel {
    config: KernelConfig,
    pub(crate) procs: ProcTable,
    pub(crate) mmaps: MmapTable,
    /// Timer ticks since boot, also the channel duration sleepers wait on
    pub(crate) ticks: Mutex<u64>,
    pub(crate) kmem: &'static dyn PageAllocator,
    pub(crate) machine: &'static dyn Machine,
}

impl Kernel {
    /// # Panics
    /// Panics if `config` asks for no CPUs or more than [`param::NCPU`].
    pub fn new(
        config: KernelConfig,
        kmem: &'static dyn PageAllocator,
        machine: &'static dyn Machine,
    ) -> Self {
        assert!(config.validate(), "kernel: bad cpu count {}", config.cpus);
        log::set_max_level(config.log_level);
        info!(
            "kernel: {} cpu(s), {} free page(s)",
            config.cpus,
            kmem.free_pages()
        );
        Self {
            config,
            procs: ProcTable::new(),
            mmaps: MmapTable::new(),
            ticks: Mutex::new(0),
            kmem,
            machine,
        }
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Free physical pages
    #[must_use]
    pub fn freemem(&self) -> usize {
        self.kmem.free_pages()
    }
}
