#![allow(dead_code)]

//! Host machine for integration tests.
//!
//! Every process is a host thread and every CPU is a scheduler thread. A
//! context switch hands a baton from one thread to the other, so exactly one
//! thread per CPU makes progress at a time and the kernel's own scheduling,
//! sleep and lock handoff code runs as is.

use eevdf_kernel::error::{IoError, VmError};
use eevdf_kernel::file::{File, Inode};
use eevdf_kernel::println::{init_logger, Console};
use eevdf_kernel::syscall::Sysno;
use eevdf_kernel::trap::{Exception, Interrupt, Trap};
use eevdf_kernel::vm::PAGE_SIZE;
use eevdf_kernel::{
    Kernel, KernelConfig, KernelPageAllocator, Machine, Page, Pid, ProcRef, ProcState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Once, OnceLock};
use std::thread;
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(30);
/// Where tests keep exit statuses and other scratch values in the root image
pub const SCRATCH: usize = 0x800;

const FAKE_TRAMPOLINE: usize = 0x8000_0000;
const IDLE: Duration = Duration::from_micros(200);

pub type Program = Box<dyn FnOnce(User) + Send>;

struct StderrConsole;

impl Console for StderrConsole {
    fn print_byte(&self, byte: u8) -> core::fmt::Result {
        eprint!("{}", byte as char);
        Ok(())
    }

    fn print_str(&self, string: &str) -> core::fmt::Result {
        eprint!("{string}");
        Ok(())
    }
}

/// Binary semaphore
#[derive(Default)]
struct Baton {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl Baton {
    fn pass(&self) {
        *self.ready.lock().unwrap() = true;
        self.cond.notify_one();
    }

    fn take(&self) {
        let mut ready = self.ready.lock().unwrap();
        while !*ready {
            ready = self.cond.wait(ready).unwrap();
        }
        *ready = false;
    }
}

pub struct Sim {
    this: OnceLock<&'static Sim>,
    kernel: OnceLock<&'static Kernel>,
    cpus: Vec<Baton>,
    /// Process batons, keyed by pid
    procs: Mutex<HashMap<Pid, Arc<Baton>>>,
    /// CPU each process was last dispatched on
    placement: Mutex<HashMap<Pid, usize>>,
    programs: Mutex<HashMap<Pid, Program>>,
    /// Last interrupt-enable state any CPU asked for
    interrupts: AtomicBool,
}

impl Sim {
    /// A machine with `cpus` CPUs and a pool of `pages` physical pages
    pub fn boot(cpus: usize, pages: usize) -> &'static Sim {
        static LOGGER: Once = Once::new();
        LOGGER.call_once(|| {
            let _ = init_logger(&StderrConsole, log::LevelFilter::Warn);
        });

        let pool = Box::leak(vec![Page::zeroed(); pages].into_boxed_slice());
        let kmem: &'static KernelPageAllocator =
            Box::leak(Box::new(KernelPageAllocator::from_pages(pool)));

        let sim: &'static Sim = Box::leak(Box::new(Sim {
            this: OnceLock::new(),
            kernel: OnceLock::new(),
            cpus: (0..cpus).map(|_| Baton::default()).collect(),
            procs: Mutex::new(HashMap::new()),
            placement: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            interrupts: AtomicBool::new(false),
        }));
        let config = KernelConfig::default()
            .with_cpus(cpus)
            .with_log_level(log::LevelFilter::Warn);
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(config, kmem, sim)));
        assert!(sim.this.set(sim).is_ok());
        assert!(sim.kernel.set(kernel).is_ok());
        sim
    }

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel.get().expect("sim not booted")
    }

    /// Create the root process running `body`, then start every CPU.
    ///
    /// Once `body` returns, the root process keeps reaping orphans.
    pub fn start(&'static self, body: impl FnOnce(User) + Send + 'static) {
        let kernel = self.kernel();
        let init = kernel.user_init(&[0x13, 0, 0, 0]).expect("user_init");
        self.programs.lock().unwrap().insert(
            init.pid(),
            Box::new(move |user: User| {
                body(user);
                loop {
                    if kernel.wait(user.me, 0).is_err() {
                        let _ = kernel.sleep_ticks(user.me, 10);
                    }
                }
            }),
        );

        for cpu in 0..self.cpus.len() {
            thread::Builder::new()
                .name(format!("cpu {cpu}"))
                .spawn(move || loop {
                    // As `Kernel::scheduler` does before every pass
                    self.intr_on();
                    if !kernel.scheduler_pass(cpu) {
                        if cpu == 0 {
                            kernel.clock_interrupt(None);
                        }
                        thread::sleep(IDLE);
                    }
                })
                .expect("spawn cpu");
        }
    }

    fn spawn_process(&self, proc: ProcRef, baton: Arc<Baton>) {
        let sim = *self.this.get().expect("sim not booted");
        let kernel = self.kernel();
        thread::Builder::new()
            .name(format!("pid {}", proc.pid()))
            .spawn(move || {
                baton.take();
                unsafe { kernel.forkret(proc) };
                let program = sim.programs.lock().unwrap().remove(&proc.pid());
                if let Some(program) = program {
                    program(User {
                        kernel,
                        sim,
                        me: proc,
                    });
                }
                kernel.exit(proc, 0);
            })
            .expect("spawn process");
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn baton(&self, pid: Pid) -> Arc<Baton> {
        self.procs.lock().unwrap()[&pid].clone()
    }
}

impl Machine for Sim {
    fn trampoline(&self) -> usize {
        FAKE_TRAMPOLINE
    }

    fn run(&self, cpu: usize, proc: ProcRef) {
        self.placement.lock().unwrap().insert(proc.pid(), cpu);
        let baton = {
            let mut procs = self.procs.lock().unwrap();
            match procs.get(&proc.pid()) {
                Some(baton) => baton.clone(),
                None => {
                    let baton = Arc::new(Baton::default());
                    procs.insert(proc.pid(), baton.clone());
                    self.spawn_process(proc, baton.clone());
                    baton
                }
            }
        };
        baton.pass();
        self.cpus[cpu].take();
    }

    fn switch_to_scheduler(&self, proc: ProcRef) {
        let cpu = self.placement.lock().unwrap()[&proc.pid()];
        let baton = self.baton(proc.pid());
        self.cpus[cpu].pass();
        baton.take();
    }

    fn intr_on(&self) {
        self.interrupts.store(true, Ordering::SeqCst);
    }

    fn intr_off(&self) {
        self.interrupts.store(false, Ordering::SeqCst);
    }
}

/// Boot a machine and run `body` as the root process, failing the test if
/// it panics or does not finish in time
pub fn run_root(cpus: usize, pages: usize, body: impl FnOnce(User) + Send + 'static) {
    let sim = Sim::boot(cpus, pages);
    let (done, finished) = mpsc::channel();
    sim.start(move |user| {
        body(user);
        let _ = done.send(());
    });
    finished
        .recv_timeout(TIMEOUT)
        .expect("root process did not finish");
}

/// What a running process can do: trap into the kernel, touch its memory
#[derive(Clone, Copy)]
pub struct User {
    pub kernel: &'static Kernel,
    pub sim: &'static Sim,
    pub me: ProcRef,
}

impl User {
    pub fn pid(&self) -> Pid {
        self.me.pid()
    }

    /// Fork, with the child running `child`
    pub fn fork(&self, child: impl FnOnce(User) + Send + 'static) -> Pid {
        self.try_fork(child).expect("fork")
    }

    pub fn try_fork(
        &self,
        child: impl FnOnce(User) + Send + 'static,
    ) -> Result<Pid, eevdf_kernel::error::ProcError> {
        // The child looks its program up only after this lock is released.
        let mut programs = self.sim.programs.lock().unwrap();
        let pid = self.kernel.fork(self.me)?;
        programs.insert(pid, Box::new(child));
        Ok(pid)
    }

    /// System call through the trap frame
    pub fn ecall(&self, sysno: Sysno, args: &[u64]) -> u64 {
        self.kernel.with_trapframe(self.me, |frame| {
            frame.a7 = sysno as u64;
            let registers = [
                &mut frame.a0,
                &mut frame.a1,
                &mut frame.a2,
                &mut frame.a3,
                &mut frame.a4,
                &mut frame.a5,
            ];
            for (register, value) in registers.into_iter().zip(args) {
                *register = *value;
            }
        });
        self.kernel
            .usertrap(self.me, Exception::UserEnvCall as u64, 0);
        self.kernel.with_trapframe(self.me, |frame| frame.a0)
    }

    /// Signed view of a system call result
    pub fn ecall_signed(&self, sysno: Sysno, args: &[u64]) -> i64 {
        self.ecall(sysno, args) as i64
    }

    /// Store as user code would, taking page faults on the way
    pub fn store(&self, address: usize, bytes: &[u8]) {
        for _ in 0..=bytes.len() / PAGE_SIZE + 1 {
            match self.kernel.copyout(self.me, address, bytes) {
                Ok(()) => return,
                Err(err) => self.kernel.usertrap(
                    self.me,
                    Exception::StorePageFault as u64,
                    fault_address(err, address) as u64,
                ),
            }
        }
        panic!("store at {address:#x} keeps faulting");
    }

    /// Load as user code would, taking page faults on the way
    pub fn load(&self, address: usize, length: usize) -> Vec<u8> {
        let mut bytes = vec![0; length];
        for _ in 0..=length / PAGE_SIZE + 1 {
            match self.kernel.copyin(self.me, &mut bytes, address) {
                Ok(()) => return bytes,
                Err(err) => self.kernel.usertrap(
                    self.me,
                    Exception::LoadPageFault as u64,
                    fault_address(err, address) as u64,
                ),
            }
        }
        panic!("load at {address:#x} keeps faulting");
    }

    pub fn load_i32(&self, address: usize) -> i32 {
        let bytes = self.load(address, 4);
        i32::from_ne_bytes(bytes.try_into().unwrap())
    }

    /// Take a timer interrupt
    pub fn tick(&self) {
        self.kernel.usertrap(
            self.me,
            Trap::INTERRUPT_BIT | Interrupt::SupervisorTimer as u64,
            0,
        );
    }

    /// Run until `pid` is asleep.
    ///
    /// Polling on the tick channel never sees a tick sleeper asleep: the
    /// same tick wakes both, and the poller wins the tie. Spending a tick
    /// first puts us behind `pid` in virtual time, so yielding lets it run.
    pub fn wait_until_sleeping(&self, pid: Pid) {
        while self.kernel.ps(Some(self.me), pid)[0].state != ProcState::Sleeping {
            self.tick();
            self.kernel.yield_cpu(self.me);
        }
    }

    pub fn exit(&self, status: i32) -> ! {
        self.kernel.exit(self.me, status)
    }

    /// Wait for child `pid` and return its exit status
    pub fn reap(&self, pid: Pid) -> i32 {
        self.kernel
            .waitpid(self.me, pid, SCRATCH)
            .expect("waitpid");
        self.load_i32(SCRATCH)
    }
}

fn fault_address(err: VmError, fallback: usize) -> usize {
    match err {
        VmError::NotMapped(address)
        | VmError::PermissionDenied(address)
        | VmError::BadAddress(address)
        | VmError::Remap(address) => address,
        VmError::OutOfMemory => fallback,
    }
}

/// File contents held in memory
pub struct MemInode(pub Vec<u8>);

impl Inode for MemInode {
    fn read_at(&self, destination: &mut [u8], offset: usize) -> Result<usize, IoError> {
        let Some(available) = self.0.get(offset..) else {
            return Ok(0);
        };
        let count = destination.len().min(available.len());
        destination[..count].copy_from_slice(&available[..count]);
        Ok(count)
    }
}

/// A disk that fails every read
pub struct BrokenInode;

impl Inode for BrokenInode {
    fn read_at(&self, _destination: &mut [u8], _offset: usize) -> Result<usize, IoError> {
        Err(IoError)
    }
}

pub fn open(contents: &[u8], readable: bool, writable: bool) -> Arc<File> {
    File::new(Arc::new(MemInode(contents.to_vec())), readable, writable)
}
