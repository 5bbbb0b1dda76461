//! teos: the concurrency and trust-boundary core of a teaching kernel,
//! simulated deterministically in user space.
//!
//! The crate models a small uniprocessor kernel: preemptive priority
//! scheduling with donation (or an optional multilevel feedback queue),
//! semaphores, locks, and condition variables, plus the user-facing side of
//! a kernel: address-space validation, a syscall boundary, per-process file
//! descriptors, and process exec/wait/exit.
//!
//! Instead of running on hardware, the machine is simulated. Every
//! simulated thread is a host thread parked on a private gate; the scheduler
//! opens exactly one gate at a time, so execution is serialized and every
//! interleaving decision is the scheduler's. Time is virtual: it advances
//! only when the running thread calls [`Kernel::tick`], which doubles as the
//! timer interrupt. The same program therefore schedules identically on
//! every run, which is what makes the scheduling and donation behavior
//! assertable in ordinary tests.
//!
//! ```
//! use teos::{KernelBuilder, ThreadBuilder};
//!
//! let kernel = KernelBuilder::new().build();
//! let n = kernel.run(|| {
//!     let k = kernel.clone();
//!     let child = ThreadBuilder::new("child").priority(40).spawn(&kernel, move || {
//!         k.sleep(5);
//!     });
//!     child.join()
//! });
//! assert_eq!(n, 0);
//! ```

pub mod fixed;
pub mod fs;
pub mod mm;
mod power;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod teletype;
pub mod thread;

pub use fs::{FileHandle, MemStorage, Storage, MAX_FILE};
pub use mm::{PageFlags, UserSpace, PGSIZE, PHYS_BASE};
pub use process::{ProgramMain, UserProc};
pub use sync::{Condvar, Lock, LockGuard, Semaphore};
pub use teletype::{ScriptedConsole, Teletype};
pub use thread::scheduler::{NICE_MAX, NICE_MIN, TIMER_FREQ, TIME_SLICE};
pub use thread::{JoinHandle, ThreadBuilder, ThreadState, Tid, PRI_DEFAULT, PRI_MAX, PRI_MIN};

use process::{ExitRequest, ProgramMain as Main};
use std::collections::BTreeMap;
use std::panic;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Once};
use thread::KernelState;

/// Errors of kernel operations, mirroring the usual errno meanings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(isize)]
pub enum KernelError {
    /// Operation not permitted.
    OperationNotPermitted = 1,
    /// No such file or directory.
    NoSuchEntry = 2,
    /// Bad file descriptor.
    BadFileDescriptor = 9,
    /// No child process.
    NoSuchChild = 10,
    /// Out of memory.
    NoMemory = 12,
    /// Permission denied.
    InvalidAccess = 13,
    /// Bad address.
    BadAddress = 14,
    /// File exists.
    FileExist = 17,
    /// Invalid argument.
    InvalidArgument = 22,
    /// Too many open files.
    TooManyOpenFile = 24,
    /// Unknown system call.
    NoSuchSyscall = 38,
}

impl From<KernelError> for isize {
    /// The conventional negative errno encoding.
    fn from(e: KernelError) -> isize {
        -(e as isize)
    }
}

/// The simulated machine.
///
/// Built once through [`KernelBuilder`], shared as an `Arc`, and driven from
/// inside [`Kernel::run`]. All scheduling state sits behind one mutex;
/// holding it is the simulation's interrupt-disabled section.
pub struct Kernel {
    pub(crate) state: Mutex<KernelState>,
    pub(crate) mlfqs: bool,
    pub(crate) console: Mutex<Box<dyn Teletype>>,
    pub(crate) storage: Mutex<Box<dyn Storage>>,
    pub(crate) programs: BTreeMap<String, Main>,
    /// Global filesystem lock, allocated at build time.
    pub(crate) fs_lock: usize,
    pub(crate) halted: AtomicBool,
}

/// Configures and builds a [`Kernel`].
pub struct KernelBuilder {
    mlfqs: bool,
    console: Box<dyn Teletype>,
    storage: Box<dyn Storage>,
    programs: BTreeMap<String, Main>,
}

impl KernelBuilder {
    /// Starts from the defaults: priority scheduling with donation, an empty
    /// in-memory filesystem, and a console with no input.
    pub fn new() -> KernelBuilder {
        KernelBuilder {
            mlfqs: false,
            console: Box::new(ScriptedConsole::new(&b""[..])),
            storage: Box::new(MemStorage::new()),
            programs: BTreeMap::new(),
        }
    }

    /// Selects the multilevel-feedback-queue scheduler.
    pub fn mlfqs(mut self, on: bool) -> KernelBuilder {
        self.mlfqs = on;
        self
    }

    /// Mounts a console device.
    pub fn console(mut self, console: impl Teletype + 'static) -> KernelBuilder {
        self.console = Box::new(console);
        self
    }

    /// Mounts a filesystem.
    pub fn storage(mut self, storage: impl Storage + 'static) -> KernelBuilder {
        self.storage = Box::new(storage);
        self
    }

    /// Registers a program that `exec` can start by name.
    pub fn program(
        mut self,
        name: impl Into<String>,
        main: impl Fn(&UserProc) -> i32 + Send + Sync + 'static,
    ) -> KernelBuilder {
        self.programs.insert(name.into(), Arc::new(main));
        self
    }

    pub fn build(self) -> Arc<Kernel> {
        let mut state = KernelState::new();
        let fs_lock = state.lock_alloc();
        Arc::new(Kernel {
            state: Mutex::new(state),
            mlfqs: self.mlfqs,
            console: Mutex::new(self.console),
            storage: Mutex::new(self.storage),
            programs: self.programs,
            fs_lock,
            halted: AtomicBool::new(false),
        })
    }
}

impl Default for KernelBuilder {
    fn default() -> KernelBuilder {
        KernelBuilder::new()
    }
}

/// Exit unwinds are the normal way out of a process; keep the default hook
/// from splattering them over stderr.
fn silence_exit_unwinds() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ExitRequest>().is_none() {
                previous(info);
            }
        }));
    });
}

impl Kernel {
    /// Boots the machine, runs `f` as its first thread, then keeps the
    /// machine running until every spawned thread has exited.
    ///
    /// All other kernel operations must happen inside `f` or in threads it
    /// (transitively) spawns.
    pub fn run<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> R {
        silence_exit_unwinds();
        {
            let mut st = self.lock_state();
            assert!(st.threads.is_empty(), "the machine can only boot once");
            let tid = st.thread_alloc(
                "main".to_string(),
                PRI_DEFAULT,
                0,
                fixed::Fixed::ZERO,
                None,
                None,
            );
            st.threads[tid].state = ThreadState::Running;
            st.current = tid;
            st.live = 1;
        }
        thread::set_current_tid(Some(0));
        log::debug!("machine up");
        let result = f();
        self.drain();
        thread::set_current_tid(None);
        log::debug!("machine drained after {} ticks", self.ticks());
        result
    }
}
