//! User processes: creation, the exit protocol, and parent/child waits.
//!
//! A process is a thread that additionally owns an address space, a
//! descriptor table, and an open write-denied handle on its own executable.
//! Programs are host closures registered under a name at kernel build time;
//! `exec` looks the name up, builds the process state, and spawns it.
//!
//! Exiting is an unwind: `exit` (and any kernel-detected fault) panics with
//! an [`ExitRequest`], the spawn wrapper catches it, and the thread finishes
//! through [`finish_current`], which closes descriptors, prints the exit
//! line, and hands the status to whoever is waiting. A genuine panic in the
//! program is recorded as status -1 and rethrown when the thread is joined.

use crate::fs::{FileHandle, FileTable};
use crate::mm::{PageFlags, UserSpace, PGSIZE, PHYS_BASE};
use crate::syscall::TrapFrame;
use crate::thread::{current_tid, ThreadBuilder, ThreadState, Tid};
use crate::{Kernel, KernelError};
use std::any::Any;
use std::panic;
use std::sync::Arc;

/// Entry point of a registered program.
pub type ProgramMain = Arc<dyn Fn(&UserProc) -> i32 + Send + Sync>;

/// Everything a thread owns when it is a user process.
pub(crate) struct Process {
    pub cmdline: String,
    pub user: UserSpace,
    pub files: FileTable,
    /// Write-denied handle on the executable, held until exit.
    pub exe: Option<Box<dyn FileHandle>>,
}

/// Unwind payload that carries an exit status out of a process.
pub(crate) struct ExitRequest {
    pub status: i32,
    /// Whether to print the usual exit line; a halt suppresses it.
    pub print: bool,
}

/// Kills the calling process with the given status.
pub(crate) fn fault_exit(status: i32) -> ! {
    panic::panic_any(ExitRequest {
        status,
        print: true,
    });
}

/// Finishes the calling thread: releases process resources, publishes the
/// exit status, and schedules away for the last time.
pub(crate) fn finish_current(
    kernel: &Arc<Kernel>,
    status: i32,
    print: bool,
    payload: Option<Box<dyn Any + Send>>,
) {
    let tid = match current_tid() {
        Some(tid) => tid,
        None => return,
    };
    let (name, process, exit_lock, exit_cond) = {
        let mut st = kernel.lock_state();
        let th = &mut st.threads[tid];
        (th.name.clone(), th.process.take(), th.exit_lock, th.exit_cond)
    };
    let had_process = process.is_some();
    if let Some(process) = process {
        // Closing descriptors and the executable handle touches the
        // filesystem, so it happens under the filesystem lock and before the
        // thread stops being schedulable.
        let _fs = kernel.fs_guard();
        drop(process.files);
        drop(process.exe);
    }
    if had_process && print {
        let line = format!("{name}: exit({status})\n");
        let mut console = kernel.console.lock().unwrap_or_else(|e| e.into_inner());
        console.write(line.as_bytes());
    }
    log::debug!("tid {tid} ({name}) exits with {status}");

    kernel.lock_acquire_id(exit_lock);
    {
        let mut st = kernel.lock_state();
        st.threads[tid].exit_status = Some(status);
        st.threads[tid].panic_payload = payload;
    }
    kernel.cond_broadcast_id(exit_cond);
    kernel.lock_release_id(exit_lock);

    let mut st = kernel.lock_state();
    st.threads[tid].state = if had_process {
        ThreadState::Exiting
    } else {
        ThreadState::Dying
    };
    st.live -= 1;
    crate::thread::set_current_tid(None);
    kernel.schedule_exit(st);
}

/// Spawns the program named by the first word of `cmdline` as a child
/// process of the caller. Returns the child's id, or -1 if no such program
/// is registered.
pub(crate) fn execute(kernel: &Arc<Kernel>, cmdline: &str) -> i32 {
    let name = match cmdline.split_whitespace().next() {
        Some(name) => name,
        None => return -1,
    };
    // The load check happens on the caller's side, so a bad name fails the
    // exec itself rather than producing a child that dies on startup.
    let main = match kernel.programs.get(name) {
        Some(main) => Arc::clone(main),
        None => {
            log::debug!("exec {name:?}: no such program");
            return -1;
        }
    };
    let exe = {
        let _fs = kernel.fs_guard();
        let mut storage = kernel.storage.lock().unwrap_or_else(|e| e.into_inner());
        storage.open(name).ok().map(|mut h| {
            h.deny_write();
            h
        })
    };
    let mut user = UserSpace::new();
    if user
        .map_page(PHYS_BASE - PGSIZE as u32, PageFlags::WRITABLE)
        .is_err()
    {
        return -1;
    }
    let process = Process {
        cmdline: cmdline.to_string(),
        user,
        files: FileTable::new(),
        exe,
    };
    let handle = ThreadBuilder::new(name).spawn_inner(kernel, Some(process), move |up| main(up));
    handle.tid as i32
}

impl Kernel {
    /// Runs a registered program as a child of the caller; its id, or -1.
    pub fn exec(self: &Arc<Self>, cmdline: &str) -> i32 {
        execute(self, cmdline)
    }

    /// Waits for direct child `tid` to exit and returns its status.
    ///
    /// A child's status can be collected exactly once; a second wait, or a
    /// wait on anything that is not a direct child, returns -1 immediately.
    pub fn wait(&self, tid: Tid) -> i32 {
        let (exit_lock, exit_cond) = {
            let st = self.lock_state();
            self.assert_current(&st);
            let cur = st.current;
            if tid >= st.threads.len() || !st.threads[cur].children.contains(&tid) {
                return -1;
            }
            (st.threads[tid].exit_lock, st.threads[tid].exit_cond)
        };
        self.lock_acquire_id(exit_lock);
        let status = loop {
            if let Some(status) = self.lock_state().threads[tid].exit_status {
                break status;
            }
            self.cond_wait_id(exit_cond, exit_lock);
        };
        self.lock_release_id(exit_lock);

        let mut st = self.lock_state();
        let cur = st.current;
        st.threads[cur].children.retain(|&c| c != tid);
        st.threads[tid].state = ThreadState::Dying;
        st.threads[tid].reclaim();
        status
    }

    /// Runs `f` with the calling process's address space.
    pub(crate) fn with_user<R>(
        &self,
        f: impl FnOnce(&mut UserSpace) -> R,
    ) -> Result<R, KernelError> {
        let mut st = self.lock_state();
        self.assert_current(&st);
        let cur = st.current;
        match st.threads[cur].process.as_mut() {
            Some(p) => Ok(f(&mut p.user)),
            None => Err(KernelError::OperationNotPermitted),
        }
    }
}

/// Handle a program's code uses to act as the user side of the boundary.
///
/// Programs are host closures, so they cannot fault their way into the
/// kernel; instead they build syscall frames in their simulated address
/// space and trap through [`UserProc::syscall`]. Everything else a real
/// user program could do to its own memory is available through
/// [`map_page`](UserProc::map_page), [`poke`](UserProc::poke), and
/// [`peek`](UserProc::peek).
pub struct UserProc {
    kernel: Arc<Kernel>,
}

impl UserProc {
    pub(crate) fn new(kernel: Arc<Kernel>) -> UserProc {
        UserProc { kernel }
    }

    /// The kernel this process runs on.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// The full command line the process was started with.
    pub fn args(&self) -> String {
        let st = self.kernel.lock_state();
        st.threads[st.current]
            .process
            .as_ref()
            .map(|p| p.cmdline.clone())
            .unwrap_or_default()
    }

    /// Maps a zeroed page into the process's address space.
    pub fn map_page(&self, vaddr: u32, flags: PageFlags) -> Result<(), KernelError> {
        self.kernel.with_user(|us| us.map_page(vaddr, flags))?
    }

    /// Writes one byte of process memory, ignoring page protection.
    pub fn poke(&self, addr: u32, byte: u8) -> bool {
        self.kernel
            .with_user(|us| us.poke(addr, byte))
            .unwrap_or(false)
    }

    /// Reads one byte of process memory.
    pub fn peek(&self, addr: u32) -> Option<u8> {
        self.kernel.with_user(|us| us.peek(addr)).ok().flatten()
    }

    /// Traps into the kernel with a caller-built stack pointer.
    pub fn raw_syscall(&self, esp: u32) -> i32 {
        let mut frame = TrapFrame { esp, eax: 0 };
        crate::syscall::handle(&self.kernel, &mut frame);
        frame.eax as i32
    }

    /// Lays `words` (syscall number first, then arguments) out at the top of
    /// the stack page and traps into the kernel.
    pub fn syscall(&self, words: &[u32]) -> i32 {
        let esp = PHYS_BASE - 4 * words.len() as u32;
        let staged = self.kernel.with_user(|us| {
            for (i, word) in words.iter().enumerate() {
                for (j, byte) in word.to_le_bytes().into_iter().enumerate() {
                    us.poke(esp + 4 * i as u32 + j as u32, byte);
                }
            }
        });
        debug_assert!(staged.is_ok(), "syscall staged by a thread with no process");
        self.raw_syscall(esp)
    }

    /// Terminates the process with `status`, never returning.
    pub fn exit(&self, status: i32) -> ! {
        fault_exit(status)
    }
}
