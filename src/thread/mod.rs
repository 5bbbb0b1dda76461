//! Thread abstraction and lifecycle.
//!
//! ## The threading model
//!
//! A running kernel consists of a collection of threads, each with its own
//! host-side stack and a record in the kernel's thread arena. The simulation
//! keeps the single-core discipline of the modeled machine: exactly one
//! thread is `Running` at any instant. Every other live thread is parked on
//! its own [`Gate`] until the scheduler selects it, so all interleaving
//! happens at well-defined scheduling points and runs are deterministic.
//!
//! Threads are identified by a stable integer id (`Tid`) indexing the arena.
//! Every set a thread can belong to, the ready queue, the sleep set, a
//! primitive's wait set, a donation list, a child list, is a container of
//! ids. A thread is a member of exactly one of {ready queue, sleep set,
//! blocked-on-primitive set, running slot} at any instant.

pub mod scheduler;

use crate::process::{ExitRequest, Process, UserProc};
use crate::fixed::Fixed;
use crate::Kernel;
use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar as HostCondvar, Mutex as HostMutex, MutexGuard};

/// Thread identifier: a stable index into the thread arena.
pub type Tid = usize;

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Default priority.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;

/// A possible state of a thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Currently executing.
    Running,
    /// Runnable, sitting in the ready queue.
    Ready,
    /// Waiting in a primitive's wait set or in the sleep set.
    Blocked,
    /// Exited; the record is kept only for bookkeeping.
    Dying,
    /// Exited user process whose status has not yet been collected by a
    /// parent.
    Exiting,
}

thread_local! {
    static CURRENT_TID: Cell<Option<Tid>> = const { Cell::new(None) };
}

pub(crate) fn set_current_tid(tid: Option<Tid>) {
    CURRENT_TID.with(|c| c.set(tid));
}

pub(crate) fn current_tid() -> Option<Tid> {
    CURRENT_TID.with(|c| c.get())
}

/// Per-thread parking spot. A thread runs only while its gate is open;
/// opening the gate is the simulation's context switch into the thread.
pub(crate) struct Gate {
    runnable: HostMutex<bool>,
    cv: HostCondvar,
}

impl Gate {
    pub(crate) fn new() -> Arc<Gate> {
        Arc::new(Gate {
            runnable: HostMutex::new(false),
            cv: HostCondvar::new(),
        })
    }

    pub(crate) fn open(&self) {
        let mut g = self.runnable.lock().unwrap_or_else(|e| e.into_inner());
        *g = true;
        self.cv.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut g = self.runnable.lock().unwrap_or_else(|e| e.into_inner());
        while !*g {
            g = self.cv.wait(g).unwrap_or_else(|e| e.into_inner());
        }
        *g = false;
    }
}

/// One thread's record in the arena, indexed by its id.
pub(crate) struct ThreadRecord {
    pub name: String,
    pub state: ThreadState,
    /// Priority set by the thread itself (or the feedback-queue formula).
    pub base_priority: i32,
    /// Priority after donations; what the scheduler actually compares.
    pub effective_priority: i32,
    pub nice: i32,
    pub recent_cpu: Fixed,
    /// Lock this thread is blocked acquiring, if any.
    pub waiting_on: Option<usize>,
    /// Threads currently donating their priority to this one.
    pub donors: Vec<Tid>,
    pub gate: Arc<Gate>,
    pub parent: Option<Tid>,
    pub children: Vec<Tid>,
    pub exit_status: Option<i32>,
    /// Lock guarding the exit handshake.
    pub exit_lock: usize,
    /// Broadcast on exit; parents wait here.
    pub exit_cond: usize,
    /// Personal binary semaphore used as a condition-variable wait token.
    pub wait_sema: usize,
    /// User-process state; `None` for kernel threads.
    pub process: Option<Process>,
    /// Unwind payload of a panicked thread, rethrown on join.
    pub panic_payload: Option<Box<dyn Any + Send>>,
}

impl ThreadRecord {
    /// Frees a reaped thread's owned buffers. Ids are never reused, so the
    /// record itself stays in the arena as a tombstone.
    pub(crate) fn reclaim(&mut self) {
        self.donors = Vec::new();
        self.children = Vec::new();
        self.panic_payload = None;
    }
}

/// Counting semaphore state.
pub(crate) struct SemState {
    pub value: usize,
    pub waiters: VecDeque<Tid>,
}

/// Lock state: a binary semaphore plus a holder for donation bookkeeping.
pub(crate) struct LockState {
    pub holder: Option<Tid>,
    pub sema: usize,
}

/// Condition variable state. Each waiter blocks on its personal wait token,
/// so releasing the monitor lock and blocking happen without a wakeup window.
pub(crate) struct CondState {
    pub waiters: VecDeque<Tid>,
}

/// All mutable scheduler state. Holding the enclosing mutex is the
/// simulation's interrupt-disabled critical section: nothing may park while
/// it is held.
pub(crate) struct KernelState {
    /// Thread arena indexed by `Tid`. Slots are never reused; a reaped or
    /// joined thread leaves a tombstone record with its buffers freed.
    pub threads: Vec<ThreadRecord>,
    pub current: Tid,
    pub ready: VecDeque<Tid>,
    /// `(wakeup_tick, tid)` pairs; unordered, with the minimum cached below.
    pub sleepers: Vec<(i64, Tid)>,
    /// Minimum pending wakeup tick, recomputed whenever the sleep set
    /// changes.
    pub min_wakeup: Option<i64>,
    pub ticks: i64,
    pub slice_left: i64,
    pub load_avg: Fixed,
    pub sems: Vec<SemState>,
    pub locks: Vec<LockState>,
    pub conds: Vec<CondState>,
    /// Number of threads that have not exited.
    pub live: usize,
}

impl KernelState {
    pub(crate) fn new() -> KernelState {
        KernelState {
            threads: Vec::new(),
            current: 0,
            ready: VecDeque::new(),
            sleepers: Vec::new(),
            min_wakeup: None,
            ticks: 0,
            slice_left: scheduler::TIME_SLICE,
            load_avg: Fixed::ZERO,
            sems: Vec::new(),
            locks: Vec::new(),
            conds: Vec::new(),
            live: 0,
        }
    }

    pub(crate) fn sema_alloc(&mut self, value: usize) -> usize {
        self.sems.push(SemState {
            value,
            waiters: VecDeque::new(),
        });
        self.sems.len() - 1
    }

    pub(crate) fn lock_alloc(&mut self) -> usize {
        let sema = self.sema_alloc(1);
        self.locks.push(LockState { holder: None, sema });
        self.locks.len() - 1
    }

    pub(crate) fn cond_alloc(&mut self) -> usize {
        self.conds.push(CondState {
            waiters: VecDeque::new(),
        });
        self.conds.len() - 1
    }

    /// Allocates a thread record in `Ready` state and returns its id.
    pub(crate) fn thread_alloc(
        &mut self,
        name: String,
        priority: i32,
        nice: i32,
        recent_cpu: Fixed,
        parent: Option<Tid>,
        process: Option<Process>,
    ) -> Tid {
        let tid = self.threads.len();
        let exit_lock = self.lock_alloc();
        let exit_cond = self.cond_alloc();
        let wait_sema = self.sema_alloc(0);
        self.threads.push(ThreadRecord {
            name,
            state: ThreadState::Ready,
            base_priority: priority,
            effective_priority: priority,
            nice,
            recent_cpu,
            waiting_on: None,
            donors: Vec::new(),
            gate: Gate::new(),
            parent,
            children: Vec::new(),
            exit_status: None,
            exit_lock,
            exit_cond,
            wait_sema,
            process,
            panic_payload: None,
        });
        if let Some(p) = parent {
            self.threads[p].children.push(tid);
        }
        tid
    }
}

impl Kernel {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Asserts that the caller is the thread the scheduler believes is
    /// running. Kernel operations invoked from outside the simulation would
    /// otherwise silently corrupt scheduling state.
    pub(crate) fn assert_current(&self, st: &KernelState) {
        debug_assert_eq!(
            current_tid(),
            Some(st.current),
            "kernel operation invoked from a thread the scheduler is not running"
        );
    }

    /// Returns the running thread's id.
    pub fn current(&self) -> Tid {
        let st = self.lock_state();
        self.assert_current(&st);
        st.current
    }

    /// Returns the state of thread `tid`.
    pub fn state_of(&self, tid: Tid) -> ThreadState {
        self.lock_state().threads[tid].state
    }

    /// Returns the effective (post-donation) priority of thread `tid`.
    pub fn priority_of(&self, tid: Tid) -> i32 {
        self.lock_state().threads[tid].effective_priority
    }

    /// Returns the running thread's effective priority.
    pub fn priority(&self) -> i32 {
        let st = self.lock_state();
        self.assert_current(&st);
        st.threads[st.current].effective_priority
    }

    /// Returns the current virtual time in ticks.
    pub fn ticks(&self) -> i64 {
        self.lock_state().ticks
    }
}

/// A builder for spawning threads.
pub struct ThreadBuilder {
    name: String,
    priority: i32,
}

impl ThreadBuilder {
    /// Creates a builder for a thread called `name`.
    pub fn new(name: impl Into<String>) -> ThreadBuilder {
        ThreadBuilder {
            name: name.into(),
            priority: PRI_DEFAULT,
        }
    }

    /// Sets the thread's base priority. Ignored when the feedback-queue
    /// scheduler is active.
    pub fn priority(mut self, priority: i32) -> ThreadBuilder {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        self.priority = priority;
        self
    }

    /// Spawns the thread and returns a handle to join it.
    pub fn spawn<F>(self, kernel: &Arc<Kernel>, f: F) -> JoinHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_inner(kernel, None, move |_| {
            f();
            0
        })
    }

    pub(crate) fn spawn_inner<F>(
        self,
        kernel: &Arc<Kernel>,
        process: Option<Process>,
        body: F,
    ) -> JoinHandle
    where
        F: FnOnce(&UserProc) -> i32 + Send + 'static,
    {
        let mut st = kernel.lock_state();
        assert!(
            !st.threads.is_empty(),
            "threads can only be spawned inside Kernel::run"
        );
        kernel.assert_current(&st);
        let cur = st.current;
        // The feedback-queue scheduler derives the child's priority from the
        // inherited nice and recent-CPU values.
        let (nice, recent_cpu) = (st.threads[cur].nice, st.threads[cur].recent_cpu);
        let priority = if kernel.mlfqs {
            scheduler::mlfqs_priority(recent_cpu, nice)
        } else {
            self.priority
        };
        let tid = st.thread_alloc(self.name.clone(), priority, nice, recent_cpu, Some(cur), process);
        st.ready.push_back(tid);
        st.live += 1;
        let gate = st.threads[tid].gate.clone();
        let preempt =
            st.threads[tid].effective_priority > st.threads[cur].effective_priority;
        drop(st);

        log::debug!("spawn {:?} as tid {}", self.name, tid);
        let k = Arc::clone(kernel);
        std::thread::Builder::new()
            .name(self.name)
            .spawn(move || {
                gate.wait();
                set_current_tid(Some(tid));
                let user = UserProc::new(Arc::clone(&k));
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&user)));
                let (status, print, payload) = match outcome {
                    Ok(code) => (code, true, None),
                    Err(p) => match p.downcast::<ExitRequest>() {
                        Ok(req) => (req.status, req.print, None),
                        Err(p) => (-1, true, Some(p)),
                    },
                };
                crate::process::finish_current(&k, status, print, payload);
            })
            .expect("failed to spawn host thread");

        if preempt {
            kernel.yield_now();
        }
        JoinHandle {
            kernel: Arc::clone(kernel),
            tid,
        }
    }
}

/// A handle to join a spawned thread.
pub struct JoinHandle {
    kernel: Arc<Kernel>,
    /// Thread id of this handle.
    pub tid: Tid,
}

impl JoinHandle {
    /// Blocks until the thread exits and returns its exit code.
    ///
    /// If the thread panicked, the panic is rethrown here so test failures
    /// surface in the joining thread.
    pub fn join(self) -> i32 {
        let (exit_lock, exit_cond) = {
            let st = self.kernel.lock_state();
            let th = &st.threads[self.tid];
            (th.exit_lock, th.exit_cond)
        };
        self.kernel.lock_acquire_id(exit_lock);
        loop {
            let done = self.kernel.lock_state().threads[self.tid].exit_status;
            match done {
                Some(status) => {
                    self.kernel.lock_release_id(exit_lock);
                    let payload = {
                        let mut st = self.kernel.lock_state();
                        let th = &mut st.threads[self.tid];
                        let payload = th.panic_payload.take();
                        th.reclaim();
                        payload
                    };
                    if let Some(p) = payload {
                        panic::resume_unwind(p);
                    }
                    return status;
                }
                None => self.kernel.cond_wait_id(exit_cond, exit_lock),
            }
        }
    }
}
