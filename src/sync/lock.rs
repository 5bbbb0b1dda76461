//! Mutual-exclusion locks with priority donation.

use crate::thread::{Tid, KernelState};
use crate::Kernel;
use std::sync::Arc;

impl Kernel {
    pub(crate) fn lock_create(&self) -> usize {
        self.lock_state().lock_alloc()
    }

    /// Pushes `from`'s effective priority along the chain of lock holders it
    /// is (transitively) blocked behind. Each hop either raises a holder or
    /// stops; the hop count is bounded by the number of locks in existence.
    fn donate_chain(&self, st: &mut KernelState, mut from: Tid) {
        let limit = st.locks.len();
        for _ in 0..=limit {
            let lock = match st.threads[from].waiting_on {
                Some(lock) => lock,
                None => break,
            };
            let holder = match st.locks[lock].holder {
                Some(holder) => holder,
                None => break,
            };
            let boost = st.threads[from].effective_priority;
            if st.threads[holder].effective_priority >= boost {
                break;
            }
            st.threads[holder].effective_priority = boost;
            from = holder;
        }
    }

    /// Acquires lock `id`, donating priority to the holder while blocked.
    pub(crate) fn lock_acquire_id(&self, id: usize) {
        let sema = {
            let mut st = self.lock_state();
            self.assert_current(&st);
            let cur = st.current;
            let holder = st.locks[id].holder;
            assert_ne!(holder, Some(cur), "lock is not reentrant");
            if let Some(holder) = holder {
                st.threads[cur].waiting_on = Some(id);
                if !self.mlfqs {
                    if !st.threads[holder].donors.contains(&cur) {
                        st.threads[holder].donors.push(cur);
                    }
                    self.donate_chain(&mut st, cur);
                }
            }
            st.locks[id].sema
        };
        self.sema_down_id(sema);
        let mut st = self.lock_state();
        let cur = st.current;
        st.locks[id].holder = Some(cur);
        st.threads[cur].waiting_on = None;
        if !self.mlfqs {
            // Threads still blocked behind this lock now donate to the new
            // holder. Going by `waiting_on` rather than the semaphore queue
            // also catches a waiter that was woken but lost the lock again
            // before it ran.
            let mut donors = std::mem::take(&mut st.threads[cur].donors);
            for t in 0..st.threads.len() {
                if t != cur && st.threads[t].waiting_on == Some(id) && !donors.contains(&t) {
                    donors.push(t);
                }
            }
            st.threads[cur].donors = donors;
            st.threads[cur].effective_priority = Kernel::recompute_effective(&st, cur);
        }
    }

    /// Releases lock `id`, dropping the donations that came through it and
    /// waking the best waiter.
    pub(crate) fn lock_release_id(&self, id: usize) {
        let sema = {
            let mut st = self.lock_state();
            self.assert_current(&st);
            let cur = st.current;
            assert_eq!(
                st.locks[id].holder,
                Some(cur),
                "thread released a lock it does not hold"
            );
            st.locks[id].holder = None;
            if !self.mlfqs {
                let mut donors = std::mem::take(&mut st.threads[cur].donors);
                donors.retain(|&d| st.threads[d].waiting_on != Some(id));
                st.threads[cur].donors = donors;
                st.threads[cur].effective_priority = Kernel::recompute_effective(&st, cur);
            }
            st.locks[id].sema
        };
        self.sema_up_id(sema);
    }

    pub(crate) fn lock_holder(&self, id: usize) -> Option<Tid> {
        self.lock_state().locks[id].holder
    }
}

/// A mutual-exclusion lock.
///
/// Non-reentrant. While a higher-priority thread waits, the holder runs with
/// the waiter's priority; releasing the lock sheds those donations.
#[derive(Clone)]
pub struct Lock {
    kernel: Arc<Kernel>,
    pub(crate) id: usize,
}

impl Lock {
    /// Creates an unheld lock.
    pub fn new(kernel: &Arc<Kernel>) -> Lock {
        Lock {
            kernel: Arc::clone(kernel),
            id: kernel.lock_create(),
        }
    }

    /// Acquires the lock, blocking until it is free. The guard releases on
    /// drop.
    pub fn acquire(&self) -> LockGuard<'_> {
        self.kernel.lock_acquire_id(self.id);
        LockGuard { lock: self }
    }

    /// Thread currently holding the lock, if any.
    pub fn holder(&self) -> Option<Tid> {
        self.kernel.lock_holder(self.id)
    }
}

/// Proof of lock ownership; releases the lock when dropped.
pub struct LockGuard<'a> {
    pub(crate) lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.kernel.lock_release_id(self.lock.id);
    }
}
