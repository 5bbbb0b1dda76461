//! Monitor condition variables.

use super::lock::LockGuard;
use crate::Kernel;
use std::sync::Arc;

impl Kernel {
    pub(crate) fn cond_create(&self) -> usize {
        self.lock_state().cond_alloc()
    }

    /// Atomically releases `lock`, waits for a signal on `cond`, and
    /// reacquires `lock`.
    ///
    /// Each waiter blocks on its personal wait token. The token is a
    /// semaphore, so a signal delivered between the release and the block is
    /// retained rather than lost.
    pub(crate) fn cond_wait_id(&self, cond: usize, lock: usize) {
        let token = {
            let mut st = self.lock_state();
            self.assert_current(&st);
            let cur = st.current;
            st.conds[cond].waiters.push_back(cur);
            st.threads[cur].wait_sema
        };
        self.lock_release_id(lock);
        self.sema_down_id(token);
        self.lock_acquire_id(lock);
    }

    /// Wakes the highest-effective-priority waiter on `cond`, if any.
    pub(crate) fn cond_signal_id(&self, cond: usize) -> bool {
        let token = {
            let mut st = self.lock_state();
            self.assert_current(&st);
            let best = st
                .conds[cond]
                .waiters
                .iter()
                .enumerate()
                .max_by_key(|&(i, &tid)| {
                    (st.threads[tid].effective_priority, std::cmp::Reverse(i))
                })
                .map(|(i, _)| i);
            match best {
                Some(i) => st.conds[cond]
                    .waiters
                    .remove(i)
                    .map(|tid| st.threads[tid].wait_sema),
                None => None,
            }
        };
        match token {
            Some(token) => {
                self.sema_up_id(token);
                true
            }
            None => false,
        }
    }

    /// Wakes every waiter on `cond`.
    pub(crate) fn cond_broadcast_id(&self, cond: usize) {
        while self.cond_signal_id(cond) {}
    }
}

/// A monitor condition variable, used together with a [`Lock`].
///
/// [`Lock`]: super::Lock
#[derive(Clone)]
pub struct Condvar {
    kernel: Arc<Kernel>,
    id: usize,
}

impl Condvar {
    /// Creates a condition variable.
    pub fn new(kernel: &Arc<Kernel>) -> Condvar {
        Condvar {
            kernel: Arc::clone(kernel),
            id: kernel.cond_create(),
        }
    }

    /// Releases the guarded lock, waits for a signal, and reacquires it.
    ///
    /// As with any monitor, the awaited condition must be re-checked on
    /// return.
    pub fn wait<'a>(&self, guard: LockGuard<'a>) -> LockGuard<'a> {
        let lock = guard.lock;
        std::mem::forget(guard);
        self.kernel.cond_wait_id(self.id, lock.id);
        LockGuard { lock }
    }

    /// Wakes the best waiter, if any.
    pub fn signal(&self) {
        self.kernel.cond_signal_id(self.id);
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        self.kernel.cond_broadcast_id(self.id);
    }
}
