//! Counting semaphores.

use crate::thread::{ThreadState, Tid};
use crate::Kernel;
use std::sync::Arc;

impl Kernel {
    pub(crate) fn sema_create(&self, value: usize) -> usize {
        self.lock_state().sema_alloc(value)
    }

    /// Decrements semaphore `id`, blocking while its value is zero.
    ///
    /// A woken waiter re-checks the value: a third thread may have taken the
    /// unit between the wakeup and this thread being scheduled.
    pub(crate) fn sema_down_id(&self, id: usize) {
        loop {
            let mut st = self.lock_state();
            self.assert_current(&st);
            if st.sems[id].value > 0 {
                st.sems[id].value -= 1;
                return;
            }
            let cur = st.current;
            st.sems[id].waiters.push_back(cur);
            st.threads[cur].state = ThreadState::Blocked;
            self.schedule(st);
        }
    }

    /// Increments semaphore `id` and readies its best waiter, yielding if
    /// that waiter (or anything else runnable) now outranks the caller.
    pub(crate) fn sema_up_id(&self, id: usize) {
        let mut st = self.lock_state();
        self.assert_current(&st);
        st.sems[id].value += 1;
        let best = st
            .sems[id]
            .waiters
            .iter()
            .enumerate()
            .max_by_key(|&(i, &tid)| (st.threads[tid].effective_priority, std::cmp::Reverse(i)))
            .map(|(i, _)| i);
        if let Some(i) = best {
            if let Some(tid) = st.sems[id].waiters.remove(i) {
                st.threads[tid].state = ThreadState::Ready;
                st.ready.push_back(tid);
            }
        }
        self.yield_if_outranked(st);
    }

    pub(crate) fn sema_waiters(&self, id: usize) -> Vec<Tid> {
        self.lock_state().sems[id].waiters.iter().copied().collect()
    }
}

/// A counting semaphore.
///
/// `down` blocks while the value is zero; `up` never blocks. Waiters are
/// released highest effective priority first.
#[derive(Clone)]
pub struct Semaphore {
    kernel: Arc<Kernel>,
    id: usize,
}

impl Semaphore {
    /// Creates a semaphore with the given initial value.
    pub fn new(kernel: &Arc<Kernel>, value: usize) -> Semaphore {
        Semaphore {
            kernel: Arc::clone(kernel),
            id: kernel.sema_create(value),
        }
    }

    /// Decrements the value, blocking until it is positive.
    pub fn down(&self) {
        self.kernel.sema_down_id(self.id);
    }

    /// Increments the value and wakes the best waiter, if any.
    pub fn up(&self) {
        self.kernel.sema_up_id(self.id);
    }

    /// Thread ids currently blocked on this semaphore.
    pub fn waiters(&self) -> Vec<Tid> {
        self.kernel.sema_waiters(self.id)
    }
}
