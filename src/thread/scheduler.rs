//! Priority scheduling, virtual time, and the feedback-queue policy.
//!
//! The scheduler always runs a thread whose effective priority is maximal
//! among the runnable set. Ties rotate round-robin: a preempted or yielding
//! thread goes to the back of the ready queue and the earliest-queued thread
//! of the top priority is picked.
//!
//! Virtual time advances only through [`Kernel::tick`], driven by the running
//! thread. When nothing is runnable but threads are asleep, the scheduler
//! advances time straight to the earliest pending wakeup instead of spinning.

use super::{KernelState, ThreadState, Tid, PRI_MAX, PRI_MIN};
use crate::fixed::Fixed;
use crate::Kernel;
use std::sync::MutexGuard;

/// Timer ticks per simulated second.
pub const TIMER_FREQ: i64 = 100;
/// Ticks a thread may run before it is rotated out.
pub const TIME_SLICE: i64 = 4;

/// Lowest nice value.
pub const NICE_MIN: i32 = -20;
/// Highest nice value.
pub const NICE_MAX: i32 = 20;

/// Feedback-queue priority formula:
/// `PRI_MAX - recent_cpu / 4 - nice * 2`, truncated and clamped.
pub(crate) fn mlfqs_priority(recent_cpu: Fixed, nice: i32) -> i32 {
    let p = Fixed::from_int(PRI_MAX) - recent_cpu.div_int(4) - Fixed::from_int(nice * 2);
    p.to_int().clamp(PRI_MIN, PRI_MAX)
}

impl Kernel {
    /// Index of the highest-effective-priority thread in the ready queue,
    /// earliest first among ties.
    fn best_ready(st: &KernelState) -> Option<usize> {
        let mut best: Option<(usize, i32)> = None;
        for (i, &tid) in st.ready.iter().enumerate() {
            let pri = st.threads[tid].effective_priority;
            if best.map_or(true, |(_, b)| pri > b) {
                best = Some((i, pri));
            }
        }
        best.map(|(i, _)| i)
    }

    fn ready_outranks(st: &KernelState, priority: i32) -> bool {
        st.ready
            .iter()
            .any(|&tid| st.threads[tid].effective_priority > priority)
    }

    /// Moves every expired sleeper to the ready queue and refreshes the
    /// cached minimum wakeup.
    pub(crate) fn wake_sleepers(&self, st: &mut KernelState) {
        let now = st.ticks;
        let mut i = 0;
        while i < st.sleepers.len() {
            if st.sleepers[i].0 <= now {
                let (_, tid) = st.sleepers.swap_remove(i);
                st.threads[tid].state = ThreadState::Ready;
                st.ready.push_back(tid);
            } else {
                i += 1;
            }
        }
        st.min_wakeup = st.sleepers.iter().map(|&(t, _)| t).min();
    }

    /// Per-tick accounting for the feedback-queue policy. `running` is the
    /// thread charged for the tick, `None` while the machine is idle.
    fn mlfqs_on_tick(&self, st: &mut KernelState, running: Option<Tid>) {
        if let Some(cur) = running {
            st.threads[cur].recent_cpu = st.threads[cur].recent_cpu.add_int(1);
        }
        if st.ticks % TIMER_FREQ == 0 {
            let ready_count = st.ready.len() + usize::from(running.is_some());
            st.load_avg = Fixed::from_ratio(59, 60) * st.load_avg
                + Fixed::from_ratio(1, 60).mul_int(ready_count as i32);
            let twice = st.load_avg.mul_int(2);
            let coeff = twice / twice.add_int(1);
            for th in &mut st.threads {
                if matches!(
                    th.state,
                    ThreadState::Running | ThreadState::Ready | ThreadState::Blocked
                ) {
                    th.recent_cpu = (coeff * th.recent_cpu).add_int(th.nice);
                }
            }
        }
        if st.ticks % TIME_SLICE == 0 {
            for th in &mut st.threads {
                if matches!(
                    th.state,
                    ThreadState::Running | ThreadState::Ready | ThreadState::Blocked
                ) {
                    let p = mlfqs_priority(th.recent_cpu, th.nice);
                    th.base_priority = p;
                    th.effective_priority = p;
                }
            }
        }
    }

    /// Removes and returns the next thread to run, advancing virtual time
    /// past idle stretches if the ready queue is empty.
    fn pick_next(&self, st: &mut KernelState) -> Tid {
        loop {
            if let Some(i) = Kernel::best_ready(st) {
                return st.ready.remove(i).unwrap();
            }
            let min = match st.min_wakeup {
                Some(min) => min,
                None => panic!(
                    "scheduler has nothing to run: {} thread(s) blocked with no pending wakeup",
                    st.live
                ),
            };
            if self.mlfqs {
                // Walk tick boundaries one at a time so the load average and
                // recent-CPU decay see the idle stretch.
                st.ticks += 1;
                self.mlfqs_on_tick(st, None);
            } else {
                st.ticks = st.ticks.max(min);
            }
            self.wake_sleepers(st);
        }
    }

    /// Hands the core to the best runnable thread and parks the caller until
    /// it is selected again. The caller must already have placed the current
    /// thread where it belongs (ready queue, sleep set, or a wait set).
    pub(crate) fn schedule(&self, mut st: MutexGuard<'_, KernelState>) {
        let prev = st.current;
        let next = self.pick_next(&mut st);
        st.threads[next].state = ThreadState::Running;
        st.slice_left = TIME_SLICE;
        if next == prev {
            return;
        }
        st.current = next;
        let next_gate = st.threads[next].gate.clone();
        let prev_gate = st.threads[prev].gate.clone();
        drop(st);
        next_gate.open();
        prev_gate.wait();
    }

    /// Like [`schedule`](Kernel::schedule) for a thread that is exiting: the
    /// caller's host thread returns instead of parking.
    pub(crate) fn schedule_exit(&self, mut st: MutexGuard<'_, KernelState>) {
        let next = self.pick_next(&mut st);
        st.threads[next].state = ThreadState::Running;
        st.slice_left = TIME_SLICE;
        st.current = next;
        let next_gate = st.threads[next].gate.clone();
        drop(st);
        next_gate.open();
    }

    /// Requeues the caller and reschedules if some ready thread outranks it.
    pub(crate) fn yield_if_outranked(&self, st: MutexGuard<'_, KernelState>) {
        let cur = st.current;
        if Kernel::ready_outranks(&st, st.threads[cur].effective_priority) {
            let mut st = st;
            st.threads[cur].state = ThreadState::Ready;
            st.ready.push_back(cur);
            self.schedule(st);
        }
    }

    /// Advances virtual time by one tick on behalf of the running thread.
    ///
    /// This is the simulation's timer interrupt: it charges the tick to the
    /// caller, wakes expired sleepers, runs the feedback-queue accounting,
    /// and preempts the caller if its slice expired or a higher-priority
    /// thread became runnable.
    pub fn tick(&self) {
        let mut st = self.lock_state();
        self.assert_current(&st);
        st.ticks += 1;
        let cur = st.current;
        if self.mlfqs {
            self.mlfqs_on_tick(&mut st, Some(cur));
        }
        self.wake_sleepers(&mut st);
        st.slice_left -= 1;
        let outranked = Kernel::ready_outranks(&st, st.threads[cur].effective_priority);
        if !st.ready.is_empty() && (outranked || st.slice_left <= 0) {
            st.threads[cur].state = ThreadState::Ready;
            st.ready.push_back(cur);
            self.schedule(st);
        }
    }

    /// Yields the core, rotating behind equal-priority threads.
    pub fn yield_now(&self) {
        let mut st = self.lock_state();
        self.assert_current(&st);
        let cur = st.current;
        st.threads[cur].state = ThreadState::Ready;
        st.ready.push_back(cur);
        self.schedule(st);
    }

    /// Blocks the caller for at least `ticks` timer ticks of virtual time.
    ///
    /// A non-positive duration degenerates to a plain yield.
    pub fn sleep(&self, ticks: i64) {
        if ticks <= 0 {
            self.yield_now();
            return;
        }
        let mut st = self.lock_state();
        self.assert_current(&st);
        let cur = st.current;
        let wakeup = st.ticks + ticks;
        st.threads[cur].state = ThreadState::Blocked;
        st.sleepers.push((wakeup, cur));
        st.min_wakeup = Some(st.min_wakeup.map_or(wakeup, |m| m.min(wakeup)));
        self.schedule(st);
    }

    /// Sets the caller's base priority.
    ///
    /// Donations received remain in force, so the effective priority can
    /// stay above the new base. Lowering below a ready thread yields
    /// immediately. Ignored under the feedback-queue policy, where priority
    /// is formula-driven.
    pub fn set_priority(&self, priority: i32) {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        if self.mlfqs {
            return;
        }
        let mut st = self.lock_state();
        self.assert_current(&st);
        let cur = st.current;
        st.threads[cur].base_priority = priority;
        st.threads[cur].effective_priority = Kernel::recompute_effective(&st, cur);
        self.yield_if_outranked(st);
    }

    /// Effective priority of `tid` from its base and live donors.
    pub(crate) fn recompute_effective(st: &KernelState, tid: Tid) -> i32 {
        let th = &st.threads[tid];
        th.donors
            .iter()
            .map(|&d| st.threads[d].effective_priority)
            .fold(th.base_priority, i32::max)
    }

    /// Sets the caller's nice value, clamped to `[NICE_MIN, NICE_MAX]`, and
    /// recomputes its priority under the feedback-queue policy.
    pub fn set_nice(&self, nice: i32) {
        let nice = nice.clamp(NICE_MIN, NICE_MAX);
        let mut st = self.lock_state();
        self.assert_current(&st);
        let cur = st.current;
        st.threads[cur].nice = nice;
        if self.mlfqs {
            let p = mlfqs_priority(st.threads[cur].recent_cpu, nice);
            st.threads[cur].base_priority = p;
            st.threads[cur].effective_priority = p;
        }
        self.yield_if_outranked(st);
    }

    /// Returns the caller's nice value.
    pub fn nice(&self) -> i32 {
        let st = self.lock_state();
        self.assert_current(&st);
        st.threads[st.current].nice
    }

    /// Returns 100 times the caller's recent-CPU estimate, rounded to the
    /// nearest integer.
    pub fn recent_cpu100(&self) -> i32 {
        let st = self.lock_state();
        self.assert_current(&st);
        st.threads[st.current].recent_cpu.mul_int(100).to_int_nearest()
    }

    /// Returns 100 times the system load average, rounded to the nearest
    /// integer.
    pub fn load_avg100(&self) -> i32 {
        self.lock_state().load_avg.mul_int(100).to_int_nearest()
    }

    /// Earliest pending wakeup tick, if any thread is asleep.
    pub fn min_wakeup(&self) -> Option<i64> {
        self.lock_state().min_wakeup
    }

    /// Runs the machine until every thread but the caller has exited.
    ///
    /// The caller drops to the lowest priority so everything else drains
    /// first, then drives time forward tick by tick. Panics if the remaining
    /// threads can never run again.
    pub(crate) fn drain(&self) {
        {
            let mut st = self.lock_state();
            self.assert_current(&st);
            let cur = st.current;
            st.threads[cur].base_priority = PRI_MIN;
            st.threads[cur].effective_priority = Kernel::recompute_effective(&st, cur);
        }
        loop {
            {
                let st = self.lock_state();
                if st.live <= 1 {
                    break;
                }
                if st.ready.is_empty() && st.sleepers.is_empty() {
                    panic!(
                        "{} thread(s) still live but permanently blocked",
                        st.live - 1
                    );
                }
            }
            self.tick();
        }
    }
}
