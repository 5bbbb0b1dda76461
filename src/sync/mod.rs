//! Synchronization primitives.
//!
//! Three primitives build on each other the classic way: counting
//! [`Semaphore`]s at the bottom, binary [`Lock`]s with priority donation on
//! top of them, and monitor-style [`Condvar`]s on top of locks.
//!
//! All wait sets wake the highest-effective-priority waiter first, FIFO among
//! ties. Lock acquisition donates the waiter's effective priority to the
//! holder and propagates the boost along chains of held locks, so a
//! high-priority thread is never stalled behind a runnable medium-priority
//! one just because a low-priority thread holds what it needs. Donation is
//! disabled under the feedback-queue scheduler, where priorities are
//! formula-driven.
//!
//! The primitives are owned handles over kernel-internal state keyed by
//! integer id, so they can be cloned and moved freely between threads.

mod condvar;
mod lock;
mod semaphore;

pub use condvar::Condvar;
pub use lock::{Lock, LockGuard};
pub use semaphore::Semaphore;
