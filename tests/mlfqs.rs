//! Multilevel-feedback-queue scheduler behavior.
//!
//! Values asserted here are exact: the arithmetic is 17.14 fixed point and
//! the simulation is deterministic, so the formulas produce the same bit
//! patterns every run.

use std::sync::{Arc, Mutex};
use teos::{KernelBuilder, ThreadBuilder, PRI_MAX};

#[test]
fn priority_follows_the_formula() {
    let kernel = KernelBuilder::new().mlfqs(true).build();
    kernel.run(|| {
        // Four ticks charge recent_cpu to 4, and the recompute at the
        // boundary gives PRI_MAX - 4/4 - 0.
        for _ in 0..4 {
            kernel.tick();
        }
        assert_eq!(kernel.recent_cpu100(), 400);
        assert_eq!(kernel.priority(), PRI_MAX - 1);
    });
}

#[test]
fn set_priority_is_inert() {
    let kernel = KernelBuilder::new().mlfqs(true).build();
    kernel.run(|| {
        for _ in 0..4 {
            kernel.tick();
        }
        let before = kernel.priority();
        kernel.set_priority(10);
        assert_eq!(kernel.priority(), before);
    });
}

#[test]
fn nice_lowers_priority_and_is_clamped() {
    let kernel = KernelBuilder::new().mlfqs(true).build();
    kernel.run(|| {
        kernel.set_nice(100);
        assert_eq!(kernel.nice(), 20);
        assert_eq!(kernel.priority(), PRI_MAX - 40);
        kernel.set_nice(-100);
        assert_eq!(kernel.nice(), -20);
        assert_eq!(kernel.priority(), PRI_MAX);
    });
}

#[test]
fn children_inherit_nice() {
    let kernel = KernelBuilder::new().mlfqs(true).build();
    kernel.run(|| {
        kernel.set_nice(5);
        let seen = Arc::new(Mutex::new(None));
        let k = kernel.clone();
        let s = seen.clone();
        ThreadBuilder::new("child")
            .spawn(&kernel, move || {
                *s.lock().unwrap() = Some(k.nice());
            })
            .join();
        assert_eq!(*seen.lock().unwrap(), Some(5));
    });
}

#[test]
fn load_average_ramps_with_a_busy_cpu() {
    let kernel = KernelBuilder::new().mlfqs(true).build();
    kernel.run(|| {
        assert_eq!(kernel.load_avg100(), 0);
        for _ in 0..100 {
            kernel.tick();
        }
        // One busy thread for one second: load_avg = 1/60.
        assert_eq!(kernel.load_avg100(), 2);
        for _ in 0..100 {
            kernel.tick();
        }
        // (59/60) * (1/60) + 1/60.
        assert_eq!(kernel.load_avg100(), 3);
    });
}

#[test]
fn load_average_decays_while_idle() {
    let kernel = KernelBuilder::new().mlfqs(true).build();
    kernel.run(|| {
        for _ in 0..100 {
            kernel.tick();
        }
        let busy = kernel.load_avg100();
        assert!(busy > 0);
        // Sleeping threads do not count toward load, and idle time still
        // crosses the once-per-second boundaries.
        kernel.sleep(3000);
        assert!(kernel.load_avg100() < busy);
    });
}

#[test]
fn recent_cpu_decays_once_a_second() {
    let kernel = KernelBuilder::new().mlfqs(true).build();
    kernel.run(|| {
        for _ in 0..99 {
            kernel.tick();
        }
        assert_eq!(kernel.recent_cpu100(), 9900);
        // The 100th tick applies the decay to the freshly charged value.
        kernel.tick();
        assert!(kernel.recent_cpu100() < 9900);
    });
}

#[test]
fn lower_nice_finishes_its_cpu_burst_first() {
    let kernel = KernelBuilder::new().mlfqs(true).build();
    kernel.run(|| {
        let finish_order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (name, nice) in [("greedy", -5), ("meek", 5)] {
            let k = kernel.clone();
            let order = finish_order.clone();
            handles.push(ThreadBuilder::new(name).spawn(&kernel, move || {
                k.set_nice(nice);
                for _ in 0..100 {
                    k.tick();
                }
                order.lock().unwrap().push(name);
            }));
        }
        for h in handles {
            h.join();
        }
        assert_eq!(*finish_order.lock().unwrap(), ["greedy", "meek"]);
    });
}
