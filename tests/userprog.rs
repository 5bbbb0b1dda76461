//! The user-facing boundary: syscalls, descriptors, and process lifecycle.
//!
//! Programs here are closures registered by name. Each builds its syscall
//! frames inside its own simulated address space, so these tests cross the
//! same validation paths a real user program would.

use std::sync::{Arc, Mutex};
use teos::syscall::SyscallNumber as Sys;
use teos::{
    KernelBuilder, PageFlags, ScriptedConsole, ThreadState, UserProc, MAX_FILE, PGSIZE, PHYS_BASE,
};

const STACK: u32 = PHYS_BASE - PGSIZE as u32;

fn poke_str(up: &UserProc, addr: u32, s: &str) {
    for (i, b) in s.bytes().enumerate() {
        assert!(up.poke(addr + i as u32, b));
    }
    assert!(up.poke(addr + s.len() as u32, 0));
}

fn output_of(out: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(out.lock().unwrap().clone()).unwrap()
}

#[test]
fn exit_status_reaches_parent_and_prints() {
    let console = ScriptedConsole::new(&b""[..]);
    let out = console.output();
    let kernel = KernelBuilder::new()
        .console(console)
        .program("child", |up: &UserProc| {
            up.syscall(&[Sys::Exit as u32, 7]);
            unreachable!()
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("child");
        assert!(pid > 0);
        assert_eq!(kernel.wait(pid as usize), 7);
    });
    assert!(output_of(&out).contains("child: exit(7)\n"));
}

#[test]
fn wait_reaps_exactly_once() {
    let kernel = KernelBuilder::new()
        .program("quickly", |_: &UserProc| 3)
        .build();
    kernel.run(|| {
        let pid = kernel.exec("quickly") as usize;
        assert_eq!(kernel.wait(pid), 3);
        assert_eq!(kernel.wait(pid), -1);
        assert_eq!(kernel.wait(9999), -1);
    });
}

#[test]
fn reaped_children_leave_inert_records() {
    let kernel = KernelBuilder::new()
        .program("spawner", |up: &UserProc| {
            poke_str(up, STACK, "orphan");
            assert!(up.syscall(&[Sys::Exec as u32, STACK]) > 0);
            2
        })
        .program("orphan", |up: &UserProc| {
            up.kernel().sleep(20);
            0
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("spawner") as usize;
        // Reaping frees the record's bookkeeping, its abandoned child
        // included; the tombstone still answers a second wait with -1.
        assert_eq!(kernel.wait(pid), 2);
        assert_eq!(kernel.state_of(pid), ThreadState::Dying);
        assert_eq!(kernel.wait(pid), -1);
    });
}

#[test]
fn wait_rejects_non_children() {
    let kernel = KernelBuilder::new()
        .program("probe", |up: &UserProc| {
            // A sibling's pid is not ours to wait on.
            let other = up.args().split_whitespace().nth(1).unwrap().parse().unwrap();
            up.syscall(&[Sys::Wait as u32, other])
        })
        .program("lingerer", |up: &UserProc| {
            up.kernel().sleep(50);
            0
        })
        .build();
    kernel.run(|| {
        let lingerer = kernel.exec("lingerer");
        let probe = kernel.exec(&format!("probe {lingerer}"));
        assert_eq!(kernel.wait(probe as usize), -1);
        assert_eq!(kernel.wait(lingerer as usize), 0);
    });
}

#[test]
fn exec_unknown_program_fails() {
    let kernel = KernelBuilder::new().build();
    kernel.run(|| {
        assert_eq!(kernel.exec("no-such-program"), -1);
        assert_eq!(kernel.exec(""), -1);
    });
}

#[test]
fn command_line_reaches_the_program() {
    let kernel = KernelBuilder::new()
        .program("echoargs", |up: &UserProc| {
            assert_eq!(up.args(), "echoargs alpha beta");
            0
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("echoargs alpha beta");
        assert_eq!(kernel.wait(pid as usize), 0);
    });
}

#[test]
fn file_syscalls_round_trip() {
    let kernel = KernelBuilder::new()
        .program("fileio", |up: &UserProc| {
            up.map_page(0x1000, PageFlags::WRITABLE).unwrap();
            poke_str(up, STACK, "data.txt");
            let payload = b"hello, file";
            for (i, &b) in payload.iter().enumerate() {
                assert!(up.poke(STACK + 0x100 + i as u32, b));
            }

            assert_eq!(up.syscall(&[Sys::Create as u32, STACK, 0]), 1);
            // Creating the same name again fails as an ordinary error.
            assert_eq!(up.syscall(&[Sys::Create as u32, STACK, 0]), 0);
            let fd = up.syscall(&[Sys::Open as u32, STACK]);
            assert_eq!(fd, 2);
            let fd = fd as u32;

            assert_eq!(up.syscall(&[Sys::Write as u32, fd, STACK + 0x100, 11]), 11);
            assert_eq!(up.syscall(&[Sys::Filesize as u32, fd]), 11);
            assert_eq!(up.syscall(&[Sys::Tell as u32, fd]), 11);
            up.syscall(&[Sys::Seek as u32, fd, 0]);
            assert_eq!(up.syscall(&[Sys::Tell as u32, fd]), 0);

            assert_eq!(up.syscall(&[Sys::Read as u32, fd, 0x1000, 64]), 11);
            for (i, &b) in payload.iter().enumerate() {
                assert_eq!(up.peek(0x1000 + i as u32), Some(b));
            }

            up.syscall(&[Sys::Close as u32, fd]);
            // Operations on a closed descriptor are ordinary errors, not
            // faults.
            assert_eq!(up.syscall(&[Sys::Read as u32, fd, 0x1000, 4]), -1);
            assert_eq!(up.syscall(&[Sys::Remove as u32, STACK]), 1);
            assert_eq!(up.syscall(&[Sys::Open as u32, STACK]), -1);
            0
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("fileio");
        assert_eq!(kernel.wait(pid as usize), 0);
    });
}

#[test]
fn descriptor_table_fills_and_recycles() {
    let kernel = KernelBuilder::new()
        .program("many", |up: &UserProc| {
            poke_str(up, STACK, "f");
            assert_eq!(up.syscall(&[Sys::Create as u32, STACK, 0]), 1);
            let mut opened = 0;
            loop {
                let fd = up.syscall(&[Sys::Open as u32, STACK]);
                if fd == -1 {
                    break;
                }
                opened += 1;
            }
            assert_eq!(opened, MAX_FILE as i32 - 2);
            // Closing frees the slot for the next open.
            up.syscall(&[Sys::Close as u32, 5]);
            assert_eq!(up.syscall(&[Sys::Open as u32, STACK]), 5);
            0
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("many");
        assert_eq!(kernel.wait(pid as usize), 0);
    });
}

#[test]
fn console_write_and_line_buffered_read() {
    let console = ScriptedConsole::new(&b"abc\ndef"[..]);
    let out = console.output();
    let kernel = KernelBuilder::new()
        .console(console)
        .program("chatty", |up: &UserProc| {
            poke_str(up, STACK, "hi\n");
            assert_eq!(up.syscall(&[Sys::Write as u32, 1, STACK, 3]), 3);
            // Reads stop short of a newline and never consume it.
            let n1 = up.syscall(&[Sys::Read as u32, 0, STACK + 0x100, 16]);
            assert_eq!(n1, 3);
            assert_eq!(up.peek(STACK + 0x100), Some(b'a'));
            assert_eq!(up.peek(STACK + 0x102), Some(b'c'));
            let n2 = up.syscall(&[Sys::Read as u32, 0, STACK + 0x100, 16]);
            assert_eq!(n2, 0);
            // The console is not writable through fd 0, nor readable
            // through fd 1.
            assert_eq!(up.syscall(&[Sys::Write as u32, 0, STACK, 1]), -1);
            assert_eq!(up.syscall(&[Sys::Read as u32, 1, STACK + 0x100, 1]), -1);
            0
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("chatty");
        assert_eq!(kernel.wait(pid as usize), 0);
    });
    let out = output_of(&out);
    let hi = out.find("hi\n").unwrap();
    let exit = out.find("chatty: exit(0)\n").unwrap();
    assert!(hi < exit);
}

#[test]
fn stray_stack_pointer_kills_the_process() {
    let console = ScriptedConsole::new(&b""[..]);
    let out = console.output();
    let kernel = KernelBuilder::new()
        .console(console)
        .program("stray", |up: &UserProc| {
            // The syscall number word straddles the user/kernel split; the
            // whole frame is rejected even though its first bytes are
            // mapped.
            up.raw_syscall(PHYS_BASE - 2);
            unreachable!()
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("stray");
        assert_eq!(kernel.wait(pid as usize), -1);
    });
    assert!(output_of(&out).contains("stray: exit(-1)\n"));
}

#[test]
fn kernel_space_buffer_kills_the_process() {
    let kernel = KernelBuilder::new()
        .program("sneaky", |up: &UserProc| {
            up.syscall(&[Sys::Write as u32, 1, PHYS_BASE, 4]);
            unreachable!()
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("sneaky");
        assert_eq!(kernel.wait(pid as usize), -1);
    });
}

#[test]
fn unmapped_buffer_kills_the_process() {
    let kernel = KernelBuilder::new()
        .program("wild", |up: &UserProc| {
            up.syscall(&[Sys::Write as u32, 1, 0x4000, 4]);
            unreachable!()
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("wild");
        assert_eq!(kernel.wait(pid as usize), -1);
    });
}

#[test]
fn oversized_transfer_request_kills_only_the_process() {
    let console = ScriptedConsole::new(&b"plenty of input\n"[..]);
    let kernel = KernelBuilder::new()
        .console(console)
        .program("greedy-reader", |up: &UserProc| {
            // Below the split and span-valid, but nowhere near mapped; the
            // claim must die at validation, not in a kernel allocation.
            up.syscall(&[Sys::Read as u32, 0, 0, 0xB000_0000]);
            unreachable!()
        })
        .program("greedy-writer", |up: &UserProc| {
            up.syscall(&[Sys::Write as u32, 1, 0, 0xB000_0000]);
            unreachable!()
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("greedy-reader");
        assert_eq!(kernel.wait(pid as usize), -1);
        // The kernel survived; the next process runs normally.
        let pid = kernel.exec("greedy-writer");
        assert_eq!(kernel.wait(pid as usize), -1);
    });
}

#[test]
fn transfers_larger_than_a_page_arrive_intact() {
    let kernel = KernelBuilder::new()
        .program("bulky", |up: &UserProc| {
            for page in 0..3u32 {
                up.map_page(0x1000 + page * PGSIZE as u32, PageFlags::WRITABLE)
                    .unwrap();
                up.map_page(0x8000 + page * PGSIZE as u32, PageFlags::WRITABLE)
                    .unwrap();
            }
            let len = 2 * PGSIZE as u32 + 100;
            for i in 0..len {
                assert!(up.poke(0x1000 + i, (i % 251) as u8));
            }
            poke_str(up, STACK, "big.bin");
            assert_eq!(up.syscall(&[Sys::Create as u32, STACK, 0]), 1);
            let fd = up.syscall(&[Sys::Open as u32, STACK]) as u32;
            assert_eq!(up.syscall(&[Sys::Write as u32, fd, 0x1000, len]), len as i32);
            up.syscall(&[Sys::Seek as u32, fd, 0]);
            assert_eq!(up.syscall(&[Sys::Read as u32, fd, 0x8000, len]), len as i32);
            for i in 0..len {
                assert_eq!(up.peek(0x8000 + i), up.peek(0x1000 + i));
            }
            0
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("bulky");
        assert_eq!(kernel.wait(pid as usize), 0);
    });
}

#[test]
fn unknown_syscall_number_kills_the_process() {
    let kernel = KernelBuilder::new()
        .program("novel", |up: &UserProc| {
            up.syscall(&[999]);
            unreachable!()
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("novel");
        assert_eq!(kernel.wait(pid as usize), -1);
    });
}

#[test]
fn running_executable_denies_writes_until_exit() {
    let kernel = KernelBuilder::new()
        .program("prog", |up: &UserProc| {
            poke_str(up, STACK, "prog");
            let fd = up.syscall(&[Sys::Open as u32, STACK]) as u32;
            // Writing to our own running image is refused.
            up.syscall(&[Sys::Write as u32, fd, STACK, 4])
        })
        .program("writer", |up: &UserProc| {
            poke_str(up, STACK, "prog");
            let fd = up.syscall(&[Sys::Open as u32, STACK]) as u32;
            up.syscall(&[Sys::Write as u32, fd, STACK, 4])
        })
        .build();
    kernel.run(|| {
        assert!(kernel.create_file("prog", 0));
        let pid = kernel.exec("prog");
        assert_eq!(kernel.wait(pid as usize), 0);
        // The denial died with the process.
        let pid = kernel.exec("writer");
        assert_eq!(kernel.wait(pid as usize), 4);
    });
}

#[test]
fn processes_can_exec_and_wait_themselves() {
    let console = ScriptedConsole::new(&b""[..]);
    let out = console.output();
    let kernel = KernelBuilder::new()
        .console(console)
        .program("parent", |up: &UserProc| {
            poke_str(up, STACK, "leaf x");
            let pid = up.syscall(&[Sys::Exec as u32, STACK]);
            assert!(pid > 0);
            up.syscall(&[Sys::Wait as u32, pid as u32])
        })
        .program("leaf", |up: &UserProc| {
            assert_eq!(up.args(), "leaf x");
            5
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("parent");
        assert_eq!(kernel.wait(pid as usize), 5);
    });
    let out = output_of(&out);
    let leaf = out.find("leaf: exit(5)\n").unwrap();
    let parent = out.find("parent: exit(5)\n").unwrap();
    assert!(leaf < parent);
}

#[test]
fn halt_powers_off_without_an_exit_line() {
    let console = ScriptedConsole::new(&b""[..]);
    let out = console.output();
    let kernel = KernelBuilder::new()
        .console(console)
        .program("quit", |up: &UserProc| {
            up.syscall(&[Sys::Halt as u32]);
            unreachable!()
        })
        .build();
    kernel.run(|| {
        let pid = kernel.exec("quit");
        assert_eq!(kernel.wait(pid as usize), 0);
        assert!(kernel.halted());
    });
    assert!(!output_of(&out).contains("quit"));
}
