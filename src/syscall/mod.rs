//! System call dispatch and argument marshalling.
//!
//! A trap delivers a [`TrapFrame`] whose stack pointer names the syscall
//! frame in user memory: the call number at `esp`, arguments at `esp + 4`,
//! `esp + 8`, and so on. Every word and buffer is pulled through the
//! validated accessors in [`uaccess`], so nothing is trusted until it is in
//! kernel memory.
//!
//! Failures split two ways. A marshalling failure (bad stack pointer,
//! pointer argument into kernel space or unmapped memory, unknown call
//! number) terminates the process with status -1, exactly as if it had
//! faulted. A merely wrong argument value, an invalid descriptor say, is an
//! ordinary error: the call returns -1 and the process keeps running.

pub mod uaccess;

use crate::mm::PGSIZE;
use crate::process::{execute, fault_exit};
use crate::{Kernel, KernelError};
use num_enum::TryFromPrimitive;
use std::sync::Arc;
use uaccess::{check_span, UserBuf, UserCStr, UserWord};

/// Register state delivered by a trap.
pub struct TrapFrame {
    /// User stack pointer; base of the syscall frame.
    pub esp: u32,
    /// Return value register.
    pub eax: u32,
}

/// System call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SyscallNumber {
    Halt = 0,
    Exit = 1,
    Exec = 2,
    Wait = 3,
    Create = 4,
    Remove = 5,
    Open = 6,
    Filesize = 7,
    Read = 8,
    Write = 9,
    Seek = 10,
    Tell = 11,
    Close = 12,
}

/// Handles the syscall named by `frame`, leaving the result in `eax`.
pub(crate) fn handle(kernel: &Arc<Kernel>, frame: &mut TrapFrame) {
    match dispatch(kernel, frame) {
        Ok(value) => frame.eax = value as u32,
        Err(e) => {
            log::debug!("syscall marshalling fault at esp {:#x}: {e:?}", frame.esp);
            fault_exit(-1);
        }
    }
}

fn dispatch(kernel: &Arc<Kernel>, frame: &TrapFrame) -> Result<i32, KernelError> {
    let arg = |i: u32| -> Result<u32, KernelError> {
        let addr = frame
            .esp
            .checked_add(4 * i)
            .ok_or(KernelError::BadAddress)?;
        kernel.with_user(|us| UserWord(addr).read(us))?
    };
    let cstr = |i: u32| -> Result<String, KernelError> {
        let addr = arg(i)?;
        kernel.with_user(|us| UserCStr(addr).read(us))?
    };

    let number = arg(0)?;
    let sys = SyscallNumber::try_from_primitive(number)
        .map_err(|_| KernelError::NoSuchSyscall)?;
    log::trace!("syscall {sys:?}");
    match sys {
        SyscallNumber::Halt => kernel.shutdown(),
        SyscallNumber::Exit => fault_exit(arg(1)? as i32),
        SyscallNumber::Exec => {
            let cmdline = cstr(1)?;
            Ok(execute(kernel, &cmdline))
        }
        SyscallNumber::Wait => Ok(kernel.wait(arg(1)? as usize)),
        SyscallNumber::Create => {
            let name = cstr(1)?;
            let size = arg(2)?;
            Ok(kernel.create_file(&name, size) as i32)
        }
        SyscallNumber::Remove => {
            let name = cstr(1)?;
            Ok(kernel.remove_file(&name) as i32)
        }
        SyscallNumber::Open => {
            let name = cstr(1)?;
            Ok(kernel.open_file(&name))
        }
        SyscallNumber::Filesize => Ok(kernel.file_size(arg(1)? as usize)),
        SyscallNumber::Read => sys_read(kernel, arg(1)?, arg(2)?, arg(3)?),
        SyscallNumber::Write => sys_write(kernel, arg(1)?, arg(2)?, arg(3)?),
        SyscallNumber::Seek => {
            kernel.seek_file(arg(1)? as usize, arg(2)?);
            Ok(0)
        }
        SyscallNumber::Tell => Ok(kernel.tell_file(arg(1)? as usize)),
        SyscallNumber::Close => {
            kernel.close_file(arg(1)? as usize);
            Ok(0)
        }
    }
}

/// Kernel-side staging buffer size for read/write transfers. Data loops
/// through a buffer this big, so no kernel allocation scales with a
/// user-supplied length.
const XFER_CHUNK: usize = PGSIZE;

fn sys_read(kernel: &Arc<Kernel>, fd: u32, addr: u32, len: u32) -> Result<i32, KernelError> {
    // The destination span is judged as a whole, mapping and protection
    // included, before any input is consumed.
    check_span(addr, len)?;
    if !kernel.with_user(|us| us.span_ok(addr, len, true))? {
        return Err(KernelError::BadAddress);
    }
    let mut buf = [0u8; XFER_CHUNK];
    match fd {
        1 => Ok(-1),
        0 => {
            let mut console = kernel.console.lock().unwrap_or_else(|e| e.into_inner());
            let mut total = 0u32;
            while total < len {
                let want = ((len - total) as usize).min(XFER_CHUNK);
                let n = console.read(&mut buf[..want]);
                kernel.with_user(|us| {
                    UserBuf { addr: addr + total, len: want as u32 }.write(us, &buf[..n])
                })??;
                total += n as u32;
                if n < want {
                    break;
                }
            }
            Ok(total as i32)
        }
        fd => {
            let mut total = 0u32;
            loop {
                let want = ((len - total) as usize).min(XFER_CHUNK);
                let n = kernel.read_file(fd as usize, &mut buf[..want]);
                if n < 0 {
                    return Ok(-1);
                }
                kernel.with_user(|us| {
                    UserBuf { addr: addr + total, len: want as u32 }.write(us, &buf[..n as usize])
                })??;
                total += n as u32;
                if (n as usize) < want || total >= len {
                    break;
                }
            }
            Ok(total as i32)
        }
    }
}

fn sys_write(kernel: &Arc<Kernel>, fd: u32, addr: u32, len: u32) -> Result<i32, KernelError> {
    check_span(addr, len)?;
    if !kernel.with_user(|us| us.span_ok(addr, len, false))? {
        return Err(KernelError::BadAddress);
    }
    match fd {
        0 => Ok(-1),
        1 => {
            // The console stays locked across the whole transfer, so output
            // from racing processes never interleaves mid-buffer.
            let mut console = kernel.console.lock().unwrap_or_else(|e| e.into_inner());
            let mut total = 0u32;
            while total < len {
                let chunk = (len - total).min(XFER_CHUNK as u32);
                let data =
                    kernel.with_user(|us| UserBuf { addr: addr + total, len: chunk }.read(us))??;
                let n = console.write(&data) as u32;
                total += n;
                if n < chunk {
                    break;
                }
            }
            Ok(total as i32)
        }
        fd => {
            let mut total = 0u32;
            loop {
                let chunk = (len - total).min(XFER_CHUNK as u32);
                let data =
                    kernel.with_user(|us| UserBuf { addr: addr + total, len: chunk }.read(us))??;
                let n = kernel.write_file(fd as usize, &data);
                if n < 0 {
                    return Ok(-1);
                }
                total += n as u32;
                if (n as u32) < chunk || total >= len {
                    break;
                }
            }
            Ok(total as i32)
        }
    }
}
