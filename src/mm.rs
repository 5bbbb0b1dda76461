//! Simulated user address spaces.
//!
//! Each process owns a [`UserSpace`]: a sparse set of 4 KiB pages below
//! [`PHYS_BASE`]. Addresses at or above `PHYS_BASE` belong to the kernel and
//! are never accessible to user code. The kernel itself touches user memory
//! only through the byte-granular probes here, which is what makes the
//! trust boundary checkable: a probe on an unmapped or protected address
//! reports failure instead of faulting.

use crate::KernelError;
use bitflags::bitflags;
use std::collections::BTreeMap;

/// First kernel address; user addresses are strictly below it.
pub const PHYS_BASE: u32 = 0xC000_0000;
/// Page size in bytes.
pub const PGSIZE: usize = 4096;

bitflags! {
    /// Protection bits of a mapped page.
    pub struct PageFlags: u32 {
        /// Page may be written by user code.
        const WRITABLE = 1;
    }
}

struct Page {
    data: Box<[u8; PGSIZE]>,
    flags: PageFlags,
}

/// A process's address space: pages keyed by their base virtual address.
pub struct UserSpace {
    pages: BTreeMap<u32, Page>,
}

impl UserSpace {
    pub(crate) fn new() -> UserSpace {
        UserSpace {
            pages: BTreeMap::new(),
        }
    }

    /// Maps a zeroed page at `vaddr`, which must be page-aligned and below
    /// [`PHYS_BASE`].
    pub fn map_page(&mut self, vaddr: u32, flags: PageFlags) -> Result<(), KernelError> {
        if vaddr as usize % PGSIZE != 0 || vaddr >= PHYS_BASE {
            return Err(KernelError::InvalidArgument);
        }
        if self.pages.contains_key(&vaddr) {
            return Err(KernelError::FileExist);
        }
        self.pages.insert(
            vaddr,
            Page {
                data: Box::new([0; PGSIZE]),
                flags,
            },
        );
        Ok(())
    }

    /// Reads one byte at `addr`, or `None` if the address is kernel space or
    /// unmapped.
    pub fn probe_read(&self, addr: u32) -> Option<u8> {
        if addr >= PHYS_BASE {
            return None;
        }
        let base = addr - addr % PGSIZE as u32;
        self.pages
            .get(&base)
            .map(|p| p.data[(addr - base) as usize])
    }

    /// Writes one byte at `addr`. Fails on kernel space, unmapped pages, and
    /// pages mapped read-only.
    pub fn probe_write(&mut self, addr: u32, byte: u8) -> bool {
        if addr >= PHYS_BASE {
            return false;
        }
        let base = addr - addr % PGSIZE as u32;
        match self.pages.get_mut(&base) {
            Some(p) if p.flags.contains(PageFlags::WRITABLE) => {
                p.data[(addr - base) as usize] = byte;
                true
            }
            _ => false,
        }
    }

    /// Writes a byte ignoring protection, for setting up a space before the
    /// process runs.
    pub fn poke(&mut self, addr: u32, byte: u8) -> bool {
        if addr >= PHYS_BASE {
            return false;
        }
        let base = addr - addr % PGSIZE as u32;
        match self.pages.get_mut(&base) {
            Some(p) => {
                p.data[(addr - base) as usize] = byte;
                true
            }
            None => false,
        }
    }

    /// Reads a byte regardless of protection.
    pub fn peek(&self, addr: u32) -> Option<u8> {
        self.probe_read(addr)
    }

    /// Checks that every page in `[addr, addr + len)` is mapped, and
    /// writable when `write` is set. Walks page table entries, not bytes,
    /// so the cost scales with the span's page count.
    pub fn span_ok(&self, addr: u32, len: u32, write: bool) -> bool {
        if len == 0 {
            return true;
        }
        let end = match addr.checked_add(len - 1) {
            Some(end) if end < PHYS_BASE => end,
            _ => return false,
        };
        let mut base = addr - addr % PGSIZE as u32;
        loop {
            match self.pages.get(&base) {
                Some(p) if !write || p.flags.contains(PageFlags::WRITABLE) => {}
                _ => return false,
            }
            if base + (PGSIZE as u32 - 1) >= end {
                return true;
            }
            base += PGSIZE as u32;
        }
    }
}
