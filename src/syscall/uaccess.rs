//! Typed, validated accessors for user-supplied pointers.
//!
//! Every value crossing the user/kernel boundary comes in as an untrusted
//! address and is pulled through one of these accessors. Validation is
//! two-stage: the whole span is checked against the user/kernel split before
//! a single byte is touched, then each byte is probed so an unmapped page
//! anywhere in the span fails the access as a unit.

use crate::mm::{UserSpace, PGSIZE, PHYS_BASE};
use crate::KernelError;

/// Checks that `[addr, addr + len)` lies entirely in user space.
pub(crate) fn check_span(addr: u32, len: u32) -> Result<(), KernelError> {
    match addr.checked_add(len) {
        Some(end) if end <= PHYS_BASE => Ok(()),
        _ => Err(KernelError::BadAddress),
    }
}

/// A 32-bit little-endian word at a user address.
#[derive(Clone, Copy)]
pub struct UserWord(pub u32);

impl UserWord {
    /// Reads the word, failing if any of its four bytes is outside user
    /// space or unmapped.
    pub fn read(self, us: &UserSpace) -> Result<u32, KernelError> {
        check_span(self.0, 4)?;
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = us
                .probe_read(self.0 + i as u32)
                .ok_or(KernelError::BadAddress)?;
        }
        Ok(u32::from_le_bytes(bytes))
    }
}

/// A byte buffer at a user address.
#[derive(Clone, Copy)]
pub struct UserBuf {
    pub addr: u32,
    pub len: u32,
}

impl UserBuf {
    /// Copies the buffer into the kernel. The allocation grows with bytes
    /// actually probed, never with `len` alone.
    pub fn read(self, us: &UserSpace) -> Result<Vec<u8>, KernelError> {
        check_span(self.addr, self.len)?;
        let mut out = Vec::with_capacity(self.len.min(PGSIZE as u32) as usize);
        for i in 0..self.len {
            out.push(us.probe_read(self.addr + i).ok_or(KernelError::BadAddress)?);
        }
        Ok(out)
    }

    /// Copies `data` out to the buffer, which must be writable for its whole
    /// length.
    pub fn write(self, us: &mut UserSpace, data: &[u8]) -> Result<(), KernelError> {
        debug_assert!(data.len() <= self.len as usize);
        check_span(self.addr, data.len() as u32)?;
        for (i, &b) in data.iter().enumerate() {
            if !us.probe_write(self.addr + i as u32, b) {
                return Err(KernelError::BadAddress);
            }
        }
        Ok(())
    }
}

/// A NUL-terminated string at a user address.
#[derive(Clone, Copy)]
pub struct UserCStr(pub u32);

impl UserCStr {
    /// Copies the string into the kernel, stopping at the terminator.
    ///
    /// Fails with [`KernelError::BadAddress`] if the string runs off the end
    /// of mapped user memory before terminating, and with
    /// [`KernelError::InvalidArgument`] if it is not valid UTF-8.
    pub fn read(self, us: &UserSpace) -> Result<String, KernelError> {
        let mut bytes = Vec::new();
        let mut addr = self.0;
        loop {
            check_span(addr, 1)?;
            let b = us.probe_read(addr).ok_or(KernelError::BadAddress)?;
            if b == 0 {
                break;
            }
            bytes.push(b);
            addr = addr.checked_add(1).ok_or(KernelError::BadAddress)?;
        }
        String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{PageFlags, UserSpace};

    fn space() -> UserSpace {
        let mut us = UserSpace::new();
        us.map_page(0x1000, PageFlags::WRITABLE).unwrap();
        us.map_page(PHYS_BASE - 0x1000, PageFlags::WRITABLE).unwrap();
        us
    }

    #[test]
    fn word_rejects_kernel_straddle() {
        let us = space();
        // Word whose tail crosses into kernel space fails whole, even though
        // its first bytes are mapped and readable.
        assert!(UserWord(PHYS_BASE - 2).read(&us).is_err());
        assert!(UserWord(PHYS_BASE - 4).read(&us).is_ok());
    }

    #[test]
    fn word_little_endian() {
        let mut us = space();
        for (i, b) in [0x78, 0x56, 0x34, 0x12u8].into_iter().enumerate() {
            us.poke(0x1000 + i as u32, b);
        }
        assert_eq!(UserWord(0x1000).read(&us).unwrap(), 0x1234_5678);
    }

    #[test]
    fn buf_fails_on_unmapped_hole() {
        let us = space();
        // Page at 0x2000 is unmapped; the copy fails as a unit.
        assert!(UserBuf { addr: 0x1ff0, len: 32 }.read(&us).is_err());
        assert!(UserBuf { addr: 0x1ff0, len: 16 }.read(&us).is_ok());
    }

    #[test]
    fn cstr_reads_to_terminator() {
        let mut us = space();
        for (i, b) in b"hi there\0".iter().enumerate() {
            us.poke(0x1000 + i as u32, *b);
        }
        assert_eq!(UserCStr(0x1000).read(&us).unwrap(), "hi there");
    }

    #[test]
    fn cstr_unterminated_fails() {
        let mut us = space();
        // Fill the last user page with non-NUL bytes; the scan must stop at
        // the split instead of wandering into kernel addresses.
        for i in 0..0x1000u32 {
            us.poke(PHYS_BASE - 0x1000 + i, b'a');
        }
        assert!(UserCStr(PHYS_BASE - 8).read(&us).is_err());
    }
}
