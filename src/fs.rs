//! Files, the per-process descriptor table, and the filesystem lock.
//!
//! The filesystem itself is pluggable through the [`Storage`] trait; the
//! in-memory [`MemStorage`] stands in for a disk. None of it is reentrant,
//! so every operation that touches storage or an open file runs under the
//! single global filesystem lock, taken through [`Kernel::fs_guard`]. The
//! lock is a regular donation-aware kernel lock, never held across anything
//! that blocks on other threads.
//!
//! Descriptors are per-process indexes into a fixed-size table. Slots 0 and
//! 1 are the console and are never handed out.

use crate::{Kernel, KernelError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Open descriptors a process may hold, console slots included.
pub const MAX_FILE: usize = 64;

/// An open file.
///
/// Dropping the handle closes it, lifting any write denial it placed.
pub trait FileHandle: Send {
    /// Reads from the current position, returning bytes read.
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Writes at the current position, growing the file as needed. Returns
    /// bytes written; zero if writes to the file are denied.
    fn write(&mut self, data: &[u8]) -> usize;
    /// Moves the position, which may point past the end.
    fn seek(&mut self, pos: u32);
    /// Current position.
    fn tell(&self) -> u32;
    /// File length in bytes.
    fn len(&self) -> u32;
    /// Blocks writes through any handle until this handle is closed.
    fn deny_write(&mut self);
}

/// A filesystem the kernel can mount.
pub trait Storage: Send {
    /// Creates a file of `size` zero bytes.
    fn create(&mut self, name: &str, size: u32) -> Result<(), KernelError>;
    /// Opens an existing file.
    fn open(&mut self, name: &str) -> Result<Box<dyn FileHandle>, KernelError>;
    /// Removes a file. Open handles keep working until closed.
    fn remove(&mut self, name: &str) -> Result<(), KernelError>;
}

struct FileData {
    data: Vec<u8>,
    deny_write: usize,
}

/// An in-memory filesystem.
pub struct MemStorage {
    files: BTreeMap<String, Arc<Mutex<FileData>>>,
}

impl MemStorage {
    pub fn new() -> MemStorage {
        MemStorage {
            files: BTreeMap::new(),
        }
    }
}

impl Default for MemStorage {
    fn default() -> MemStorage {
        MemStorage::new()
    }
}

impl Storage for MemStorage {
    fn create(&mut self, name: &str, size: u32) -> Result<(), KernelError> {
        if name.is_empty() {
            return Err(KernelError::NoSuchEntry);
        }
        if self.files.contains_key(name) {
            return Err(KernelError::FileExist);
        }
        self.files.insert(
            name.to_string(),
            Arc::new(Mutex::new(FileData {
                data: vec![0; size as usize],
                deny_write: 0,
            })),
        );
        Ok(())
    }

    fn open(&mut self, name: &str) -> Result<Box<dyn FileHandle>, KernelError> {
        let inner = self.files.get(name).ok_or(KernelError::NoSuchEntry)?;
        Ok(Box::new(MemFile {
            inner: Arc::clone(inner),
            pos: 0,
            denied: false,
        }))
    }

    fn remove(&mut self, name: &str) -> Result<(), KernelError> {
        // The Arc keeps removed-but-open files alive until the last handle
        // closes.
        self.files
            .remove(name)
            .map(|_| ())
            .ok_or(KernelError::NoSuchEntry)
    }
}

struct MemFile {
    inner: Arc<Mutex<FileData>>,
    pos: u32,
    denied: bool,
}

impl MemFile {
    fn lock(&self) -> std::sync::MutexGuard<'_, FileData> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FileHandle for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let fd = self.lock();
        let pos = self.pos as usize;
        if pos >= fd.data.len() {
            return 0;
        }
        let n = buf.len().min(fd.data.len() - pos);
        buf[..n].copy_from_slice(&fd.data[pos..pos + n]);
        drop(fd);
        self.pos += n as u32;
        n
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut fd = self.lock();
        if fd.deny_write > 0 {
            return 0;
        }
        let pos = self.pos as usize;
        let end = pos + data.len();
        if end > fd.data.len() {
            // A position parked past the end leaves a zero-filled gap.
            fd.data.resize(end, 0);
        }
        fd.data[pos..end].copy_from_slice(data);
        drop(fd);
        self.pos = end as u32;
        data.len()
    }

    fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    fn tell(&self) -> u32 {
        self.pos
    }

    fn len(&self) -> u32 {
        self.lock().data.len() as u32
    }

    fn deny_write(&mut self) {
        if !self.denied {
            self.denied = true;
            self.lock().deny_write += 1;
        }
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        if self.denied {
            self.lock().deny_write -= 1;
        }
    }
}

/// A process's descriptor table.
pub(crate) struct FileTable {
    slots: Vec<Option<Box<dyn FileHandle>>>,
}

impl FileTable {
    pub(crate) fn new() -> FileTable {
        let mut slots = Vec::with_capacity(MAX_FILE);
        slots.resize_with(MAX_FILE, || None);
        FileTable { slots }
    }

    /// Installs a handle in the lowest free slot, or gives the handle back
    /// if the table is full.
    fn alloc(&mut self, handle: Box<dyn FileHandle>) -> Result<usize, Box<dyn FileHandle>> {
        for (fd, slot) in self.slots.iter_mut().enumerate().skip(2) {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(fd);
            }
        }
        Err(handle)
    }

    fn get_mut(&mut self, fd: usize) -> Option<&mut Box<dyn FileHandle>> {
        if fd < 2 {
            return None;
        }
        self.slots.get_mut(fd).and_then(|s| s.as_mut())
    }

    fn take(&mut self, fd: usize) -> Option<Box<dyn FileHandle>> {
        if fd < 2 {
            return None;
        }
        self.slots.get_mut(fd).and_then(|s| s.take())
    }
}

/// Holds the global filesystem lock for a scope.
pub(crate) struct FsGuard<'a> {
    kernel: &'a Kernel,
}

impl Drop for FsGuard<'_> {
    fn drop(&mut self) {
        self.kernel.lock_release_id(self.kernel.fs_lock);
    }
}

impl Kernel {
    /// Takes the global filesystem lock.
    pub(crate) fn fs_guard(&self) -> FsGuard<'_> {
        self.lock_acquire_id(self.fs_lock);
        FsGuard { kernel: self }
    }

    fn with_files<R>(&self, f: impl FnOnce(&mut FileTable) -> R) -> Option<R> {
        let mut st = self.lock_state();
        self.assert_current(&st);
        let cur = st.current;
        st.threads[cur].process.as_mut().map(|p| f(&mut p.files))
    }

    /// Creates a file; `true` on success.
    pub fn create_file(&self, name: &str, size: u32) -> bool {
        let _fs = self.fs_guard();
        let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        match storage.create(name, size) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("create {name:?}: {e:?}");
                false
            }
        }
    }

    /// Removes a file; `true` on success. Open handles survive removal.
    pub fn remove_file(&self, name: &str) -> bool {
        let _fs = self.fs_guard();
        let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        storage.remove(name).is_ok()
    }

    /// Opens `name` in the calling process's descriptor table; the new
    /// descriptor, or -1 if the file does not exist or the table is full.
    pub fn open_file(&self, name: &str) -> i32 {
        let _fs = self.fs_guard();
        let handle = {
            let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
            match storage.open(name) {
                Ok(h) => h,
                Err(_) => return -1,
            }
        };
        match self.with_files(|files| files.alloc(handle).map(|fd| fd as i32).unwrap_or(-1)) {
            Some(fd) => fd,
            None => -1,
        }
    }

    /// Length of the file behind `fd`, or -1 for an invalid descriptor.
    pub fn file_size(&self, fd: usize) -> i32 {
        let _fs = self.fs_guard();
        self.with_files(|files| files.get_mut(fd).map(|h| h.len() as i32))
            .flatten()
            .unwrap_or(-1)
    }

    /// Reads from `fd` into `buf`; bytes read, or -1 for an invalid
    /// descriptor.
    pub fn read_file(&self, fd: usize, buf: &mut [u8]) -> i32 {
        let _fs = self.fs_guard();
        self.with_files(|files| files.get_mut(fd).map(|h| h.read(buf) as i32))
            .flatten()
            .unwrap_or(-1)
    }

    /// Writes `data` to `fd`; bytes written, or -1 for an invalid
    /// descriptor. Zero means writes to the file are currently denied.
    pub fn write_file(&self, fd: usize, data: &[u8]) -> i32 {
        let _fs = self.fs_guard();
        self.with_files(|files| files.get_mut(fd).map(|h| h.write(data) as i32))
            .flatten()
            .unwrap_or(-1)
    }

    /// Moves `fd`'s position; `false` for an invalid descriptor.
    pub fn seek_file(&self, fd: usize, pos: u32) -> bool {
        let _fs = self.fs_guard();
        self.with_files(|files| {
            files.get_mut(fd).map(|h| h.seek(pos)).is_some()
        })
        .unwrap_or(false)
    }

    /// Position of `fd`, or -1 for an invalid descriptor.
    pub fn tell_file(&self, fd: usize) -> i32 {
        let _fs = self.fs_guard();
        self.with_files(|files| files.get_mut(fd).map(|h| h.tell() as i32))
            .flatten()
            .unwrap_or(-1)
    }

    /// Closes `fd`; `false` for an invalid descriptor.
    pub fn close_file(&self, fd: usize) -> bool {
        let _fs = self.fs_guard();
        self.with_files(|files| files.take(fd).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_write_read() {
        let mut fs = MemStorage::new();
        fs.create("a", 0).unwrap();
        assert!(matches!(fs.create("a", 0), Err(KernelError::FileExist)));

        let mut f = fs.open("a").unwrap();
        assert_eq!(f.write(b"hello"), 5);
        assert_eq!(f.len(), 5);
        f.seek(0);
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(f.read(&mut buf), 0);
    }

    #[test]
    fn seek_past_end_zero_fills() {
        let mut fs = MemStorage::new();
        fs.create("gap", 2).unwrap();
        let mut f = fs.open("gap").unwrap();
        f.seek(6);
        assert_eq!(f.read(&mut [0u8; 4]), 0);
        assert_eq!(f.write(b"xy"), 2);
        assert_eq!(f.len(), 8);
        f.seek(0);
        let mut buf = [0u8; 8];
        assert_eq!(f.read(&mut buf), 8);
        assert_eq!(&buf, b"\0\0\0\0\0\0xy");
    }

    #[test]
    fn remove_keeps_open_handles_alive() {
        let mut fs = MemStorage::new();
        fs.create("doomed", 0).unwrap();
        let mut f = fs.open("doomed").unwrap();
        f.write(b"still here");
        fs.remove("doomed").unwrap();
        assert!(fs.open("doomed").is_err());
        f.seek(0);
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf), 10);
    }

    #[test]
    fn deny_write_is_lifted_on_close() {
        let mut fs = MemStorage::new();
        fs.create("exe", 0).unwrap();
        let mut guard = fs.open("exe").unwrap();
        guard.deny_write();
        guard.deny_write(); // idempotent per handle

        let mut other = fs.open("exe").unwrap();
        assert_eq!(other.write(b"nope"), 0);
        drop(guard);
        assert_eq!(other.write(b"yes"), 3);
    }

    #[test]
    fn file_table_skips_console_slots_and_fills_up() {
        let mut fs = MemStorage::new();
        fs.create("f", 0).unwrap();
        let mut table = FileTable::new();
        for expected in 2..MAX_FILE {
            let fd = table.alloc(fs.open("f").unwrap()).ok().unwrap();
            assert_eq!(fd, expected);
        }
        assert!(table.alloc(fs.open("f").unwrap()).is_err());
        assert!(table.take(10).is_some());
        let fd = table.alloc(fs.open("f").unwrap()).ok().unwrap();
        assert_eq!(fd, 10);
        assert!(table.get_mut(0).is_none());
        assert!(table.get_mut(1).is_none());
    }
}
