//! Console device.

use std::sync::{Arc, Mutex};

/// A console the kernel reads keyboard input from and writes program output
/// to.
pub trait Teletype: Send {
    /// Reads up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Writes `buf`, returning how many bytes were written.
    fn write(&mut self, buf: &[u8]) -> usize;
}

/// A console fed from a fixed input script, capturing output for inspection.
///
/// Input follows the keyboard line discipline: a read stops short of a
/// newline and leaves it in the input, so a line's worth of data is the most
/// a single read returns.
pub struct ScriptedConsole {
    input: Vec<u8>,
    pos: usize,
    output: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedConsole {
    /// Creates a console that will serve `input` to readers.
    pub fn new(input: impl Into<Vec<u8>>) -> ScriptedConsole {
        ScriptedConsole {
            input: input.into(),
            pos: 0,
            output: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to everything written to the console.
    pub fn output(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.output)
    }
}

impl Teletype for ScriptedConsole {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() && self.pos < self.input.len() {
            if self.input[self.pos] == b'\n' {
                break;
            }
            buf[n] = self.input[self.pos];
            self.pos += 1;
            n += 1;
        }
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        buf.len()
    }
}
