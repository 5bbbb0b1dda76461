//! Machine power control.

use crate::process::ExitRequest;
use crate::Kernel;
use std::panic;
use std::sync::atomic::Ordering;

impl Kernel {
    /// Whether a halt has been requested.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Powers the machine off on behalf of the calling process.
    ///
    /// The simulation cannot stop threads it is not running, so a halt marks
    /// the machine down and terminates the caller without the usual exit
    /// message.
    pub(crate) fn shutdown(&self) -> ! {
        log::info!("machine halt requested");
        self.halted.store(true, Ordering::SeqCst);
        panic::panic_any(ExitRequest {
            status: 0,
            print: false,
        });
    }
}
