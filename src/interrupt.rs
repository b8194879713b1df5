//! Cooperative SIGINT/SIGTERM handling.
//!
//! Actions poll the latch between steps; on interruption they abort with an
//! error so the scoped mount release still runs. The state file write is
//! never torn by a signal because the latch is only consulted at step
//! boundaries.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install handlers for SIGINT and SIGTERM. Safe to call more than once.
pub fn install_handlers() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_signal as usize;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Bail out if an interrupt was received, naming the step that noticed.
pub fn checkpoint(step: &str) -> Result<()> {
    if interrupted() {
        bail!("interrupted before step '{step}', cleaning up");
    }
    Ok(())
}
