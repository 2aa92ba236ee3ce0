//! SIGTERM/SIGINT handling.
//!
//! The handler only flips an atomic; the accept loop polls it and performs the
//! actual teardown on the main thread.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn install_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    for signal in [libc::SIGTERM, libc::SIGINT] {
        // SAFETY: the handler is async-signal-safe (a single atomic store).
        #[allow(unsafe_code)]
        let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            warn!(signal, "Failed to install signal handler");
        }
    }
}

pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_sets_shutdown_flag() {
        assert!(!requested());
        on_signal(libc::SIGTERM);
        assert!(requested());
        SHUTDOWN.store(false, Ordering::SeqCst);
    }
}
