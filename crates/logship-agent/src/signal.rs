//! Termination signal wiring
//!
//! SIGINT/SIGTERM flip the shared stop token; everything else, including the
//! actual teardown, happens on the main thread. The handler body is limited
//! to an atomic store, which is async-signal-safe.

use crate::worker::StopToken;

#[cfg(unix)]
mod imp {
    use std::sync::OnceLock;

    use crate::worker::StopToken;

    static STOP: OnceLock<StopToken> = OnceLock::new();

    extern "C" fn on_terminate(_signal: libc::c_int) {
        if let Some(stop) = STOP.get() {
            stop.request_stop();
        }
    }

    pub fn install(stop: &StopToken) {
        if STOP.set(stop.clone()).is_err() {
            return;
        }
        unsafe {
            libc::signal(libc::SIGINT, on_terminate as libc::sighandler_t);
            libc::signal(libc::SIGTERM, on_terminate as libc::sighandler_t);
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use crate::worker::StopToken;

    pub fn install(_stop: &StopToken) {}
}

/// Routes process termination signals to `stop`. Installing twice is a no-op.
pub fn install_termination_handler(stop: &StopToken) {
    imp::install(stop);
}
