//! Unix signal handling.
//!
//! SIGTERM and SIGINT request shutdown, SIGHUP requests a reload. The
//! handlers only set static atomic flags; the main loop calls
//! [`SignalHandler::poll`] to move them into the shared state.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
static RELOAD_FLAG: AtomicBool = AtomicBool::new(false);

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM or SIGINT.
    Shutdown,
    /// SIGHUP.
    Reload,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Shutdown => write!(f, "shutdown"),
            SignalKind::Reload => write!(f, "reload"),
        }
    }
}

/// Flags shared between the signal poller and the rest of the daemon.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    reload_requested: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// True once shutdown was requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// True if a reload was requested since the last call.
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::Relaxed)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    fn record(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        match kind {
            SignalKind::Shutdown => self.request_shutdown(),
            SignalKind::Reload => self.reload_requested.store(true, Ordering::Relaxed),
        }
    }

    /// Signals received so far.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

/// Cloneable handle to the daemon's signal state.
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Install the handlers.
    pub fn new() -> std::io::Result<Self> {
        #[cfg(unix)]
        install_unix_handlers()?;

        Ok(Self {
            state: Arc::new(SignalState::default()),
        })
    }

    /// Move pending signals into the shared state.
    pub fn poll(&self) {
        if SHUTDOWN_FLAG.swap(false, Ordering::Relaxed) {
            info!(signal = %SignalKind::Shutdown, "Signal received");
            self.state.record(SignalKind::Shutdown);
        }
        if RELOAD_FLAG.swap(false, Ordering::Relaxed) {
            info!(signal = %SignalKind::Reload, "Signal received");
            self.state.record(SignalKind::Reload);
        }
    }

    /// True once shutdown was requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// True if a reload was requested since the last call.
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.state.take_reload_request()
    }

    /// Request shutdown from inside the daemon.
    pub fn request_shutdown(&self) {
        info!("Shutdown requested");
        self.state.request_shutdown();
    }

    /// Shared state.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn install_unix_handlers() -> std::io::Result<()> {
    use std::os::raw::c_int;

    extern "C" fn on_shutdown(_: c_int) {
        SHUTDOWN_FLAG.store(true, Ordering::Relaxed);
    }

    extern "C" fn on_reload(_: c_int) {
        RELOAD_FLAG.store(true, Ordering::Relaxed);
    }

    let handlers: [(c_int, extern "C" fn(c_int)); 3] = [
        (libc::SIGTERM, on_shutdown),
        (libc::SIGINT, on_shutdown),
        (libc::SIGHUP, on_reload),
    ];
    for (signal, handler) in handlers {
        // SAFETY: the handlers only store to static atomics.
        let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }

    debug!("Unix signal handlers installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_default() {
        let state = SignalState::default();
        assert!(!state.shutdown_requested());
        assert!(!state.take_reload_request());
        assert_eq!(state.signal_count(), 0);
    }

    #[test]
    fn test_reload_flag_clears() {
        let state = SignalState::default();
        state.record(SignalKind::Reload);
        assert!(state.take_reload_request());
        assert!(!state.take_reload_request());
        assert!(!state.shutdown_requested());
        assert_eq!(state.signal_count(), 1);
    }

    #[test]
    fn test_manual_shutdown() {
        let handler = SignalHandler::new().unwrap();
        handler.request_shutdown();
        assert!(handler.shutdown_requested());
    }
}
