use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag. Set to `true` on first SIGINT/SIGTERM; the
/// orchestrators poll it once per block offset.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Install signal handlers for cooperative shutdown.
///
/// The first signal sets [`SHUTDOWN`] and restores the default handler so a
/// second signal terminates immediately. The provider child installs its
/// own handlers after the fork and is reaped by the controller on unwind.
pub fn install_signal_handlers() {
    // Safety: the handler only stores an atomic bool and re-arms SIG_DFL.
    unsafe {
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

extern "C" fn signal_handler(sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
