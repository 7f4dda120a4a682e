//! OS termination signals feeding the [`Shutdown`] context.
//!
//! Handlers are registered with tokio's signal driver, whose low-level handler
//! only writes to a self-pipe. The task spawned here runs on an ordinary
//! runtime thread and does nothing but call [`Shutdown::trigger`], so repeated
//! signals are harmless.
//!
//! ## Unix
//! - **SIGINT** (Ctrl-C in a terminal)
//! - **SIGTERM** (default `kill` signal, used by systemd and container runtimes)
//!
//! ## Other platforms
//! Only [`tokio::signal::ctrl_c`] is awaited.

// Local crates
use crate::helpers::shutdown::Shutdown;

// External crates
use tokio::task::JoinHandle;

/// Register the termination signals and forward every delivery to `shutdown`.
///
/// Registration happens before this returns, so a signal arriving right after
/// startup is not lost. Must be called from within a tokio runtime.
#[cfg(unix)]
pub fn listen_for_signals(shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = sigint.recv() => if received.is_none() { break },
                received = sigterm.recv() => if received.is_none() { break },
            }
            shutdown.trigger();
        }
    }))
}

/// Register the termination signals and forward every delivery to `shutdown`.
#[cfg(not(unix))]
pub fn listen_for_signals(shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            shutdown.trigger();
        }
    }))
}
