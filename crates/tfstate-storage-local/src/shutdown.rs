//! When the plugin stops serving.
//!
//! The server drains and exits on Ctrl+C, on SIGTERM, or once the
//! orchestrator process given by `--parent-pid` is gone. All three feed one
//! watch channel, so an orphaned plugin shuts down as gracefully as a
//! signalled one.

use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Spawn the trigger task. The receiver flips to `true` exactly once.
pub fn watch_for_shutdown(parent_pid: Option<u32>) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let reason = tokio::select! {
            reason = ctrl_c() => reason,
            reason = terminate() => reason,
            reason = parent_exit(parent_pid) => reason,
        };
        info!("Shutting down: {}", reason);
        let _ = tx.send(true);
    });

    rx
}

/// Ask the kernel to send SIGTERM once the parent dies, which the trigger
/// task then handles like any other SIGTERM. Polling still covers the case
/// where the parent died before this call.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn request_parent_death_signal() {
    // SAFETY: prctl(PR_SET_PDEATHSIG) takes no pointers.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc != 0 {
        error!(
            "prctl(PR_SET_PDEATHSIG) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn request_parent_death_signal() {}

async fn ctrl_c() -> &'static str {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    "received Ctrl+C"
}

#[cfg(unix)]
async fn terminate() -> &'static str {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
    "received SIGTERM"
}

#[cfg(not(unix))]
async fn terminate() -> &'static str {
    std::future::pending().await
}

async fn parent_exit(parent_pid: Option<u32>) -> &'static str {
    let Some(pid) = parent_pid else {
        return std::future::pending().await;
    };

    let mut ticks = tokio::time::interval(PARENT_POLL_INTERVAL);
    loop {
        // The first tick completes immediately, which catches a parent that
        // was already gone at startup.
        ticks.tick().await;
        if !process_alive(pid) {
            return "parent process exited";
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the process exists.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, WAIT_TIMEOUT};
    use windows_sys::Win32::System::Threading::{OpenProcess, WaitForSingleObject};

    const SYNCHRONIZE: u32 = 0x0010_0000;
    // SAFETY: the handle is checked for null and closed before returning.
    unsafe {
        let handle = OpenProcess(SYNCHRONIZE, 0, pid);
        if handle.is_null() {
            return false;
        }
        let running = WaitForSingleObject(handle, 0) == WAIT_TIMEOUT;
        CloseHandle(handle);
        running
    }
}
