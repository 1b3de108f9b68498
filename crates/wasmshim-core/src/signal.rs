//! Signal delivery to task processes.

use wasmshim_common::error::{Result, ShimError};

/// Outcome of a signal delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal was queued for the target.
    Delivered,
    /// The target had already exited (`ESRCH`).
    AlreadyExited,
}

/// Sends `signal` to `pid`, or to the process group led by `pid` when
/// `group` is set.
///
/// A target that exited before the signal landed is reported as
/// [`Delivery::AlreadyExited`] rather than an error.
///
/// # Errors
///
/// Returns an error if the signal number is unknown, the pid is out of
/// range, or `kill(2)` fails with anything other than `ESRCH`.
#[cfg(target_os = "linux")]
pub fn deliver(pid: u32, signal: u32, group: bool) -> Result<Delivery> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    let sig = i32::try_from(signal)
        .ok()
        .and_then(|n| Signal::try_from(n).ok())
        .ok_or_else(|| ShimError::invalid_argument(format!("unknown signal {signal}")))?;
    let raw = i32::try_from(pid)
        .map_err(|_| ShimError::invalid_argument(format!("pid {pid} out of range")))?;
    let target = Pid::from_raw(raw);

    let result = if group { killpg(target, sig) } else { kill(target, sig) };
    match result {
        Ok(()) => {
            tracing::debug!(pid, signal = %sig, group, "signal delivered");
            Ok(Delivery::Delivered)
        }
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, signal = %sig, "signal target already exited");
            Ok(Delivery::AlreadyExited)
        }
        Err(e) => Err(ShimError::system(format!("kill {pid} with {sig}"), e)),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; signal delivery requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn deliver(_pid: u32, _signal: u32, _group: bool) -> Result<Delivery> {
    Err(ShimError::FailedPrecondition {
        message: "Linux required for signal delivery".into(),
    })
}
