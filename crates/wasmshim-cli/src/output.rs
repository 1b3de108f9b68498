//! Formatted output helpers for CLI commands.

use wasmshim_common::constants;

/// Describes a reported exit status for humans.
#[must_use]
pub fn exit_line(id: &str, pid: u32, status: i32) -> String {
    let outcome = if status == constants::WAIT_FAILED_STATUS {
        "exit status unknown (wait failed)".to_string()
    } else if let Some(signal) = signal_of(status) {
        format!("terminated by signal {signal} (status {status})")
    } else {
        format!("exited with status {status}")
    };
    format!("task {id} (pid {pid}) {outcome}")
}

/// Maps a reported status to the code this process exits with.
#[must_use]
pub fn process_exit_code(status: i32) -> i32 {
    if status < 0 { 1 } else { status.min(255) }
}

fn signal_of(status: i32) -> Option<i32> {
    let signal = status - constants::SIGNAL_EXIT_OFFSET;
    (1..=64).contains(&signal).then_some(signal)
}
