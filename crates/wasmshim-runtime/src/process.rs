//! Task processes and their exit tracking.
//!
//! A [`WasmProcess`] owns one OS process. Its lifecycle is
//! `Created -> Running -> Stopped`: `start` spawns the command built by the
//! [`crate::launcher`] and hands the child to a dedicated waiter thread,
//! which records the exit status, wakes every [`Process::wait`] caller, and
//! publishes a single [`Exit`] event. All state lives behind one mutex; the
//! paired condition variable is the "exited" gate.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use wasmshim_common::constants;
use wasmshim_common::error::{Result, ShimError};
use wasmshim_common::types::{Exit, ProcessState, Stdio, WinSize};
use wasmshim_core::signal;

use crate::launcher::{self, LaunchSpec, StdioFiles};

/// Operations the container routes to its init and exec processes.
pub trait Process: Send + Sync + fmt::Debug {
    /// Process identifier (task id for init, exec id otherwise).
    fn id(&self) -> &str;

    /// OS pid, or 0 before a successful start.
    fn pid(&self) -> u32;

    /// Recorded exit status; meaningful once stopped.
    fn exit_status(&self) -> i32;

    /// Time the exit was observed; `None` until stopped.
    fn exited_at(&self) -> Option<DateTime<Utc>>;

    /// I/O redirection targets.
    fn stdio(&self) -> &Stdio;

    /// Current lifecycle state. Never blocks.
    ///
    /// # Errors
    ///
    /// Implementations backed by external state may fail to query it.
    fn status(&self) -> Result<ProcessState>;

    /// Spawns the OS process.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::AlreadyRunning`] on a second start, an I/O error
    /// if a redirection target cannot be opened, or a system error if the
    /// spawn fails.
    fn start(&self) -> Result<()>;

    /// Blocks until the process has exited.
    fn wait(&self);

    /// Blocks until the process has exited or `timeout` elapses. Returns
    /// whether the process exited.
    fn wait_timeout(&self, timeout: Duration) -> bool;

    /// Delivers `signal` to the process, or to its whole group with `all`.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::NotStarted`] before a successful start.
    fn kill(&self, signal: u32, all: bool) -> Result<()>;

    /// Resizes the process terminal.
    ///
    /// # Errors
    ///
    /// Implementations with a real terminal may fail to resize it.
    fn resize(&self, size: WinSize) -> Result<()>;

    /// Releases process resources.
    ///
    /// # Errors
    ///
    /// Implementations with external state may fail to release it.
    fn delete(&self) -> Result<()>;

    /// Closes the owned stdin handle, if any.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if closing fails.
    fn close_stdin(&self) -> Result<()>;

    /// Overwrites the recorded exit status without changing state.
    fn set_exited(&self, status: i32);
}

#[derive(Debug)]
struct Inner {
    state: ProcessState,
    /// Set once an OS process was spawned; never cleared.
    started: bool,
    pid: u32,
    exit_status: i32,
    exited_at: Option<DateTime<Utc>>,
    stdin: Option<File>,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    exited: Condvar,
    cancelled: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A task process launched through a WASM engine or directly.
#[derive(Debug)]
pub struct WasmProcess {
    id: String,
    spec: LaunchSpec,
    exit_tx: SyncSender<Exit>,
    shared: Arc<Shared>,
}

impl WasmProcess {
    /// Creates a process in the `Created` state.
    ///
    /// `exit_tx` receives exactly one [`Exit`] once the started process
    /// terminates.
    #[must_use]
    pub fn new(id: impl Into<String>, spec: LaunchSpec, exit_tx: SyncSender<Exit>) -> Self {
        Self {
            id: id.into(),
            spec,
            exit_tx,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ProcessState::Created,
                    started: false,
                    pid: 0,
                    exit_status: 0,
                    exited_at: None,
                    stdin: None,
                }),
                exited: Condvar::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the launch specification.
    #[must_use]
    pub const fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// Stops the waiter from publishing the exit event.
    ///
    /// The waiter still records the exit and wakes waiters; the OS process
    /// is not affected, and a wait already in progress cannot be
    /// interrupted.
    pub fn cancel_wait(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    fn open_stdio(&self) -> Result<(StdioFiles, Option<File>, Vec<File>)> {
        let stdio = &self.spec.stdio;
        let stdin = stdio.stdin.as_deref().map(open_input).transpose()?;
        let stdout = stdio.stdout.as_deref().map(open_output).transpose()?;
        let stderr = stdio.stderr.as_deref().map(open_output).transpose()?;

        // The child gets duplicates; the originals stay with the process
        // until the waiter releases them.
        let dup = |file: Option<&File>, path: Option<&Path>| -> Result<Option<File>> {
            file.map(|f| {
                f.try_clone().map_err(|e| ShimError::Io {
                    path: path.unwrap_or_else(|| Path::new("")).to_path_buf(),
                    source: e,
                })
            })
            .transpose()
        };
        let files = StdioFiles {
            stdin: dup(stdin.as_ref(), stdio.stdin.as_deref())?,
            stdout: dup(stdout.as_ref(), stdio.stdout.as_deref())?,
            stderr: dup(stderr.as_ref(), stdio.stderr.as_deref())?,
        };
        let closers = stdout.into_iter().chain(stderr).collect();
        Ok((files, stdin, closers))
    }
}

fn open_input(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| ShimError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

fn open_output(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| ShimError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Maps a wait status to the reported exit status: the exit code, or
/// `128 + signal` for a signalled process.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| constants::SIGNAL_EXIT_OFFSET + sig))
        .unwrap_or(constants::WAIT_FAILED_STATUS)
}

/// Blocks until `pid` has terminated without reaping it, so the pid stays
/// reserved until the exit is recorded under the lock. Returns `false` if
/// the exit could not be observed this way.
#[cfg(target_os = "linux")]
fn block_until_exited(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::wait::{Id, WaitPidFlag, waitid};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    loop {
        match waitid(
            Id::Pid(Pid::from_raw(raw)),
            WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
        ) {
            Err(Errno::EINTR) => {}
            Ok(_) => return true,
            Err(e) => {
                tracing::warn!(pid, error = %e, "waitid failed, falling back to reaping wait");
                return false;
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
const fn block_until_exited(_pid: u32) -> bool {
    false
}

/// Kills and reaps a child that never got a waiter.
fn reap_abandoned(mut child: Child) -> Option<ExitStatus> {
    if let Err(e) = child.kill() {
        tracing::warn!(pid = child.id(), error = %e, "failed to kill abandoned child");
    }
    child.wait().ok()
}

struct Waiter {
    id: String,
    pid: u32,
    child: Child,
    shared: Arc<Shared>,
    exit_tx: SyncSender<Exit>,
    closers: Vec<File>,
}

impl Waiter {
    fn run(mut self) {
        let early = if block_until_exited(self.pid) {
            None
        } else {
            Some(self.child.wait())
        };

        let status = {
            let mut inner = self.shared.lock();
            let reaped = match early {
                Some(result) => result,
                None => self.child.wait(),
            };
            let status = match reaped {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::error!(id = %self.id, pid = self.pid, error = %e, "wait returned error");
                    constants::WAIT_FAILED_STATUS
                }
            };
            inner.exit_status = status;
            inner.exited_at = Some(Utc::now());
            inner.state = ProcessState::Stopped;
            status
        };
        self.shared.exited.notify_all();
        tracing::info!(id = %self.id, pid = self.pid, status, "process exited");

        if self.shared.cancelled.load(Ordering::SeqCst) {
            tracing::debug!(id = %self.id, "exit event suppressed after cancellation");
        } else if self
            .exit_tx
            .send(Exit {
                pid: self.pid,
                status,
            })
            .is_err()
        {
            tracing::warn!(id = %self.id, pid = self.pid, "exit receiver dropped");
        }

        drop(self.shared.lock().stdin.take());
        drop(self.closers);
    }
}

impl Process for WasmProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.shared.lock().pid
    }

    fn exit_status(&self) -> i32 {
        self.shared.lock().exit_status
    }

    fn exited_at(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().exited_at
    }

    fn stdio(&self) -> &Stdio {
        &self.spec.stdio
    }

    fn status(&self) -> Result<ProcessState> {
        Ok(self.shared.lock().state)
    }

    fn start(&self) -> Result<()> {
        if self.shared.lock().started {
            return Err(ShimError::AlreadyRunning {
                id: self.id.clone(),
            });
        }

        let invocation = launcher::build(&self.spec)?;
        // Opening a FIFO may block until its peer appears, so no lock is
        // held here. Handles are released on any early return.
        let (files, stdin, closers) = self.open_stdio()?;
        let mut cmd = invocation.command(files);

        let mut inner = self.shared.lock();
        if inner.started {
            return Err(ShimError::AlreadyRunning {
                id: self.id.clone(),
            });
        }
        let child = cmd
            .spawn()
            .map_err(|e| ShimError::system(format!("spawn {}", invocation.program), e))?;
        drop(cmd);
        let pid = child.id();

        // The waiter is handed over only once its thread exists, so a failed
        // thread spawn leaves the child here to be killed and reaped.
        let (handoff, receive) = mpsc::sync_channel::<Waiter>(1);
        let spawned = std::thread::Builder::new()
            .name(format!("wait-{pid}"))
            .spawn(move || {
                if let Ok(waiter) = receive.recv() {
                    waiter.run();
                }
            });
        if let Err(e) = spawned {
            let status = reap_abandoned(child);
            tracing::error!(id = %self.id, pid, ?status, error = %e, "waiter thread spawn failed");
            return Err(ShimError::system("spawn waiter thread", e));
        }

        let waiter = Waiter {
            id: self.id.clone(),
            pid,
            child,
            shared: Arc::clone(&self.shared),
            exit_tx: self.exit_tx.clone(),
            closers,
        };
        if let Err(mpsc::SendError(waiter)) = handoff.send(waiter) {
            let status = reap_abandoned(waiter.child);
            tracing::error!(id = %self.id, pid, ?status, "waiter thread exited before handoff");
            return Err(ShimError::system(
                "hand off to waiter thread",
                std::io::Error::from(std::io::ErrorKind::BrokenPipe),
            ));
        }
        // The waiter records the exit under this lock, after the commit.
        inner.started = true;
        inner.pid = pid;
        inner.stdin = stdin;
        inner.state = ProcessState::Running;
        drop(inner);

        tracing::info!(
            id = %self.id,
            pid,
            program = %invocation.program,
            sandbox = self.spec.is_sandbox,
            "process started"
        );
        Ok(())
    }

    fn wait(&self) {
        let inner = self.shared.lock();
        drop(
            self.shared
                .exited
                .wait_while(inner, |i| i.state != ProcessState::Stopped)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let inner = self.shared.lock();
        let (inner, _) = self
            .shared
            .exited
            .wait_timeout_while(inner, timeout, |i| i.state != ProcessState::Stopped)
            .unwrap_or_else(PoisonError::into_inner);
        inner.state == ProcessState::Stopped
    }

    fn kill(&self, sig: u32, all: bool) -> Result<()> {
        // The lock is held across the signal so the pid cannot be reaped
        // and recycled underneath it.
        let inner = self.shared.lock();
        if !inner.started {
            return Err(ShimError::NotStarted {
                id: self.id.clone(),
            });
        }
        if inner.state == ProcessState::Stopped {
            tracing::debug!(id = %self.id, "process already finished");
            return Ok(());
        }
        let _ = signal::deliver(inner.pid, sig, all)?;
        Ok(())
    }

    fn resize(&self, _size: WinSize) -> Result<()> {
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        Ok(())
    }

    fn close_stdin(&self) -> Result<()> {
        let Some(stdin) = self.shared.lock().stdin.take() else {
            return Ok(());
        };
        // close(2) directly: dropping the File would discard its error.
        nix::unistd::close(stdin).map_err(|e| ShimError::Io {
            path: self.spec.stdio.stdin.clone().unwrap_or_default(),
            source: e.into(),
        })?;
        tracing::debug!(id = %self.id, "stdin closed");
        Ok(())
    }

    fn set_exited(&self, status: i32) {
        self.shared.lock().exit_status = status;
    }
}
