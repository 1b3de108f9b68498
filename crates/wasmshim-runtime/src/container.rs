//! Task container: one init process plus any exec'd processes.
//!
//! The container lock guards only the exec registry and the cached cgroup.
//! Process operations that may block are called after the lock is
//! released: look up under the lock, release, then call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use wasmshim_common::constants;
use wasmshim_common::error::{Result, ShimError};
use wasmshim_common::types::{
    CheckpointTaskRequest, CloseIoRequest, DeleteRequest, ExecProcessRequest, KillRequest,
    ResizePtyRequest, StartRequest, UpdateTaskRequest, WinSize,
};
use wasmshim_core::cgroup::{CgroupHandle, CgroupResolver};

use crate::process::Process;

#[derive(Debug, Default)]
struct Registry {
    processes: HashMap<String, Arc<dyn Process>>,
    cgroup: Option<CgroupHandle>,
}

/// A task and the processes running in it.
pub struct Container {
    id: String,
    bundle: PathBuf,
    rootfs: PathBuf,
    init: Arc<dyn Process>,
    cgroups: Arc<dyn CgroupResolver>,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("bundle", &self.bundle)
            .field("rootfs", &self.rootfs)
            .field("init", &self.init)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Creates a container around its init process with an empty registry.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        bundle: impl Into<PathBuf>,
        rootfs: impl Into<PathBuf>,
        init: Arc<dyn Process>,
        cgroups: Arc<dyn CgroupResolver>,
    ) -> Self {
        Self {
            id: id.into(),
            bundle: bundle.into(),
            rootfs: rootfs.into(),
            init,
            cgroups,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Task identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bundle directory.
    #[must_use]
    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    /// Root filesystem presented to the workload.
    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Pid of the init process, 0 before it started.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.init.pid()
    }

    /// Returns the cached cgroup, if resolved.
    #[must_use]
    pub fn cgroup(&self) -> Option<CgroupHandle> {
        self.lock().cgroup.clone()
    }

    /// Caches `cgroup` unless one is already cached.
    pub fn cgroup_set(&self, cgroup: CgroupHandle) {
        let mut registry = self.lock();
        if registry.cgroup.is_none() {
            registry.cgroup = Some(cgroup);
        }
    }

    /// Resolves a process: the empty id addresses init.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::NotFound`] for an unknown exec id.
    pub fn process(&self, exec_id: &str) -> Result<Arc<dyn Process>> {
        if exec_id.is_empty() {
            return Ok(Arc::clone(&self.init));
        }
        self.lock()
            .processes
            .get(exec_id)
            .cloned()
            .ok_or_else(|| ShimError::NotFound {
                kind: "process",
                id: exec_id.to_string(),
            })
    }

    /// Returns whether an exec process is registered under `exec_id`.
    #[must_use]
    pub fn process_exists(&self, exec_id: &str) -> bool {
        self.lock().processes.contains_key(exec_id)
    }

    /// Registers an exec process under its id.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::InvalidArgument`] for an empty id, which is
    /// reserved for the init process.
    pub fn process_add(&self, process: Arc<dyn Process>) -> Result<()> {
        if process.id().is_empty() {
            return Err(ShimError::invalid_argument(
                "exec process id must not be empty",
            ));
        }
        let id = process.id().to_string();
        let _ = self.lock().processes.insert(id, process);
        Ok(())
    }

    /// Drops an exec process from the registry.
    pub fn process_remove(&self, exec_id: &str) {
        let _ = self.lock().processes.remove(exec_id);
    }

    /// Snapshot of the exec processes followed by the init process.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn Process>> {
        let mut out = self.execd_processes();
        out.push(Arc::clone(&self.init));
        out
    }

    /// Snapshot of the exec processes.
    #[must_use]
    pub fn execd_processes(&self) -> Vec<Arc<dyn Process>> {
        self.lock().processes.values().cloned().collect()
    }

    /// Starts a process.
    ///
    /// Starting init writes `<bundle>/init.pid`. The first start that
    /// yields a pid resolves and caches the cgroup.
    ///
    /// # Errors
    ///
    /// Returns the process start error, or a pid-file or cgroup error. In
    /// the latter two cases the process has already been started and keeps
    /// running.
    pub fn start(&self, request: &StartRequest) -> Result<Arc<dyn Process>> {
        let process = self.process(&request.exec_id)?;
        process.start()?;
        let pid = process.pid();
        tracing::info!(id = %self.id, exec_id = %request.exec_id, pid, "container process started");

        if request.exec_id.is_empty() {
            self.write_pid_file(pid)?;
        }

        if pid > 0 && self.cgroup().is_none() {
            // The process keeps running when discovery fails; the caller
            // decides whether to kill it.
            let cgroup = self.cgroups.resolve(pid).inspect_err(|e| {
                tracing::warn!(id = %self.id, pid, error = %e, "cgroup lookup failed after start");
            })?;
            tracing::debug!(id = %self.id, pid, cgroup = %cgroup, "cgroup resolved");
            self.cgroup_set(cgroup);
        }
        Ok(process)
    }

    fn write_pid_file(&self, pid: u32) -> Result<()> {
        let path = self.bundle.join(constants::INIT_PID_FILE);
        std::fs::write(&path, pid.to_string()).map_err(|e| ShimError::Io { path, source: e })
    }

    /// Delivers a signal to a process.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is unknown, not started, or the
    /// signal cannot be delivered.
    pub fn kill(&self, request: &KillRequest) -> Result<()> {
        let process = self.process(&request.exec_id)?;
        tracing::debug!(id = %self.id, exec_id = %request.exec_id, signal = request.signal, all = request.all, "kill");
        process.kill(request.signal, request.all)
    }

    /// Resizes a process terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is unknown.
    pub fn resize_pty(&self, request: &ResizePtyRequest) -> Result<()> {
        let process = self.process(&request.exec_id)?;
        let size = WinSize {
            width: u16::try_from(request.width).unwrap_or(u16::MAX),
            height: u16::try_from(request.height).unwrap_or(u16::MAX),
        };
        process.resize(size)
    }

    /// Closes the owned stdin handle of a process, if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is unknown, or an I/O error if
    /// closing the handle fails.
    pub fn close_io(&self, request: &CloseIoRequest) -> Result<()> {
        let process = self.process(&request.exec_id)?;
        tracing::debug!(id = %self.id, exec_id = %request.exec_id, stdin = request.stdin, "close io");
        process.close_stdin()
    }

    /// Deletes a process. Exec processes are dropped from the registry;
    /// init stays with the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is unknown or its delete fails.
    pub fn delete(&self, request: &DeleteRequest) -> Result<Arc<dyn Process>> {
        let process = self.process(&request.exec_id)?;
        process.delete()?;
        if !request.exec_id.is_empty() {
            self.process_remove(&request.exec_id);
        }
        Ok(process)
    }

    /// Adds a process to a running task.
    ///
    /// # Errors
    ///
    /// Always returns [`ShimError::NotImplemented`].
    pub fn exec(&self, _request: &ExecProcessRequest) -> Result<Arc<dyn Process>> {
        Err(ShimError::NotImplemented { operation: "exec" })
    }

    /// Freezes the task.
    ///
    /// # Errors
    ///
    /// Always returns [`ShimError::NotImplemented`].
    pub const fn pause(&self) -> Result<()> {
        Err(ShimError::NotImplemented { operation: "pause" })
    }

    /// Thaws the task.
    ///
    /// # Errors
    ///
    /// Always returns [`ShimError::NotImplemented`].
    pub const fn resume(&self) -> Result<()> {
        Err(ShimError::NotImplemented { operation: "resume" })
    }

    /// Checkpoints the task.
    ///
    /// # Errors
    ///
    /// Always returns [`ShimError::NotImplemented`].
    pub fn checkpoint(&self, _request: &CheckpointTaskRequest) -> Result<()> {
        Err(ShimError::NotImplemented {
            operation: "checkpoint",
        })
    }

    /// Updates task resources.
    ///
    /// # Errors
    ///
    /// Always returns [`ShimError::NotImplemented`].
    pub fn update(&self, _request: &UpdateTaskRequest) -> Result<()> {
        Err(ShimError::NotImplemented { operation: "update" })
    }

    /// Returns whether `pid` belongs to init or a registered exec process.
    #[must_use]
    pub fn has_pid(&self, pid: u32) -> bool {
        pid != 0 && self.all().iter().any(|p| p.pid() == pid)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use wasmshim_common::error::ErrorKind;
    use wasmshim_common::types::{ProcessState, Stdio};
    use wasmshim_core::cgroup::{CgroupHierarchy, UnifiedCgroup};

    use super::*;
    use crate::launcher::LaunchSpec;
    use crate::process::WasmProcess;

    struct FixedResolver(std::path::PathBuf);

    impl CgroupResolver for FixedResolver {
        fn resolve(&self, pid: u32) -> Result<CgroupHandle> {
            UnifiedCgroup::load(&self.0, "/", pid).map(CgroupHandle::Unified)
        }
    }

    fn sh_spec(script: &str) -> LaunchSpec {
        LaunchSpec {
            argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
            env: Vec::new(),
            rootfs: "/".into(),
            is_sandbox: true,
            engine: "wasmer".into(),
            stdio: Stdio::default(),
        }
    }

    fn container(
        bundle: &Path,
        script: &str,
        cgroups: Arc<dyn CgroupResolver>,
    ) -> (Container, mpsc::Receiver<wasmshim_common::types::Exit>) {
        let (tx, rx) = mpsc::sync_channel(4);
        let init = Arc::new(WasmProcess::new("task", sh_spec(script), tx));
        (Container::new("task", bundle, "/", init, cgroups), rx)
    }

    fn exec(
        id: &str,
        script: &str,
    ) -> (Arc<WasmProcess>, mpsc::Receiver<wasmshim_common::types::Exit>) {
        let (tx, rx) = mpsc::sync_channel(1);
        (Arc::new(WasmProcess::new(id, sh_spec(script), tx)), rx)
    }

    fn start_exec(c: &Container, exec_id: &str) -> u32 {
        c.start(&StartRequest {
            exec_id: exec_id.into(),
        })
        .unwrap()
        .pid()
    }

    #[test]
    fn exec_processes_are_registered_and_addressable() {
        let dir = tempfile::tempdir().unwrap();
        let cg = tempfile::tempdir().unwrap();
        let (c, init_rx) = container(
            dir.path(),
            "sleep 30",
            Arc::new(FixedResolver(cg.path().to_path_buf())),
        );
        let (a, a_rx) = exec("a", "sleep 30");
        let (b, b_rx) = exec("b", "sleep 30");
        c.process_add(a).unwrap();
        c.process_add(b).unwrap();

        assert!(c.process_exists("a"));
        assert!(c.process_exists("b"));
        assert!(!c.process_exists(""));
        assert_eq!(c.execd_processes().len(), 2);
        assert_eq!(c.all().len(), 3);
        assert_eq!(c.process("b").unwrap().id(), "b");

        let init_pid = start_exec(&c, "");
        let a_pid = start_exec(&c, "a");
        let b_pid = start_exec(&c, "b");
        for pid in [init_pid, a_pid, b_pid] {
            assert!(c.has_pid(pid));
        }
        let pid_file = std::fs::read_to_string(dir.path().join("init.pid")).unwrap();
        assert_eq!(pid_file, init_pid.to_string());

        for exec_id in ["", "a", "b"] {
            c.resize_pty(&ResizePtyRequest {
                exec_id: exec_id.into(),
                width: 80,
                height: 24,
            })
            .unwrap();
        }

        c.kill(&KillRequest {
            exec_id: "a".into(),
            signal: 9,
            all: false,
        })
        .unwrap();
        assert_eq!(a_rx.recv_timeout(Duration::from_secs(10)).unwrap().pid, a_pid);
        let deleted = c
            .delete(&DeleteRequest {
                exec_id: "a".into(),
            })
            .unwrap();
        assert_eq!(deleted.id(), "a");
        assert!(!c.process_exists("a"));
        assert!(!c.has_pid(a_pid));
        assert_eq!(c.all().len(), 2);

        let b = c.process("b").unwrap();
        c.process_remove("b");
        assert!(!c.process_exists("b"));
        assert!(!c.has_pid(b_pid));
        assert!(c.execd_processes().is_empty());
        b.kill(9, false).unwrap();
        assert_eq!(b_rx.recv_timeout(Duration::from_secs(10)).unwrap().pid, b_pid);

        c.kill(&KillRequest {
            signal: 9,
            ..KillRequest::default()
        })
        .unwrap();
        let _ = init_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let _ = c.delete(&DeleteRequest::default()).unwrap();
        assert_eq!(c.process("").unwrap().id(), "task");
        assert!(c.has_pid(init_pid));
    }

    #[test]
    fn close_io_closes_stdin_regardless_of_flag() {
        let dir = tempfile::tempdir().unwrap();
        let stdin = dir.path().join("stdin");
        std::fs::write(&stdin, "").unwrap();
        let canonical = std::fs::canonicalize(&stdin).unwrap();
        let open_handles = || {
            std::fs::read_dir("/proc/self/fd")
                .unwrap()
                .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
                .filter(|target| *target == canonical)
                .count()
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let mut spec = sh_spec("sleep 30");
        spec.stdio.stdin = Some(stdin.clone());
        let init = Arc::new(WasmProcess::new("task", spec, tx));
        let cg = tempfile::tempdir().unwrap();
        let resolver = Arc::new(FixedResolver(cg.path().to_path_buf()));
        let c = Container::new("task", dir.path(), "/", init, resolver);

        let _ = c.start(&StartRequest::default()).unwrap();
        assert_eq!(open_handles(), 1);
        c.close_io(&CloseIoRequest {
            exec_id: String::new(),
            stdin: false,
        })
        .unwrap();
        assert_eq!(open_handles(), 0);
        c.close_io(&CloseIoRequest::default()).unwrap();

        c.kill(&KillRequest {
            signal: 9,
            ..KillRequest::default()
        })
        .unwrap();
        let _ = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn empty_exec_id_resolves_init() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _rx) = container(dir.path(), "exit 0", Arc::new(CgroupHierarchy::system()));
        assert_eq!(c.process("").unwrap().id(), "task");
    }

    #[test]
    fn unknown_exec_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _rx) = container(dir.path(), "exit 0", Arc::new(CgroupHierarchy::system()));
        let err = c.process("missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn registry_rejects_empty_id() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _rx) = container(dir.path(), "exit 0", Arc::new(CgroupHierarchy::system()));
        let (tx, _rx2) = mpsc::sync_channel(1);
        let anonymous = Arc::new(WasmProcess::new("", sh_spec("exit 0"), tx));
        assert!(c.process_add(anonymous).is_err());
        assert!(c.execd_processes().is_empty());
    }

    #[test]
    fn unsupported_operations_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _rx) = container(dir.path(), "exit 0", Arc::new(CgroupHierarchy::system()));
        let names: Vec<_> = [
            c.exec(&ExecProcessRequest::default()).map(|_| ()),
            c.pause(),
            c.resume(),
            c.checkpoint(&CheckpointTaskRequest::default()),
            c.update(&UpdateTaskRequest::default()),
        ]
        .into_iter()
        .map(|r| r.unwrap_err().to_string())
        .collect();
        assert_eq!(
            names,
            vec![
                "exec not implemented",
                "pause not implemented",
                "resume not implemented",
                "checkpoint not implemented",
                "update not implemented",
            ]
        );
    }

    #[test]
    fn start_writes_pid_file_and_caches_cgroup() {
        let dir = tempfile::tempdir().unwrap();
        let cg = tempfile::tempdir().unwrap();
        let resolver = Arc::new(FixedResolver(cg.path().to_path_buf()));
        let (c, rx) = container(dir.path(), "exit 0", resolver);

        let p = c.start(&StartRequest::default()).unwrap();
        let pid_file = std::fs::read_to_string(dir.path().join("init.pid")).unwrap();
        assert_eq!(pid_file, p.pid().to_string());
        assert!(matches!(c.cgroup(), Some(CgroupHandle::Unified(_))));

        let exit = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(exit.pid, p.pid());
    }

    #[test]
    fn cgroup_failure_is_reported_but_process_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Arc::new(FixedResolver("/nonexistent/cgroup".into()));
        let (c, _rx) = container(dir.path(), "sleep 30", resolver);

        let err = c.start(&StartRequest::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::System);
        let init = c.process("").unwrap();
        assert_eq!(init.status().unwrap(), ProcessState::Running);
        assert!(c.cgroup().is_none());

        c.kill(&KillRequest {
            signal: 9,
            ..KillRequest::default()
        })
        .unwrap();
        init.wait();
    }

    #[test]
    fn cgroup_set_never_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let (c, _rx) = container(dir.path(), "exit 0", Arc::new(CgroupHierarchy::system()));
        c.cgroup_set(CgroupHandle::Unified(UnifiedCgroup::load(a.path(), "/", 1).unwrap()));
        c.cgroup_set(CgroupHandle::Unified(UnifiedCgroup::load(b.path(), "/", 1).unwrap()));
        let expected = a.path().to_path_buf();
        assert!(matches!(c.cgroup(), Some(CgroupHandle::Unified(u)) if u.path() == expected));
    }
}
