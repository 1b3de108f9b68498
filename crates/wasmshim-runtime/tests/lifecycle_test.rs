//! End-to-end lifecycle tests for the wasmshim runtime.
//!
//! Each test builds a bundle in a temporary directory, creates a container
//! through the factory in sandbox mode with `/` as the rootfs, and drives
//! real `/bin/sh` processes through start, wait, kill and exit reporting.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use wasmshim_common::config::RuntimeConfig;
use wasmshim_common::error::{ErrorKind, Result};
use wasmshim_common::types::{
    CloseIoRequest, CreateTaskRequest, Exit, KillRequest, Mount, ProcessState, StartRequest,
    Stdio,
};
use wasmshim_core::cgroup::{CgroupHandle, CgroupResolver, UnifiedCgroup};
use wasmshim_runtime::container::Container;
use wasmshim_runtime::factory::ContainerFactory;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

struct TempCgroup(PathBuf);

impl CgroupResolver for TempCgroup {
    fn resolve(&self, pid: u32) -> Result<CgroupHandle> {
        UnifiedCgroup::load(&self.0, "/", pid).map(CgroupHandle::Unified)
    }
}

struct Fixture {
    bundle: tempfile::TempDir,
    _cgroup: tempfile::TempDir,
    container: Container,
    exits: Receiver<Exit>,
}

fn write_bundle(dir: &Path, script: &str, env: &[&str]) {
    let config = serde_json::json!({
        "process": { "args": ["/bin/sh", "-c", script], "env": env },
        "annotations": { "io.kubernetes.cri.container-type": "sandbox" }
    });
    std::fs::write(dir.join("config.json"), config.to_string()).expect("write config");
}

fn root_bind() -> Mount {
    Mount {
        kind: "bind".into(),
        source: "/".into(),
        options: vec!["rbind".into()],
    }
}

fn fixture_with(script: &str, env: &[&str], stdio: Stdio) -> Fixture {
    let bundle = tempfile::tempdir().expect("bundle dir");
    let cgroup = tempfile::tempdir().expect("cgroup dir");
    write_bundle(bundle.path(), script, env);

    let factory = ContainerFactory::new(RuntimeConfig::default())
        .with_cgroup_resolver(Arc::new(TempCgroup(cgroup.path().to_path_buf())));
    let (tx, exits) = mpsc::sync_channel(8);
    let request = CreateTaskRequest {
        id: "task".into(),
        bundle: bundle.path().to_path_buf(),
        rootfs: vec![root_bind()],
        stdio,
    };
    let container = factory.create(&request, tx).expect("create container");
    Fixture {
        bundle,
        _cgroup: cgroup,
        container,
        exits,
    }
}

fn fixture(script: &str) -> Fixture {
    fixture_with(script, &[], Stdio::default())
}

fn kill(signal: u32) -> KillRequest {
    KillRequest {
        exec_id: String::new(),
        signal,
        all: false,
    }
}

// ── Start ────────────────────────────────────────────────────────────

#[test]
fn start_runs_to_completion_and_reports_exit_code() {
    let f = fixture("exit 7");
    let init = f.container.start(&StartRequest::default()).expect("start");
    let exit = f.exits.recv_timeout(EVENT_TIMEOUT).expect("exit event");

    assert_eq!(exit, Exit { pid: init.pid(), status: 7 });
    assert_eq!(init.status().unwrap(), ProcessState::Stopped);
    assert_eq!(init.exit_status(), 7);
    assert!(init.exited_at().is_some());
}

#[test]
fn second_start_is_already_running() {
    let f = fixture("sleep 30");
    let _ = f.container.start(&StartRequest::default()).expect("start");
    let err = f.container.start(&StartRequest::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    f.container.kill(&kill(9)).expect("kill");
    let _ = f.exits.recv_timeout(EVENT_TIMEOUT).expect("exit event");
}

#[test]
fn start_writes_init_pid_file_and_caches_cgroup() {
    let f = fixture("exit 0");
    let init = f.container.start(&StartRequest::default()).expect("start");

    let written = std::fs::read_to_string(f.bundle.path().join("init.pid")).expect("pid file");
    assert_eq!(written, init.pid().to_string());
    assert_eq!(f.container.pid(), init.pid());
    assert!(f.container.cgroup().is_some());
    let _ = f.exits.recv_timeout(EVENT_TIMEOUT).expect("exit event");
}

#[test]
fn sandbox_env_reaches_the_process() {
    let out_dir = tempfile::tempdir().expect("out dir");
    let stdout = out_dir.path().join("stdout");
    std::fs::write(&stdout, "").expect("create stdout");
    let stdio = Stdio {
        stdout: Some(stdout.clone()),
        ..Stdio::default()
    };
    let f = fixture_with("echo \"$GREETING\"", &["GREETING=hello"], stdio);

    let _ = f.container.start(&StartRequest::default()).expect("start");
    let exit = f.exits.recv_timeout(EVENT_TIMEOUT).expect("exit event");
    assert_eq!(exit.status, 0);
    assert_eq!(std::fs::read_to_string(stdout).unwrap(), "hello\n");
}

// ── Wait ─────────────────────────────────────────────────────────────

#[test]
fn wait_releases_every_caller() {
    let f = fixture("sleep 0.2");
    let init = f.container.process("").expect("init");
    let barrier = Arc::new(Barrier::new(5));

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let init = Arc::clone(&init);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let _ = barrier.wait();
                init.wait();
                init.status().unwrap()
            })
        })
        .collect();

    let _ = f.container.start(&StartRequest::default()).expect("start");
    let _ = barrier.wait();
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), ProcessState::Stopped);
    }
    // Waiting after the exit returns immediately.
    init.wait();
    let _ = f.exits.recv_timeout(EVENT_TIMEOUT).expect("exit event");
}

// ── Kill ─────────────────────────────────────────────────────────────

#[test]
fn kill_before_start_is_not_started() {
    let f = fixture("exit 0");
    let err = f.container.kill(&kill(15)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
}

#[test]
fn kill_after_exit_succeeds() {
    let f = fixture("exit 0");
    let init = f.container.start(&StartRequest::default()).expect("start");
    init.wait();
    f.container.kill(&kill(9)).expect("kill exited process");
}

#[test]
fn concurrent_kills_yield_one_exit_event() {
    let f = fixture("sleep 30");
    let init = f.container.start(&StartRequest::default()).expect("start");
    let container = Arc::new(f.container);

    let killers: Vec<_> = (0..8)
        .map(|_| {
            let container = Arc::clone(&container);
            thread::spawn(move || container.kill(&kill(9)))
        })
        .collect();
    for killer in killers {
        killer.join().unwrap().expect("kill");
    }

    let exit = f.exits.recv_timeout(EVENT_TIMEOUT).expect("exit event");
    assert_eq!(exit, Exit { pid: init.pid(), status: 137 });
    assert!(f.exits.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn kill_all_reaches_the_process_group() {
    let f = fixture("sleep 30 & wait");
    let init = f.container.start(&StartRequest::default()).expect("start");
    f.container
        .kill(&KillRequest {
            exec_id: String::new(),
            signal: 15,
            all: true,
        })
        .expect("kill group");
    let exit = f.exits.recv_timeout(EVENT_TIMEOUT).expect("exit event");
    assert_eq!(exit.pid, init.pid());
    assert_eq!(exit.status, 143);
}

// ── Container queries ────────────────────────────────────────────────

#[test]
fn has_pid_matches_init_only() {
    let f = fixture("sleep 30");
    assert!(!f.container.has_pid(0));
    let init = f.container.start(&StartRequest::default()).expect("start");
    assert!(f.container.has_pid(init.pid()));
    assert!(!f.container.has_pid(init.pid() + 100_000));

    f.container.kill(&kill(9)).expect("kill");
    let _ = f.exits.recv_timeout(EVENT_TIMEOUT).expect("exit event");
}

fn open_handles(path: &Path) -> usize {
    let target = std::fs::canonicalize(path).expect("canonical path");
    std::fs::read_dir("/proc/self/fd")
        .expect("fd table")
        .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
        .filter(|link| *link == target)
        .count()
}

#[test]
fn close_io_releases_stdin_handle() {
    let io_dir = tempfile::tempdir().expect("io dir");
    let stdin = io_dir.path().join("stdin");
    std::fs::write(&stdin, "").expect("create stdin");
    let stdio = Stdio {
        stdin: Some(stdin.clone()),
        ..Stdio::default()
    };
    let f = fixture_with("sleep 30", &[], stdio);

    let _ = f.container.start(&StartRequest::default()).expect("start");
    assert_eq!(open_handles(&stdin), 1);
    f.container
        .close_io(&CloseIoRequest {
            exec_id: String::new(),
            stdin: true,
        })
        .expect("close io");
    assert_eq!(open_handles(&stdin), 0);

    // Closing again is a no-op.
    f.container
        .close_io(&CloseIoRequest {
            exec_id: String::new(),
            stdin: true,
        })
        .expect("second close io");

    f.container.kill(&kill(9)).expect("kill");
    let exit = f.exits.recv_timeout(EVENT_TIMEOUT).expect("exit event");
    assert_eq!(exit.status, 137);
}

#[test]
fn unknown_exec_id_is_not_found() {
    let f = fixture("exit 0");
    let err = f
        .container
        .start(&StartRequest {
            exec_id: "nope".into(),
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
