//! End-to-end runs against real executables on disk

#![cfg(unix)]

use shellrun_core::{ProcessObserver, ProcessSignal, ShellError};
use shellrun_runner::{
    CommandBuilder, Environment, ProcessConfig, RunningProcess, UnixEnvironment,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[derive(Default)]
struct SignalLog {
    signals: Mutex<Vec<ProcessSignal>>,
}

impl ProcessObserver for SignalLog {
    fn signal_sent(&self, signal: ProcessSignal) {
        self.signals.lock().unwrap().push(signal);
    }
}

#[test]
fn test_binary_prints_and_exits_cleanly() {
    let fixtures = TempDir::new().unwrap();
    write_script(fixtures.path(), "test_binary", "echo 'Test command'\necho");

    let command = CommandBuilder::with_environment(Arc::new(UnixEnvironment::new()))
        .binary("./test_binary")
        .cwd(fixtures.path())
        .build()
        .unwrap();
    assert_eq!(command.command_line(), "./test_binary");

    let mut process = command.spawn().unwrap();
    let mut stdout = Vec::new();
    process.wait_with(|out, _| stdout.extend_from_slice(out)).unwrap();

    assert_eq!(process.exit_code().unwrap(), 0);
    assert_eq!(stdout, b"Test command\n\n");
    assert_eq!(process.stdout(), b"Test command\n\n");
}

#[test]
fn test_global_lookup_through_search_path_override() {
    let fixtures = TempDir::new().unwrap();
    write_script(fixtures.path(), "test_binary", "exit 0");

    let with_dir = UnixEnvironment::with_search_paths(vec![
        PathBuf::from("/foo/bar"),
        PathBuf::from("/baz/bat"),
        fixtures.path().to_path_buf(),
    ]);
    assert!(with_dir.validate_command("test_binary", None));

    let without_dir = UnixEnvironment::with_search_paths(vec![PathBuf::from("/foo/bar")]);
    assert!(!without_dir.validate_command("test_binary", None));

    let err = CommandBuilder::with_environment(Arc::new(without_dir))
        .binary("test_binary")
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ShellError::CommandValidation(_)));
}

#[test]
fn test_long_sleep_is_killed_after_stop_timeout() {
    let fixtures = TempDir::new().unwrap();
    let script = write_script(fixtures.path(), "long_sleep_binary", "trap '' TERM\nsleep 5");

    let log = Arc::new(SignalLog::default());
    let config = ProcessConfig {
        working_directory: Some(fixtures.path().to_path_buf()),
        timeout: Some(Duration::from_millis(500)),
        observer: log.clone(),
        ..ProcessConfig::default()
    };
    let mut process = RunningProcess::spawn(
        Arc::new(UnixEnvironment::new()),
        format!("exec {}", script.display()),
        config,
    )
    .unwrap();
    thread::sleep(Duration::from_millis(200));

    let poll = process.poll_interval();
    let timeout = Duration::from_micros(500_000);
    let started = Instant::now();
    process.stop(timeout).unwrap();
    let took = started.elapsed();

    assert!(!process.is_running().unwrap());
    assert!(took >= timeout);
    // one poll interval of overshoot, plus scheduling slack for the reap
    assert!(took < timeout + poll + Duration::from_millis(500));
    assert_eq!(
        *log.signals.lock().unwrap(),
        vec![ProcessSignal::Term, ProcessSignal::Kill]
    );
}

#[test]
fn test_running_processes_are_independent() {
    let env: Arc<dyn Environment> = Arc::new(UnixEnvironment::new());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let env = env.clone();
            thread::spawn(move || {
                let mut process = RunningProcess::spawn(
                    env,
                    format!("echo worker-{}; exit {}", i, i),
                    ProcessConfig::default(),
                )
                .unwrap();
                process.wait().unwrap();
                (process.exit_code().unwrap(), process.stdout().to_vec())
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let (code, stdout) = handle.join().unwrap();
        assert_eq!(code, i as i32);
        assert_eq!(stdout, format!("worker-{}\n", i).into_bytes());
    }
}
