#![cfg(target_os = "linux")]

use std::path::Path;
use std::time::Duration;

use executor::{CommandRunner, ShellSpec, SupervisedExecutor};

/// A pid counts as gone once /proc no longer lists it or it is a zombie
/// waiting for its (re)parent to reap it.
fn process_gone(pid: &str) -> bool {
    let stat = Path::new("/proc").join(pid).join("stat");
    match std::fs::read_to_string(stat) {
        Err(_) => true,
        Ok(contents) => contents
            .rsplit(')')
            .next()
            .map(|rest| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

async fn read_pid(path: &Path) -> String {
    std::fs::read_to_string(path)
        .expect("pid file written before timeout")
        .trim()
        .to_string()
}

#[tokio::test]
async fn test_shell_is_gone_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("shell.pid");
    let executor =
        SupervisedExecutor::new(ShellSpec::sh()).with_poll_interval(Duration::from_millis(20));

    let script = format!("echo $$ > {}; sleep 30", pid_file.display());
    let report = executor.run(&script, 1).await;

    assert!(report.metrics.timed_out);
    assert!(!report.success);
    let pid = read_pid(&pid_file).await;
    assert!(process_gone(&pid), "shell {pid} still running");
}

#[tokio::test]
async fn test_background_children_are_killed_with_the_group() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");
    let executor =
        SupervisedExecutor::new(ShellSpec::sh()).with_poll_interval(Duration::from_millis(20));

    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
    let report = executor.run(&script, 1).await;

    assert!(report.metrics.timed_out);
    // Give the kernel a moment to deliver the group signal.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let pid = read_pid(&pid_file).await;
    assert!(process_gone(&pid), "background child {pid} survived the timeout");
}
