// src/runner.rs

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::error::FailureKind;
use crate::model::{Outcome, WorkItem};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to wait for pipe readers once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

pub trait Runner: Sync {
    fn run(&self, item: &WorkItem) -> Outcome;
}

impl<F> Runner for F
where
    F: Fn(&WorkItem) -> Outcome + Sync,
{
    fn run(&self, item: &WorkItem) -> Outcome {
        self(item)
    }
}

#[derive(Debug, Clone)]
pub struct CommandLine {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    fn render(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// Builds a command line per item and runs it with a wall-clock timeout.
pub struct CommandRunner<F> {
    build: F,
    timeout: Duration,
}

impl<F> CommandRunner<F>
where
    F: Fn(&WorkItem) -> CommandLine + Sync,
{
    pub fn new(timeout: Duration, build: F) -> Self {
        Self { build, timeout }
    }
}

impl<F> Runner for CommandRunner<F>
where
    F: Fn(&WorkItem) -> CommandLine + Sync,
{
    fn run(&self, item: &WorkItem) -> Outcome {
        let command = (self.build)(item);
        execute(item.clone(), &command, self.timeout).outcome
    }
}

pub struct Execution {
    pub outcome: Outcome,
    pub pid: Option<u32>,
}

/// Spawn `command`, wait up to `timeout`, and capture stdout and stderr.
///
/// Output on stderr is never treated as failure; only the exit status is.
/// A timed-out child is killed and reaped before returning.
pub fn execute(item: WorkItem, command: &CommandLine, timeout: Duration) -> Execution {
    let started = Instant::now();
    debug!("executing: {}", command.render());

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &command.cwd {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let detail = format!("failed to spawn {}: {e}", command.render());
            return Execution {
                outcome: Outcome::failure(item, FailureKind::Transport, detail, started.elapsed()),
                pid: None,
            };
        }
    };
    let pid = child.id();

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let waited = wait_with_deadline(&mut child, started + timeout);
    let stdout = collect(stdout);
    let stderr = collect(stderr);
    let elapsed = started.elapsed();

    let outcome = match waited {
        Ok(Some(status)) if status.success() => Outcome::success(item, stdout, stderr, elapsed),
        Ok(Some(status)) => {
            let mut outcome = Outcome::failure(
                item,
                FailureKind::NonZeroExit,
                format!("{} exited with {status}", command.render()),
                elapsed,
            );
            outcome.exit_code = status.code();
            outcome.stdout = stdout;
            outcome.stderr = stderr;
            outcome
        }
        Ok(None) => {
            warn!("{} timed out after {:.0?}, killed", command.render(), timeout);
            let mut outcome = Outcome::failure(
                item,
                FailureKind::Timeout,
                format!("exceeded {timeout:?}"),
                elapsed,
            );
            outcome.stdout = stdout;
            outcome.stderr = stderr;
            outcome
        }
        Err(e) => Outcome::failure(
            item,
            FailureKind::Transport,
            format!("failed waiting for {}: {e}", command.render()),
            elapsed,
        ),
    };

    Execution {
        outcome,
        pid: Some(pid),
    }
}

/// `Ok(None)` means the deadline passed and the child was killed.
fn wait_with_deadline(
    child: &mut Child,
    deadline: Instant,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill_process_tree(child.id());
            // kill fails only if the child already exited; wait reaps either way.
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Kill `root` and every process descended from it, leaves first.
fn kill_process_tree(root: u32) {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut tree = vec![Pid::from_u32(root)];
    let mut next = 0;
    while next < tree.len() {
        if let Some(kids) = children.get(&tree[next]) {
            tree.extend(kids.iter().copied());
        }
        next += 1;
    }

    for pid in tree.into_iter().rev() {
        if let Some(process) = sys.process(pid) {
            process.kill();
        }
    }
}

fn drain<R>(pipe: Option<R>) -> mpsc::Receiver<Vec<u8>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
    rx
}

/// Gather what the reader produced. Grandchildren may still hold the pipe
/// open after the child is gone, so stop after a short grace period.
fn collect(rx: mpsc::Receiver<Vec<u8>>) -> String {
    let mut bytes = Vec::new();
    let deadline = Instant::now() + DRAIN_GRACE;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(chunk) => bytes.extend_from_slice(&chunk),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::Status;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn stderr_output_is_not_failure() {
        let exec = execute(
            WorkItem::from("x"),
            &sh("echo progress >&2; echo done"),
            Duration::from_secs(5),
        );
        assert_eq!(exec.outcome.status, Status::Success);
        assert_eq!(exec.outcome.stdout.trim(), "done");
        assert_eq!(exec.outcome.stderr.trim(), "progress");
    }

    #[test]
    fn non_zero_exit_is_failure_with_code() {
        let exec = execute(WorkItem::from("x"), &sh("exit 3"), Duration::from_secs(5));
        assert_eq!(exec.outcome.status, Status::Failure);
        assert_eq!(exec.outcome.exit_code, Some(3));
        assert_eq!(exec.outcome.failure, Some(FailureKind::NonZeroExit));
    }

    #[test]
    fn missing_program_is_transport_failure() {
        let exec = execute(
            WorkItem::from("x"),
            &CommandLine::new("definitely-not-a-real-binary-refmine"),
            Duration::from_secs(5),
        );
        assert_eq!(exec.outcome.status, Status::Failure);
        assert_eq!(exec.outcome.failure, Some(FailureKind::Transport));
        assert!(exec.pid.is_none());
    }

    #[test]
    fn timeout_kills_and_reaps_the_child() {
        let started = Instant::now();
        let exec = execute(
            WorkItem::from("slow"),
            &CommandLine::new("sleep").arg("30"),
            Duration::from_millis(200),
        );
        assert_eq!(exec.outcome.status, Status::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = exec.pid.expect("process was spawned");
        if cfg!(target_os = "linux") {
            assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
        }
    }

    #[test]
    fn timeout_kills_forked_descendants() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("(sleep 1; touch '{}') & wait", marker.display());
        let exec = execute(WorkItem::from("forking"), &sh(&script), Duration::from_millis(300));
        assert_eq!(exec.outcome.status, Status::Timeout);

        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "a descendant outlived the timeout");
    }

    #[test]
    fn command_runner_builds_per_item() {
        let runner = CommandRunner::new(Duration::from_secs(5), |item: &WorkItem| {
            sh(&format!("echo {}", item.name()))
        });
        let outcome = runner.run(&WorkItem::from("/tmp/repos/kafka"));
        assert!(outcome.is_success());
        assert_eq!(outcome.stdout.trim(), "kafka");
    }
}
