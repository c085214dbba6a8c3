//! Subprocess capability.
//!
//! Gate steps and agent launches go through [`CommandRunner`] so the engines
//! never spawn processes directly; tests substitute a table-driven fake.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Set when the process could not be spawned or timed out; the command
    /// itself produced no meaningful exit code.
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == 0
    }
}

/// Request handed to a runner.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, request: &CommandRequest) -> CommandOutcome;
}

pub type SharedRunner = Arc<dyn CommandRunner>;

/// Production runner: spawn, poll for exit, kill on deadline.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    fn run_with_timeout(
        program: &str,
        args: &[String],
        working_dir: &Path,
        timeout: Option<Duration>,
    ) -> CommandOutcome {
        let start = Instant::now();
        let mut command = Command::new(program);
        command.args(args).current_dir(working_dir);

        let Some(deadline) = timeout else {
            return match command.output() {
                Ok(output) => CommandOutcome {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: None,
                },
                Err(e) => CommandOutcome {
                    exit_code: -1,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some(format!("failed to execute {program}: {e}")),
                    ..Default::default()
                },
            };
        };

        let mut child = match command.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutcome {
                    exit_code: -1,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some(format!("failed to spawn {program}: {e}")),
                    ..Default::default()
                };
            }
        };

        let stop_at = Instant::now() + deadline;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let (stdout, stderr) = drain(&mut child);
                    return CommandOutcome {
                        exit_code: status.code().unwrap_or(-1),
                        stdout,
                        stderr,
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: None,
                    };
                }
                Ok(None) => {
                    if Instant::now() >= stop_at {
                        let _ = child.kill();
                        let _ = child.wait();
                        let (stdout, stderr) = drain(&mut child);
                        return CommandOutcome {
                            exit_code: -1,
                            stdout,
                            stderr,
                            duration_ms: start.elapsed().as_millis() as u64,
                            error: Some(format!(
                                "command timed out after {}",
                                humantime::format_duration(deadline)
                            )),
                        };
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return CommandOutcome {
                        exit_code: -1,
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: Some(format!("failed to poll {program}: {e}")),
                        ..Default::default()
                    };
                }
            }
        }
    }
}

fn drain(child: &mut std::process::Child) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

impl CommandRunner for ProcessRunner {
    fn run(&self, request: &CommandRequest) -> CommandOutcome {
        Self::run_with_timeout(
            &request.command,
            &request.args,
            &request.working_dir,
            request.timeout,
        )
    }
}

/// Table-driven fake for tests: outcomes keyed by command name, with a
/// recorded call log.
#[derive(Debug, Default)]
pub struct FakeRunner {
    outcomes: std::sync::Mutex<std::collections::BTreeMap<String, CommandOutcome>>,
    calls: std::sync::Mutex<Vec<CommandRequest>>,
    fallback: CommandOutcome,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            fallback: CommandOutcome {
                exit_code: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn stub(&self, command: &str, outcome: CommandOutcome) {
        self.outcomes
            .lock()
            .expect("outcomes poisoned")
            .insert(command.to_string(), outcome);
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        self.calls.lock().expect("calls poisoned").clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, request: &CommandRequest) -> CommandOutcome {
        self.calls
            .lock()
            .expect("calls poisoned")
            .push(request.clone());
        self.outcomes
            .lock()
            .expect("outcomes poisoned")
            .get(&request.command)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
