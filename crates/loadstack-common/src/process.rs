//! External command invocation
//!
//! Every interaction with `terraform`, `aws`, `kubectl` and `docker` is an
//! [`Invocation`] handed to a [`ProcessRunner`]. The runner reports how the
//! process ended and what it printed; it never decides whether that is fatal.
//! Callers use [`ProcessOutput::check`] for the common "non-zero is an error"
//! case and inspect the output themselves when an exit code carries meaning
//! (`terraform plan -detailed-exitcode`, lock contention, missing repository).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Time between SIGTERM and SIGKILL when a process group is interrupted
const KILL_GRACE: Duration = Duration::from_secs(10);

/// How long output pipes may stay open after the child has exited
const OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// Number of trailing output lines carried into error messages
const ERROR_TAIL_LINES: usize = 20;

/// A single external command to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    stdin: Option<String>,
    deadline: Option<Duration>,
    stream: bool,
    sensitive_output: bool,
}

impl Invocation {
    /// Start building an invocation of `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run the child in `dir`
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Feed `payload` to the child's stdin. The payload is never logged.
    pub fn stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    /// Terminate the child if it runs longer than `deadline`
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set or clear the deadline
    pub fn maybe_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Log each output line at info level as it arrives
    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Never log the child's output (it carries a credential)
    pub fn sensitive_output(mut self) -> Self {
        self.sensitive_output = true;
        self
    }

    /// Program name
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, in order
    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    /// Extra environment variables
    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Working directory, if set
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Stdin payload, if set
    pub fn stdin_payload(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// Deadline, if set
    pub fn deadline_duration(&self) -> Option<Duration> {
        self.deadline
    }

    /// Whether output is streamed to the log
    pub fn is_streamed(&self) -> bool {
        self.stream
    }

    /// Whether output must stay out of the log
    pub fn is_sensitive(&self) -> bool {
        self.sensitive_output
    }

    /// Command line for logs and error messages. Stdin is never included.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with this code
    Exited(i32),
    /// Killed by a signal it did not ask for
    Signaled,
    /// Terminated because its deadline passed
    TimedOut,
    /// Terminated because the run was cancelled
    Cancelled,
}

/// Captured result of an invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// How the process ended
    pub termination: Termination,
    /// Everything written to stdout
    pub stdout: String,
    /// Everything written to stderr
    pub stderr: String,
    /// Wall-clock run time
    pub elapsed: Duration,
}

impl ProcessOutput {
    /// Whether the process exited with code 0
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited(0)
    }

    /// Exit code, when the process exited on its own
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// Stdout followed by stderr, for pattern matching on tool messages
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// The last lines of stderr (or stdout when stderr is empty)
    pub fn error_tail(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
        lines[start..].join("\n")
    }

    /// Convert any non-success termination into a typed error.
    pub fn check(self, invocation: &Invocation) -> Result<Self> {
        match self.termination {
            Termination::Exited(0) => Ok(self),
            Termination::Exited(code) => Err(Error::Command {
                command: invocation.display(),
                exit_code: Some(code),
                message: self.error_tail(),
            }),
            Termination::Signaled => Err(Error::Command {
                command: invocation.display(),
                exit_code: None,
                message: "terminated by signal".to_string(),
            }),
            Termination::TimedOut => Err(Error::CommandTimedOut {
                command: invocation.display(),
                deadline: invocation.deadline.unwrap_or_default(),
            }),
            Termination::Cancelled => Err(Error::cancelled(invocation.display())),
        }
    }
}

/// Runs external commands.
///
/// Implementations return `Err` only when the command could not be run at
/// all; every way a started process can end is a [`Termination`].
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `invocation` to completion, deadline or cancellation
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput>;
}

/// [`ProcessRunner`] backed by real child processes.
///
/// Each child gets its own process group so an interrupt reaches the
/// helpers it spawns (terraform providers, docker credential helpers).
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create a runner
    pub fn new() -> Self {
        Self
    }
}

enum Interrupt {
    Deadline,
    Cancel,
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }

        debug!(command = %invocation.display(), "Running command");
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        if let (Some(payload), Some(mut stdin)) = (invocation.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!(error = %e, "Failed to write child stdin");
                }
            });
        }

        let log_mode = LogMode::for_invocation(invocation);
        let stop_draining = CancellationToken::new();
        let stdout_task = child.stdout.take().map(|out| {
            tokio::spawn(drain(out, invocation.program.clone(), log_mode, stop_draining.clone()))
        });
        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(drain(err, invocation.program.clone(), log_mode, stop_draining.clone()))
        });

        let deadline = async {
            match invocation.deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let waited = tokio::select! {
            status = child.wait() => Ok(status?),
            _ = deadline => Err(Interrupt::Deadline),
            _ = cancel.cancelled() => Err(Interrupt::Cancel),
        };

        let termination = match waited {
            Ok(status) => match status.code() {
                Some(code) => Termination::Exited(code),
                None => Termination::Signaled,
            },
            Err(interrupt) => {
                let termination = match interrupt {
                    Interrupt::Deadline => {
                        warn!(
                            command = %invocation.display(),
                            deadline = ?invocation.deadline,
                            "Command exceeded its deadline, terminating"
                        );
                        Termination::TimedOut
                    }
                    Interrupt::Cancel => {
                        info!(command = %invocation.display(), "Cancelling command");
                        Termination::Cancelled
                    }
                };
                terminate_group(&mut child).await;
                termination
            }
        };

        // A descendant that outlives the child can hold the pipes open.
        let drain_bound = {
            let stop = stop_draining.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(OUTPUT_GRACE) => {}
                    _ = cancel.cancelled() => {}
                }
                stop.cancel();
            })
        };
        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        drain_bound.abort();
        let elapsed = start.elapsed();

        debug!(
            command = %invocation.display(),
            termination = ?termination,
            elapsed_ms = elapsed.as_millis() as u64,
            "Command finished"
        );

        Ok(ProcessOutput {
            termination,
            stdout,
            stderr,
            elapsed,
        })
    }
}

#[derive(Clone, Copy)]
enum LogMode {
    Info,
    Debug,
    Silent,
}

impl LogMode {
    fn for_invocation(invocation: &Invocation) -> Self {
        if invocation.sensitive_output {
            LogMode::Silent
        } else if invocation.stream {
            LogMode::Info
        } else {
            LogMode::Debug
        }
    }
}

async fn drain<R>(reader: R, program: String, mode: LogMode, stop: CancellationToken) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut buffer = String::new();
    loop {
        let next = tokio::select! {
            line = lines.next_line() => line,
            _ = stop.cancelled() => {
                debug!(tool = %program, "Output still open after exit, no longer reading");
                break;
            }
        };
        match next {
            Ok(Some(line)) => {
                match mode {
                    LogMode::Info => info!(tool = %program, "{}", line),
                    LogMode::Debug => debug!(tool = %program, "{}", line),
                    LogMode::Silent => {}
                }
                buffer.push_str(&line);
                buffer.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                debug!(tool = %program, error = %e, "Stopped reading child output");
                break;
            }
        }
    }
    buffer
}

async fn collect(task: Option<tokio::task::JoinHandle<String>>) -> String {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// SIGTERM the child's process group, then SIGKILL it after a grace period.
async fn terminate_group(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM to process group failed");
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
        return;
    }

    warn!(pid, "Process group ignored SIGTERM, sending SIGKILL");
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        debug!(pid, error = %e, "SIGKILL to process group failed");
    }
    let _ = child.wait().await;
}
