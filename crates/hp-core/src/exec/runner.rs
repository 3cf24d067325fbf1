use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// PATH handed to every child; the parent's environment is never inherited.
pub const CONTROLLED_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Lines of streamed output retained for error reporting.
const STREAM_TAIL_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },
    #[error("{program} failed ({status}): {output}")]
    Failed {
        program: String,
        status: String,
        output: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single external program invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }


    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Inject the identity variables tools such as composer, npm and nvm expect.
    pub fn for_user(self, username: &str, home: &str) -> Self {
        self.env("HOME", home)
            .env("USER", username)
            .env("NVM_DIR", format!("{}/.nvm", home))
    }

    /// Keep package managers from prompting.
    pub fn noninteractive(self) -> Self {
        self.env("DEBIAN_FRONTEND", "noninteractive")
    }

    /// Printable argv. Secrets belong on stdin, never in `args`.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    pub(crate) fn base_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("PATH".to_string(), CONTROLLED_PATH.to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        env.extend(self.env.iter().cloned());
        env
    }
}

/// Exit status plus everything the program printed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// `None` when the child was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, trimmed, for operator-facing messages.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }

    pub fn status_label(&self) -> String {
        match self.status {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }

    /// Turn a non-zero exit into `RunnerError::Failed` carrying the output.
    pub fn into_result(self, spec: &CommandSpec) -> Result<Self, RunnerError> {
        if self.success() {
            Ok(self)
        } else {
            Err(RunnerError::Failed {
                program: spec.display(),
                status: self.status_label(),
                output: self.combined(),
            })
        }
    }

    fn simulated() -> Self {
        Self {
            status: Some(0),
            ..Default::default()
        }
    }

    fn simulated_failure(command: &str) -> Self {
        Self {
            status: Some(1),
            stderr: format!("simulated failure: {}", command),
            ..Default::default()
        }
    }
}

/// Uniform execution of external binaries.
///
/// Arguments are always passed as discrete argv entries; no shell is ever
/// involved. In simulate mode nothing is executed: the invocation is logged,
/// recorded in the journal, and reported as successful.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    simulate: bool,
    default_timeout: Duration,
    journal: Arc<Mutex<Vec<String>>>,
    /// Simulated invocations starting with one of these exit non-zero.
    failing: Arc<Mutex<Vec<String>>>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl CommandRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            simulate: false,
            default_timeout,
            journal: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn simulated() -> Self {
        Self {
            simulate: true,
            ..Self::default()
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.simulate
    }

    /// Every invocation skipped in simulate mode, oldest first.
    pub fn journal(&self) -> Vec<String> {
        self.journal
            .lock()
            .map(|j| j.clone())
            .unwrap_or_default()
    }

    /// Make later simulated invocations whose command line starts with
    /// `prefix` exit with status 1. Shared by every clone of this runner.
    pub fn fail_commands_starting_with(&self, prefix: impl Into<String>) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(prefix.into());
        }
    }

    /// Journal the invocation and produce its simulated outcome.
    pub(crate) fn record(&self, spec: &CommandSpec) -> CommandOutput {
        let line = spec.display();
        info!(command = %line, "simulate: not executing");
        let fails = self
            .failing
            .lock()
            .map(|f| f.iter().any(|prefix| line.starts_with(prefix.as_str())))
            .unwrap_or(false);
        let output = if fails {
            CommandOutput::simulated_failure(&line)
        } else {
            CommandOutput::simulated()
        };
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(line);
        }
        output
    }

    /// Run to completion and capture output. Non-zero exits are returned as
    /// data, not errors; only spawn failures and timeouts fail.
    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        if self.simulate {
            return Ok(self.record(spec));
        }

        debug!(command = %spec.display(), "Running command");

        let mut cmd = build_command(spec);
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Feeding stdin counts against the timeout too: a child that never
        // drains its input must not stall the caller.
        let stdin = child.stdin.take();
        let input = spec.stdin.clone();
        let exchange = async move {
            if let (Some(input), Some(mut stdin)) = (input, stdin) {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let limit = spec.timeout.unwrap_or(self.default_timeout);
        let output = match tokio::time::timeout(limit, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(command = %spec.display(), "Command timed out, killed");
                return Err(RunnerError::Timeout {
                    program: spec.program.clone(),
                    seconds: limit.as_secs(),
                });
            }
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and fail on non-zero exit, with the captured output in the error.
    pub async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        self.run(spec).await?.into_result(spec)
    }

    /// Run while handing each stdout/stderr line to `on_line` as it arrives.
    ///
    /// No timeout applies unless the spec sets one. The returned output holds
    /// the exit status and the last lines seen, so failures stay diagnosable.
    pub async fn run_streaming<F>(
        &self,
        spec: &CommandSpec,
        mut on_line: F,
    ) -> Result<CommandOutput, RunnerError>
    where
        F: FnMut(String) + Send,
    {
        if self.simulate {
            on_line(format!("[simulate] {}", spec.display()));
            return Ok(self.record(spec));
        }

        debug!(command = %spec.display(), "Running streamed command");

        let mut cmd = build_command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STREAM_TAIL_LINES);

        let drive = async {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines())
                .merge(LinesStream::new(BufReader::new(stderr).lines()));

            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        if tail.len() == STREAM_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                        on_line(line);
                    }
                    Err(e) => {
                        warn!(error = %e, "Stopped reading command output");
                        break;
                    }
                }
            }
            child.wait().await
        };

        let status = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, drive).await {
                Ok(status) => status?,
                Err(_) => {
                    return Err(RunnerError::Timeout {
                        program: spec.program.clone(),
                        seconds: limit.as_secs(),
                    })
                }
            },
            None => drive.await?,
        };

        Ok(CommandOutput {
            status: status.code(),
            stdout: tail.into_iter().collect::<Vec<_>>().join("\n"),
            stderr: String::new(),
        })
    }
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env_clear()
        .envs(spec.base_env())
        .kill_on_drop(true);
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }
    cmd
}
