use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::env::Environment;
use crate::error::{Error, Result};

/// Which pipe a line of subprocess output arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A single line of subprocess output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Receiving end of a live log; every drained line is mirrored here as it arrives.
pub type LiveLog = mpsc::UnboundedSender<OutputLine>;

/// Program, arguments, working directory and environment of one subprocess.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// When set, the child sees exactly this environment.
    pub env: Option<Environment>,
    /// Bytes written to the child's stdin before it is closed.
    pub stdin: Option<String>,
}

impl CommandSpec {
    /// Creates a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: None,
            stdin: None,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Runs with exactly `env` instead of the inherited environment.
    pub fn env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    /// Writes `input` to the child's stdin, then closes it.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Shell-like rendering of the command line, for logs and summaries.
    pub fn display(&self) -> String {
        format_command(&self.program, &self.args)
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Returns `stdout` + `stderr` joined with a newline when needed.
    pub fn combined(&self) -> String {
        let mut s = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !s.is_empty() && !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&self.stderr);
        }
        s
    }

    /// Converts a non-zero exit into [`Error::SubprocessFailed`].
    pub fn check(self, program: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::SubprocessFailed {
                program: program.to_string(),
                code: self.status,
                stderr: self.stderr,
            })
        }
    }
}

/// Runs a command to completion, capturing its output and mirroring each
/// line to `live` as it is drained.
pub async fn run(
    spec: &CommandSpec,
    live: Option<&LiveLog>,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    let mut stdout = String::new();
    let mut stderr = String::new();

    let status = run_streaming(spec, cancel, |line| {
        let target = match line.stream {
            Stream::Stdout => &mut stdout,
            Stream::Stderr => &mut stderr,
        };
        target.push_str(&line.text);
        target.push('\n');
        if let Some(tx) = live {
            let _ = tx.send(line);
        }
    })
    .await?;

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}

/// Spawns a command and hands every output line to `on_line` in arrival order.
///
/// Both pipes are drained inside this future; nothing is spawned in the
/// background. Returns the exit code once the process has exited. Cancelling
/// `cancel` terminates the child (its process group on Unix).
pub async fn run_streaming<F>(
    spec: &CommandSpec,
    cancel: &CancellationToken,
    mut on_line: F,
) -> Result<Option<i32>>
where
    F: FnMut(OutputLine),
{
    debug!(
        command = %spec.display(),
        cwd = ?spec.cwd,
        "spawning subprocess"
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    if let Some(ref cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(ref env) = spec.env {
        cmd.env_clear();
        cmd.envs(env.iter());
    }
    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ToolMissing(spec.program.clone())
        } else {
            Error::Io(e)
        }
    })?;

    if let Some(ref input) = spec.stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        use tokio::io::AsyncWriteExt;
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::ParseFailure("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::ParseFailure("failed to capture stderr".to_string()))?;

    let mut out_reader = BufReader::new(stdout);
    let mut err_reader = BufReader::new(stderr);
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut out_done = false;
    let mut err_done = false;

    while !(out_done && err_done) {
        tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(Error::Cancelled(spec.program.clone()));
            }
            line = next_line(&mut out_reader, &mut out_buf), if !out_done => match line {
                Ok(Some(text)) => on_line(OutputLine { stream: Stream::Stdout, text }),
                _ => out_done = true,
            },
            line = next_line(&mut err_reader, &mut err_buf), if !err_done => match line {
                Ok(Some(text)) => on_line(OutputLine { stream: Stream::Stderr, text }),
                _ => err_done = true,
            },
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            return Err(Error::Cancelled(spec.program.clone()));
        }
    };

    debug!(command = %spec.program, code = ?status.code(), "subprocess exited");
    Ok(status.code())
}

// `read_until` appends partial reads to `buf`, so the buffer is only cleared
// once a full line has been taken out of it.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 && buf.is_empty() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(buf)
        .trim_end_matches(['\n', '\r'])
        .to_string();
    buf.clear();
    Ok(Some(text))
}

/// Sends SIGTERM to the child's process group, then force-kills after 2 seconds.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let pgid = format!("-{}", pid);
        let _ = Command::new("kill").args(["-TERM", &pgid]).output().await;
    }

    tokio::select! {
        _ = child.wait() => {}
        _ = tokio::time::sleep(Duration::from_secs(2)) => {
            let _ = child.kill().await;
        }
    }
}

/// Renders a command line, quoting arguments that contain whitespace or quotes.
pub fn format_command(program: &str, args: &[String]) -> String {
    let mut out = quote_arg(program);
    for arg in args {
        out.push(' ');
        out.push_str(&quote_arg(arg));
    }
    out
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}
