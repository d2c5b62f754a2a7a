//! External process invocation with timeouts.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

/// Errors from launching or waiting on an external tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: PathBuf, timeout: Duration },

    #[error("I/O error while waiting for {program}: {source}")]
    Io {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout { .. })
    }
}

/// A single command line to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub timeout: Duration,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    /// Space-joined command line for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Exit status and captured output of a finished tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    /// Tail of stderr, bounded by the runner
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs external tools. Implementations must not block the async runtime.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs the invocation to completion.
    ///
    /// A non-zero exit is not an error at this level; callers inspect
    /// [`ToolOutput::status`].
    ///
    /// # Errors
    /// - `ToolError::Spawn` - Program missing or not executable
    /// - `ToolError::Timeout` - Invocation exceeded its timeout; the process was killed
    /// - `ToolError::Io` - Output could not be collected
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError>;
}

/// Production runner spawning real processes with `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessToolRunner {
    max_stderr_bytes: usize,
}

impl ProcessToolRunner {
    pub fn new(max_stderr_bytes: usize) -> Self {
        Self { max_stderr_bytes }
    }
}

impl Default for ProcessToolRunner {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        tracing::debug!("Running {}", invocation.command_line());

        let child = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it
        let output = tokio::time::timeout(invocation.timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::Timeout {
                program: invocation.program.clone(),
                timeout: invocation.timeout,
            })?
            .map_err(|source| ToolError::Io {
                program: invocation.program.clone(),
                source,
            })?;

        let result = ToolOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: stderr_tail(&output.stderr, self.max_stderr_bytes),
        };

        if !result.success() {
            tracing::debug!(
                "{} exited with {:?}: {}",
                invocation.program.display(),
                result.status,
                result.stderr
            );
        }
        Ok(result)
    }
}

/// Keeps the last `max_bytes` of stderr as text.
pub fn stderr_tail(stderr: &[u8], max_bytes: usize) -> String {
    let start = stderr.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let invocation = ToolInvocation::new("ffprobe", Duration::from_secs(1))
            .arg("-hide_banner")
            .args(["-show_streams", "in.mkv"]);

        assert_eq!(invocation.command_line(), "ffprobe -hide_banner -show_streams in.mkv");
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let stderr = b"first line\nsecond line\nlast line\n";
        assert_eq!(stderr_tail(stderr, 10), "last line");
        assert_eq!(stderr_tail(stderr, 1024), "first line\nsecond line\nlast line");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = ProcessToolRunner::default();
        let invocation =
            ToolInvocation::new("/nonexistent/tributary-tool", Duration::from_secs(1));

        let result = runner.run(&invocation).await;
        assert!(matches!(result, Err(ToolError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_and_output() {
        let runner = ProcessToolRunner::default();
        let invocation = ToolInvocation::new("sh", Duration::from_secs(5))
            .args(["-c", "echo out; echo err >&2; exit 3"]);

        let output = runner.run(&invocation).await.unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, "err");
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let runner = ProcessToolRunner::default();
        let invocation =
            ToolInvocation::new("sleep", Duration::from_millis(100)).arg("5");

        let started = std::time::Instant::now();
        let result = runner.run(&invocation).await;

        assert!(matches!(result, Err(ToolError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
