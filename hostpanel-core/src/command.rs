//! The single choke point through which every external process runs.
//!
//! Managers never spawn processes themselves; they build a [`CommandSpec`] and
//! hand it to a [`CommandExecutor`]. Secrets travel on stdin only, so they never
//! show up in argv or in a process listing.

// Standard library
use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

// External crates
use duct::cmd;
use tracing::{debug, warn};

use crate::error::{HostError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A fully described external command invocation.
#[derive(Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            cwd: None,
            env: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
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

    /// Bytes written to the child's stdin. Never logged.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// The command line as it would appear in a process listing.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .field("cwd", &self.cwd)
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Converts a non-zero exit into [`HostError::CommandFailed`].
    pub fn ensure_success(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HostError::CommandFailed {
                command: spec.command_line(),
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs external commands. Implementations must be shareable across the
/// worker threads that reconcile different sites in parallel.
pub trait CommandExecutor: Send + Sync {
    /// Run the command to completion or until its timeout elapses.
    ///
    /// A non-zero exit is not an error at this level; callers decide. A timeout
    /// kills the child and yields [`HostError::Timeout`].
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run the command and treat a non-zero exit as [`HostError::CommandFailed`].
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.run(spec)?.ensure_success(spec)
    }
}

/// Executor that spawns real processes through `duct`.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for SystemExecutor {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let full_command = spec.command_line();
        debug!(command = %full_command, timeout_secs = spec.timeout.as_secs(), "running command");

        let mut expression = cmd(&spec.program, &spec.args)
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        expression = match &spec.stdin {
            Some(input) => expression.stdin_bytes(input.clone()),
            None => expression.stdin_null(),
        };
        if let Some(dir) = &spec.cwd {
            expression = expression.dir(dir);
        }
        for (key, value) in &spec.env {
            expression = expression.env(key, value);
        }

        let handle = expression.start().map_err(|e| HostError::CommandFailed {
            command: full_command.clone(),
            code: None,
            stderr: format!("failed to start: {}", e),
        })?;

        let start = Instant::now();
        loop {
            if start.elapsed() >= spec.timeout {
                if let Err(e) = handle.kill() {
                    warn!(command = %full_command, "failed to kill timed out command: {}", e);
                }
                return Err(HostError::Timeout {
                    command: full_command,
                    secs: spec.timeout.as_secs(),
                });
            }

            match handle.try_wait() {
                Ok(Some(output)) => {
                    return Ok(CommandOutput {
                        exit_code: output.status.code(),
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(HostError::CommandFailed {
                        command: full_command,
                        code: None,
                        stderr: format!("error waiting for command: {}", e),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_excludes_stdin() {
        let spec = CommandSpec::new("mysql")
            .arg("--defaults-extra-file=/tmp/x.cnf")
            .stdin("CREATE USER 'a' IDENTIFIED BY 'hunter2';");
        assert_eq!(spec.command_line(), "mysql --defaults-extra-file=/tmp/x.cnf");
        let debug = format!("{:?}", spec);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_ensure_success_maps_exit_code() {
        let spec = CommandSpec::new("nginx").arg("-t");
        let output = CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "unexpected \"}\"\n".to_string(),
        };
        match output.ensure_success(&spec) {
            Err(HostError::CommandFailed { command, code, stderr }) => {
                assert_eq!(command, "nginx -t");
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "unexpected \"}\"");
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_captures_output_and_stdin() {
        let spec = CommandSpec::new("cat").stdin("hello");
        let output = SystemExecutor::new().run(&spec).expect("cat should run");
        assert!(output.success());
        assert_eq!(output.stdout, "hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_kills_on_timeout() {
        let spec = CommandSpec::new("sleep").arg("5").timeout_secs(1);
        let err = SystemExecutor::new().run(&spec).unwrap_err();
        assert!(matches!(err, HostError::Timeout { secs: 1, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_reports_nonzero_exit() {
        let spec = CommandSpec::new("false");
        let output = SystemExecutor::new().run(&spec).expect("false should run");
        assert!(!output.success());
        assert!(SystemExecutor::new().run_checked(&spec).is_err());
    }
}
