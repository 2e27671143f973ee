//! External tool adapter
//!
//! Every imaging operation (conversion, resampling, skull stripping,
//! registration, voxel arithmetic) runs as an external program. Stages
//! describe the invocation as a [`ToolCommand`] and hand it to a
//! [`ToolRunner`], which reports the exit status and captured streams.
//!
//! # Invocation modes
//! - Blocking: `runner.run(&cmd).await` waits for completion.
//! - Fan-out: [`run_async`] spawns the invocation on the runtime and returns
//!   a [`ToolHandle`]; [`join_all`] waits for a whole batch. Handles are
//!   joined before the launching stage returns, so no invocation outlives
//!   its stage.
//!
//! A non-zero exit code is a value, not an error: callers decide whether the
//! failure is fatal for the stage ([`ToolOutput::check`]) or only worth a
//! warning.

use crate::error::StageError;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

/// Tool adapter errors
#[derive(Debug, Error)]
pub enum ToolError {
    /// Program could not be started (not installed, not executable, ...)
    #[error("Failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Spawned invocation panicked or was cancelled
    #[error("Tool task for `{command}` did not complete: {message}")]
    Join { command: String, message: String },
}

/// One external program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().to_string())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value following `flag` in the argument list
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Completed invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub command: ToolCommand,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`StageError::ToolFailed`]
    pub fn check(self) -> Result<ToolOutput, StageError> {
        if self.success() {
            Ok(self)
        } else {
            Err(StageError::ToolFailed {
                command: self.command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Executes external programs
///
/// Stages only depend on this trait; tests substitute an in-process fake.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError>;

    /// Run and require a zero exit code
    async fn run_checked(&self, command: &ToolCommand) -> Result<ToolOutput, StageError> {
        self.run(command).await?.check()
    }
}

/// Runs programs as child processes of this process
#[derive(Debug, Clone, Default)]
pub struct SystemToolRunner;

#[async_trait]
impl ToolRunner for SystemToolRunner {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
        debug!(command = %command, "Running external tool");

        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ToolError::Launch {
                command: command.to_string(),
                source: e,
            })?;

        // Killed by a signal: no exit code
        let exit_code = output.status.code().unwrap_or(-1);

        debug!(command = %command.program, exit_code, "External tool finished");

        Ok(ToolOutput {
            command: command.clone(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Handle to an invocation started with [`run_async`]
pub struct ToolHandle {
    command: ToolCommand,
    handle: JoinHandle<Result<ToolOutput, ToolError>>,
}

impl ToolHandle {
    pub fn command(&self) -> &ToolCommand {
        &self.command
    }

    /// Wait for the invocation to finish
    pub async fn join(self) -> Result<ToolOutput, ToolError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ToolError::Join {
                command: self.command.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// Start `command` without waiting for it
pub fn run_async(runner: Arc<dyn ToolRunner>, command: ToolCommand) -> ToolHandle {
    let spawned = command.clone();
    let handle = tokio::spawn(async move { runner.run(&spawned).await });
    ToolHandle { command, handle }
}

/// Wait for every handle, in launch order
pub async fn join_all(handles: Vec<ToolHandle>) -> Vec<Result<ToolOutput, ToolError>> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.join().await);
    }
    results
}
