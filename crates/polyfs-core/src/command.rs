//! Helper-process collaborator.
//!
//! Backends that shell out (the registry backend drives `skopeo`) go through
//! [`CommandRunner`] so tests can script the helper's replies.

use std::fmt;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{FsError, FsResult};

/// A helper invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    /// Program and the first argument only; later arguments may hold secrets.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.args.first() {
            Some(verb) => write!(f, "{} {verb}", self.program),
            None => f.write_str(&self.program),
        }
    }
}

/// What a finished helper left behind.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Run to completion. Only a failure to spawn is an error; a non-zero
    /// exit is reported through [`CommandOutput::status`].
    async fn run(&self, command: &CommandSpec) -> FsResult<CommandOutput>;
}

/// Runs helpers as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandSpec) -> FsResult<CommandOutput> {
        debug!(command = %command, "spawning helper");
        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FsError::backend(format!("failed to run {command}: {e}")))?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
