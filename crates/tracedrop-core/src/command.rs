//! External command execution.
//!
//! Every interaction with tools outside this crate (`rr`, `aws`, `gcloud`)
//! goes through a [`CommandSpec`] handed to a [`CommandRunner`]. It is
//! plain data so it can be persisted in a deferred-upload descriptor and
//! replayed later by a different principal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use thiserror::Error;

/// A command line plus the environment it needs on top of the inherited one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Space-joined command line for logs. Environment values are never shown.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command line")]
    Empty,

    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    /// Turn a non-zero exit into an error, passing successful output through.
    pub fn check(spec: &CommandSpec, output: CommandOutput) -> Result<CommandOutput, Self> {
        if output.success() {
            Ok(output)
        } else {
            Err(Self::Failed {
                command: spec.display(),
                code: output.code,
                stderr: output.stderr_lossy().trim().to_string(),
            })
        }
    }
}

/// Capability to run external commands. Tests substitute a recording fake.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    echo: bool,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every command line at `info` before it runs.
    pub fn echo_commands(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let program = spec.program().ok_or(CommandError::Empty)?;
        if self.echo {
            tracing::info!("Running {}", spec.display());
        } else {
            tracing::debug!(command = %spec.display(), "running external command");
        }

        let output = tokio::process::Command::new(program)
            .args(&spec.argv[1..])
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
