//! Agent process launching
//!
//! The agent runs as a child process speaking the protocol as
//! newline-delimited JSON on stdin/stdout. Stderr is inherited so the
//! agent's diagnostics land next to ours.
//!
//! The child is wrapped in [`AgentProcess`], a scope guard: whoever owns it
//! owns the process, and dropping it kills the process. The channel holds
//! the guard, so the process cannot outlive the connection whether it ends
//! by `disconnect`, a failed handshake, or the client being dropped.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

use super::{AgentStreams, Launcher};

/// Owns a running agent process; kills it on drop
#[derive(Debug)]
pub struct AgentProcess {
    child: Child,
    command: String,
}

impl AgentProcess {
    pub fn new(child: Child, command: impl Into<String>) -> Self {
        Self {
            child,
            command: command.into(),
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check if the process is still alive
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!("Agent '{}' exited with status: {}", self.command, status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::error!("Error checking agent '{}' status: {}", self.command, e);
                false
            }
        }
    }

    /// Kill and reap the process
    pub async fn kill(&mut self) {
        if !self.is_alive() {
            return;
        }
        tracing::debug!("Killing agent '{}' (pid {:?})", self.command, self.child.id());
        if let Err(e) = self.child.kill().await {
            tracing::error!("Failed to kill agent '{}': {}", self.command, e);
        }
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // InvalidInput means the child was already reaped
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill agent '{}' on drop: {}", self.command, e);
            }
        }
    }
}

/// Spawns the configured agent command
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, config: &ClientConfig) -> Result<AgentStreams> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .current_dir(&config.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ClientError::Connection(format!("Agent command not found: {}", config.command))
                } else {
                    ClientError::Connection(format!(
                        "Failed to spawn agent '{}': {}",
                        config.command, e
                    ))
                }
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ClientError::Connection("Failed to capture agent process stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ClientError::Connection("Failed to capture agent process stdout".to_string())
        })?;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(ClientError::Connection(format!(
                "Agent '{}' exited immediately with status: {}",
                config.command, status
            )));
        }

        tracing::info!(
            "Spawned agent '{}' with PID {:?} in {}",
            config.command,
            child.id(),
            config.cwd.display()
        );

        Ok(AgentStreams {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Some(AgentProcess::new(child, config.command.clone())),
        })
    }
}
