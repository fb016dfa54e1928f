//! Terminal lifecycle management
//!
//! Tracks commands the agent runs through `terminal/create`. Each terminal
//! owns one child process whose stdout and stderr are pumped into a
//! byte-limited buffer; the exit status is published on a watch channel so
//! any number of waiters observe the same result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::error::{ClientError, Result};
use crate::protocol::{
    CreateTerminalRequest, EnvVariable, SessionId, TerminalExitStatus, TerminalOutputResponse,
};

/// How long the waiter gives the output pumps to drain after exit
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Terminal lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Registered, process not yet spawned
    Created,
    Running,
    /// Process exited on its own
    Finished,
    /// Process ended after a kill request
    Killed,
    /// Resources freed, id no longer valid
    Released,
}

#[derive(Debug, Default)]
struct OutputBuffer {
    bytes: Vec<u8>,
    truncated: bool,
}

/// One agent-created terminal
#[derive(Debug)]
pub struct TerminalSession {
    pub id: String,
    pub session_id: SessionId,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    output_byte_limit: usize,
    output: Mutex<OutputBuffer>,
    state: Mutex<TerminalState>,
    exit_rx: watch::Receiver<Option<TerminalExitStatus>>,
    force_kill: Arc<Notify>,
    pid: Option<u32>,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalSession {
    /// Append output, dropping the oldest bytes beyond the limit
    pub fn add_output(&self, data: &[u8]) {
        let mut buffer = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.bytes.extend_from_slice(data);

        let limit = self.output_byte_limit;
        if buffer.bytes.len() > limit {
            let excess = buffer.bytes.len() - limit;
            let cut = find_utf8_boundary(&buffer.bytes, excess);
            buffer.bytes.drain(0..cut);
            buffer.truncated = true;
        }
    }

    pub fn output_string(&self) -> String {
        let buffer = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer.bytes).into_owned()
    }

    pub fn is_truncated(&self) -> bool {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .truncated
    }

    pub fn buffer_size(&self) -> usize {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes
            .len()
    }

    pub fn state(&self) -> TerminalState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TerminalState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Exit status if the process has ended; never blocks
    pub fn exit_status(&self) -> Option<TerminalExitStatus> {
        self.exit_rx.borrow().clone()
    }

    /// Snapshot answered to `terminal/output`
    pub fn snapshot(&self) -> TerminalOutputResponse {
        TerminalOutputResponse {
            output: self.output_string(),
            truncated: self.is_truncated(),
            exit_status: self.exit_status(),
        }
    }

    pub async fn wait_for_exit(&self) -> Result<TerminalExitStatus> {
        let mut rx = self.exit_rx.clone();
        let status = rx
            .wait_for(|status| status.is_some())
            .await
            .map_err(|_| ClientError::InvalidHandle(self.id.clone()))?;
        status
            .clone()
            .ok_or_else(|| ClientError::Internal("exit status missing".to_string()))
    }

    /// SIGTERM, then SIGKILL once `grace` has passed
    pub async fn kill(&self, grace: Duration) -> Result<()> {
        if self.exit_status().is_some() {
            tracing::debug!("Terminal {} already exited, skipping kill", self.id);
            return Ok(());
        }
        self.set_state(TerminalState::Killed);

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            tracing::debug!("Sending SIGTERM to terminal {} (pid {})", self.id, pid);
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!("Failed to send SIGTERM to {}: {}", pid, e);
            }
            if tokio::time::timeout(grace, self.wait_for_exit()).await.is_ok() {
                return Ok(());
            }
            tracing::debug!(
                "Terminal {} ignored SIGTERM for {:?}, sending SIGKILL",
                self.id,
                grace
            );
        }
        #[cfg(not(unix))]
        let _ = grace;

        self.force_kill.notify_one();
        self.wait_for_exit().await?;
        Ok(())
    }

    /// Kill without grace and free the buffer
    async fn release(&self) {
        if self.exit_status().is_none() {
            self.force_kill.notify_one();
            let _ = tokio::time::timeout(Duration::from_secs(5), self.wait_for_exit()).await;
        }
        let waiter = self
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(waiter) = waiter {
            waiter.abort();
        }
        {
            let mut buffer = self.output.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.bytes = Vec::new();
            buffer.truncated = false;
        }
        self.set_state(TerminalState::Released);
    }
}

/// Nearest UTF-8 character boundary at or after `min_pos`
fn find_utf8_boundary(data: &[u8], min_pos: usize) -> usize {
    let mut pos = min_pos;
    while pos < data.len() {
        // continuation bytes look like 10xxxxxx
        if (data[pos] & 0b1100_0000) != 0b1000_0000 {
            return pos;
        }
        pos += 1;
    }
    data.len()
}

#[cfg(unix)]
fn signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| {
        nix::sys::signal::Signal::try_from(sig)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| format!("signal {}", sig))
    })
}

#[cfg(not(unix))]
fn signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

fn exit_status_of(status: std::process::ExitStatus) -> TerminalExitStatus {
    TerminalExitStatus {
        exit_code: status.code(),
        signal: signal_name(&status),
    }
}

/// Owns every live terminal of a client
#[derive(Debug, Clone)]
pub struct TerminalManager {
    terminals: Arc<RwLock<HashMap<String, Arc<TerminalSession>>>>,
    default_output_byte_limit: u64,
    grace_period: Duration,
}

impl Default for TerminalManager {
    fn default() -> Self {
        Self::new(1_048_576, Duration::from_secs(5))
    }
}

impl TerminalManager {
    pub fn new(default_output_byte_limit: u64, grace_period: Duration) -> Self {
        Self {
            terminals: Arc::new(RwLock::new(HashMap::new())),
            default_output_byte_limit,
            grace_period,
        }
    }

    fn generate_terminal_id() -> String {
        format!("term_{}", ulid::Ulid::new())
    }

    /// Merge requested variables over the host environment
    pub fn prepare_environment(env_vars: &[EnvVariable]) -> Result<HashMap<String, String>> {
        let mut environment: HashMap<String, String> = std::env::vars().collect();
        for var in env_vars {
            if var.name.is_empty() {
                return Err(ClientError::Protocol(crate::error::AcpError::invalid_params(
                    "Environment variable name cannot be empty",
                )));
            }
            environment.insert(var.name.clone(), var.value.clone());
        }
        Ok(environment)
    }

    /// Spawn the requested command and register it; returns the terminal id
    ///
    /// `session_cwd` is used when the request names no working directory.
    pub async fn create(&self, request: CreateTerminalRequest, session_cwd: &Path) -> Result<String> {
        let working_dir = match request.cwd {
            Some(cwd) if !cwd.is_absolute() => {
                return Err(ClientError::Protocol(crate::error::AcpError::invalid_params(
                    format!("Working directory must be absolute: {}", cwd.display()),
                )));
            }
            Some(cwd) => cwd,
            None => session_cwd.to_path_buf(),
        };
        let environment = Self::prepare_environment(&request.env)?;
        let output_byte_limit = request
            .output_byte_limit
            .unwrap_or(self.default_output_byte_limit)
            .max(1) as usize;

        let mut child = Command::new(&request.command)
            .args(&request.args)
            .current_dir(&working_dir)
            .env_clear()
            .envs(&environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClientError::Internal(format!("Failed to spawn '{}': {}", request.command, e))
            })?;

        let id = Self::generate_terminal_id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let force_kill = Arc::new(Notify::new());

        let session = Arc::new(TerminalSession {
            id: id.clone(),
            session_id: request.session_id,
            command: request.command,
            args: request.args,
            working_dir,
            output_byte_limit,
            output: Mutex::new(OutputBuffer::default()),
            state: Mutex::new(TerminalState::Created),
            exit_rx,
            force_kill: force_kill.clone(),
            pid: child.id(),
            waiter: Mutex::new(None),
        });

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, session.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, session.clone()));
        }
        session.set_state(TerminalState::Running);

        let waiter = tokio::spawn(wait_child(child, pumps, force_kill, exit_tx, session.clone()));
        *session.waiter.lock().unwrap_or_else(PoisonError::into_inner) = Some(waiter);

        tracing::info!(
            "Created terminal {} running '{}' in {}",
            id,
            session.command,
            session.working_dir.display()
        );
        self.terminals.write().await.insert(id.clone(), session);
        Ok(id)
    }

    pub async fn get(&self, terminal_id: &str) -> Result<Arc<TerminalSession>> {
        self.terminals
            .read()
            .await
            .get(terminal_id)
            .cloned()
            .ok_or_else(|| ClientError::InvalidHandle(terminal_id.to_string()))
    }

    pub async fn output(&self, terminal_id: &str) -> Result<TerminalOutputResponse> {
        let session = self.get(terminal_id).await?;
        let snapshot = session.snapshot();
        tracing::debug!(
            "Terminal {} output: {} bytes, truncated: {}",
            terminal_id,
            snapshot.output.len(),
            snapshot.truncated
        );
        Ok(snapshot)
    }

    pub async fn wait_for_exit(&self, terminal_id: &str) -> Result<TerminalExitStatus> {
        let session = self.get(terminal_id).await?;
        let status = session.wait_for_exit().await?;
        tracing::info!("Terminal {} exited with {:?}", terminal_id, status);
        Ok(status)
    }

    /// Stop the command; the terminal stays queryable until released
    pub async fn kill(&self, terminal_id: &str) -> Result<()> {
        let session = self.get(terminal_id).await?;
        session.kill(self.grace_period).await?;
        tracing::info!("Terminal {} killed", terminal_id);
        Ok(())
    }

    /// Kill if running, free resources and invalidate the id
    pub async fn release(&self, terminal_id: &str) -> Result<()> {
        let session = self
            .terminals
            .write()
            .await
            .remove(terminal_id)
            .ok_or_else(|| ClientError::InvalidHandle(terminal_id.to_string()))?;
        session.release().await;
        tracing::info!("Released terminal {}", terminal_id);
        Ok(())
    }

    pub async fn release_all(&self) {
        let sessions: Vec<Arc<TerminalSession>> =
            self.terminals.write().await.drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            tracing::info!("Releasing {} terminal(s)", sessions.len());
        }
        for session in sessions {
            session.release().await;
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        self.terminals.read().await.keys().cloned().collect()
    }
}

fn spawn_pump<R>(mut reader: R, session: Arc<TerminalSession>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => session.add_output(&chunk[..n]),
                Err(e) => {
                    tracing::debug!("Terminal {} output pipe closed: {}", session.id, e);
                    break;
                }
            }
        }
    })
}

async fn wait_child(
    mut child: Child,
    pumps: Vec<JoinHandle<()>>,
    force_kill: Arc<Notify>,
    exit_tx: watch::Sender<Option<TerminalExitStatus>>,
    session: Arc<TerminalSession>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = force_kill.notified() => {
            if let Err(e) = child.start_kill() {
                tracing::warn!("Failed to kill terminal {}: {}", session.id, e);
            }
            child.wait().await
        }
    };

    for pump in pumps {
        let _ = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await;
    }

    let status = match status {
        Ok(status) => exit_status_of(status),
        Err(e) => {
            tracing::error!("Failed to wait for terminal {}: {}", session.id, e);
            TerminalExitStatus::default()
        }
    };
    if session.state() == TerminalState::Running {
        session.set_state(TerminalState::Finished);
    }
    let _ = exit_tx.send(Some(status));
}

/// Caller-side handle to a terminal created through the client
#[derive(Debug, Clone)]
pub struct TerminalHandle {
    manager: TerminalManager,
    terminal_id: String,
}

impl TerminalHandle {
    pub fn new(manager: TerminalManager, terminal_id: String) -> Self {
        Self {
            manager,
            terminal_id,
        }
    }

    pub fn id(&self) -> &str {
        &self.terminal_id
    }

    pub async fn output(&self) -> Result<TerminalOutputResponse> {
        self.manager.output(&self.terminal_id).await
    }

    pub async fn wait_for_exit(&self) -> Result<TerminalExitStatus> {
        self.manager.wait_for_exit(&self.terminal_id).await
    }

    pub async fn kill(&self) -> Result<()> {
        self.manager.kill(&self.terminal_id).await
    }

    pub async fn release(&self) -> Result<()> {
        self.manager.release(&self.terminal_id).await
    }
}
