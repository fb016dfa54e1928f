//! The agent-facing side of the client
//!
//! Everything the agent can call on us lands here, whichever transport
//! carried it: session updates become stream events, permission requests go
//! to the broker, and `fs/*` and `terminal/*` calls go to their handlers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::AcpError;
use crate::events::StreamEvent;
use crate::fs::{slice_lines, FileSystemHandler};
use crate::permission::PermissionBroker;
use crate::protocol::{
    methods, CreateTerminalRequest, CreateTerminalResponse, EmptyResponse, ReadTextFileRequest,
    ReadTextFileResponse, RequestPermissionRequest, SessionNotification, StopReason,
    TerminalRequest, WaitForTerminalExitResponse, WriteTextFileRequest,
};
use crate::session::SessionState;
use crate::terminal_manager::TerminalManager;
use crate::translator::UpdateTranslator;

/// Capacity of the push-style event broadcast
const EVENT_BROADCAST_CAPACITY: usize = 256;

pub struct HostBridge {
    state: Arc<SessionState>,
    translator: Mutex<UpdateTranslator>,
    permissions: PermissionBroker,
    fs: RwLock<Option<Arc<dyn FileSystemHandler>>>,
    terminals: TerminalManager,
    config: ClientConfig,
    turn_sink: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    turn_cancel: Mutex<CancellationToken>,
    events: broadcast::Sender<StreamEvent>,
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("permissions", &self.permissions)
            .field("has_fs_handler", &self.has_fs_handler())
            .field("terminals", &self.terminals)
            .finish()
    }
}

impl HostBridge {
    pub fn new(config: ClientConfig, state: Arc<SessionState>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let terminals = TerminalManager::new(
            config.terminal_output_byte_limit,
            config.kill_grace_period(),
        );
        Self {
            state,
            translator: Mutex::new(UpdateTranslator::new()),
            permissions: PermissionBroker::new(),
            fs: RwLock::new(None),
            terminals,
            config,
            turn_sink: Mutex::new(None),
            turn_cancel: Mutex::new(CancellationToken::new()),
            events,
        }
    }

    pub fn permissions(&self) -> &PermissionBroker {
        &self.permissions
    }

    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    pub fn set_fs_handler(&self, handler: Arc<dyn FileSystemHandler>) {
        *self.fs.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn has_fs_handler(&self) -> bool {
        self.fs_handler().is_some()
    }

    fn fs_handler(&self) -> Option<Arc<dyn FileSystemHandler>> {
        self.fs.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Route events to `sink` until [`end_turn`](Self::end_turn)
    ///
    /// Returns the token that cancels the turn's pending permission requests.
    pub fn begin_turn(&self, sink: mpsc::UnboundedSender<StreamEvent>) -> CancellationToken {
        *self.turn_sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        let token = CancellationToken::new();
        *self.turn_cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    /// Stop routing to the turn's sink
    ///
    /// Requests arriving between turns get a fresh token, so a cancelled turn
    /// does not answer them.
    pub fn end_turn(&self) {
        self.turn_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *self.turn_cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
    }

    /// Cancel the running turn's permission requests; no-op between turns
    pub fn cancel_turn(&self) {
        let sink = self.turn_sink.lock().unwrap_or_else(PoisonError::into_inner);
        if sink.is_some() {
            self.turn_token().cancel();
        }
    }

    /// Cancel every pending permission request, in a turn or not
    ///
    /// Later requests get a fresh token.
    pub fn abort_permissions(&self) {
        let mut token = self.turn_cancel.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *token, CancellationToken::new()).cancel();
    }

    fn turn_token(&self) -> CancellationToken {
        self.turn_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget tool calls tracked for the previous session
    pub fn reset(&self) {
        self.translator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    /// Event closing the turn with the agent's stop reason
    pub fn complete_turn(&self, stop_reason: StopReason) -> StreamEvent {
        self.translator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .complete(stop_reason)
    }

    /// Deliver to the active turn, if any, and to subscribers
    pub fn emit(&self, event: StreamEvent) {
        if let Some(sink) = self
            .turn_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = sink.send(event.clone());
        }
        self.publish(event);
    }

    /// Deliver to subscribers only
    pub fn publish(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// Handle a notification from the agent, in arrival order
    pub fn handle_notification(&self, method: &str, params: Value) {
        match method {
            methods::SESSION_UPDATE => {
                let notification: SessionNotification = match serde_json::from_value(params) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!("Malformed session/update: {}", e);
                        return;
                    }
                };
                if !self.state.accepts(&notification.session_id) {
                    tracing::warn!(
                        "Dropping update for unknown session {}",
                        notification.session_id
                    );
                    return;
                }

                tracing::debug!("session/update {}", notification.update.kind());
                self.state
                    .record_update(&notification.session_id, &notification.update);
                let events = self
                    .translator
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .translate(notification.update);
                for event in events {
                    self.emit(event);
                }
            }
            other => tracing::debug!("Ignoring notification {}", other),
        }
    }

    /// Serve a request from the agent
    pub async fn handle_request(&self, method: &str, params: Value) -> Result<Value, AcpError> {
        tracing::debug!("Agent request {}", method);
        match method {
            methods::SESSION_REQUEST_PERMISSION => {
                let request: RequestPermissionRequest = parse(params)?;
                self.check_session(&request.session_id)?;
                let turn = self.turn_token();
                respond(self.permissions.resolve(request, &turn).await)
            }
            methods::FS_READ_TEXT_FILE if self.config.capabilities.read_text_file => {
                self.read_text_file(parse(params)?).await
            }
            methods::FS_WRITE_TEXT_FILE if self.config.capabilities.write_text_file => {
                self.write_text_file(parse(params)?).await
            }
            methods::TERMINAL_CREATE if self.config.capabilities.terminal => {
                let request: CreateTerminalRequest = parse(params)?;
                self.check_session(&request.session_id)?;
                let cwd = self.session_cwd();
                let terminal_id = self
                    .terminals
                    .create(request, &cwd)
                    .await
                    .map_err(|e| e.to_acp_error())?;
                respond(CreateTerminalResponse { terminal_id })
            }
            methods::TERMINAL_OUTPUT if self.config.capabilities.terminal => {
                let request = self.terminal_request(params)?;
                let output = self
                    .terminals
                    .output(&request.terminal_id)
                    .await
                    .map_err(|e| e.to_acp_error())?;
                respond(output)
            }
            methods::TERMINAL_WAIT_FOR_EXIT if self.config.capabilities.terminal => {
                let request = self.terminal_request(params)?;
                let exit_status = self
                    .terminals
                    .wait_for_exit(&request.terminal_id)
                    .await
                    .map_err(|e| e.to_acp_error())?;
                respond(WaitForTerminalExitResponse { exit_status })
            }
            methods::TERMINAL_KILL if self.config.capabilities.terminal => {
                let request = self.terminal_request(params)?;
                self.terminals
                    .kill(&request.terminal_id)
                    .await
                    .map_err(|e| e.to_acp_error())?;
                respond(EmptyResponse {})
            }
            methods::TERMINAL_RELEASE if self.config.capabilities.terminal => {
                let request = self.terminal_request(params)?;
                self.terminals
                    .release(&request.terminal_id)
                    .await
                    .map_err(|e| e.to_acp_error())?;
                respond(EmptyResponse {})
            }
            other => Err(AcpError::method_not_found(other)),
        }
    }

    async fn read_text_file(&self, request: ReadTextFileRequest) -> Result<Value, AcpError> {
        self.check_session(&request.session_id)?;
        let Some(fs) = self.fs_handler() else {
            return Err(AcpError::resource_not_found(request.path.display()));
        };
        let content = fs.read_file(&request.path).await.map_err(|e| {
            tracing::warn!("Read of {} failed: {}", request.path.display(), e);
            AcpError::resource_not_found(request.path.display())
        })?;
        respond(ReadTextFileResponse {
            content: slice_lines(&content, request.line, request.limit),
        })
    }

    async fn write_text_file(&self, request: WriteTextFileRequest) -> Result<Value, AcpError> {
        self.check_session(&request.session_id)?;
        let Some(fs) = self.fs_handler() else {
            return Err(AcpError::internal_error("no file system handler installed"));
        };
        fs.write_file(&request.path, &request.content)
            .await
            .map_err(AcpError::internal_error)?;
        respond(EmptyResponse {})
    }

    fn terminal_request(&self, params: Value) -> Result<TerminalRequest, AcpError> {
        let request: TerminalRequest = parse(params)?;
        self.check_session(&request.session_id)?;
        Ok(request)
    }

    fn check_session(&self, session_id: &str) -> Result<(), AcpError> {
        if self.state.accepts(session_id) {
            Ok(())
        } else {
            Err(AcpError::invalid_params(format!(
                "Unknown session: {}",
                session_id
            )))
        }
    }

    fn session_cwd(&self) -> PathBuf {
        self.state
            .session()
            .map(|s| s.cwd)
            .unwrap_or_else(|| self.config.cwd.clone())
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, AcpError> {
    serde_json::from_value(params).map_err(AcpError::invalid_params)
}

fn respond<T: Serialize>(response: T) -> Result<Value, AcpError> {
    serde_json::to_value(response).map_err(AcpError::internal_error)
}
