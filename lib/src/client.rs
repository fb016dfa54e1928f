//! Client facade: the operations a host uses to drive an agent
//!
//! [`AgentClient`] is the contract, [`Client`] the one implementation. Which
//! transport carries the protocol is a constructor argument and invisible
//! through the trait.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::StreamEvent;
use crate::fs::FileSystemHandler;
use crate::host::HostBridge;
use crate::permission::PermissionHandler;
use crate::protocol::{
    methods, AgentCapabilities, AvailableCommand, CancelNotification, ContentBlock,
    CreateTerminalRequest, EnvVariable, ForkSessionRequest, ForkSessionResponse,
    InitializeRequest, InitializeResponse, ListSessionsRequest, ListSessionsResponse,
    LoadSessionRequest, ModelInfo, NewSessionRequest, NewSessionResponse, PromptRequest,
    PromptResponse, ResumeSessionRequest, SessionConfigOption, SessionMode, SessionSetup,
    SetSessionConfigOptionRequest, SetSessionConfigOptionResponse, SetSessionModeRequest,
    SetSessionModelRequest, PROTOCOL_VERSION,
};
use crate::session::{Session, SessionState};
use crate::terminal_manager::TerminalHandle;
use crate::transport::{AgentChannel, Launcher, ProcessLauncher, TransportKind};

/// Lazy, finite sequence of events for one prompt turn
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Extras for [`AgentClient::send_message`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOptions {
    /// Content blocks sent after the text block
    pub content: Vec<ContentBlock>,
}

impl MessageOptions {
    pub fn with_content(mut self, block: ContentBlock) -> Self {
        self.content.push(block);
        self
    }
}

/// A command to run in a terminal bound to the current session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminalOptions {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVariable>,
    /// Absolute directory; the session's cwd when unset
    pub cwd: Option<PathBuf>,
    pub output_byte_limit: Option<u64>,
}

impl TerminalOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVariable {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Everything a host can ask of a connected agent
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Launch the agent, handshake and open a session, as one step
    ///
    /// Tears down any previous connection first. On failure the agent
    /// process is killed and the client is left disconnected.
    async fn connect(&self) -> Result<Session>;

    /// Idempotent; never fails
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
    fn get_session(&self) -> Option<Session>;
    fn get_agent_capabilities(&self) -> Option<AgentCapabilities>;

    /// Events of one prompt turn; the prompt goes out on first poll
    fn send_message(&self, text: &str, options: MessageOptions) -> Result<EventStream>;

    async fn send_message_sync(
        &self,
        text: &str,
        options: MessageOptions,
    ) -> Result<Vec<StreamEvent>>;

    /// Ask the agent to stop the current turn; no-op when idle
    async fn cancel(&self);

    fn set_permission_handler(&self, handler: Arc<dyn PermissionHandler>);
    fn clear_permission_handler(&self);
    fn set_file_system_handler(&self, handler: Arc<dyn FileSystemHandler>);

    fn available_modes(&self) -> Vec<SessionMode>;
    fn current_mode(&self) -> Option<String>;
    fn available_models(&self) -> Vec<ModelInfo>;
    fn current_model(&self) -> Option<String>;
    fn config_options(&self) -> Vec<SessionConfigOption>;
    fn available_commands(&self) -> Vec<AvailableCommand>;

    async fn set_mode(&self, mode_id: &str) -> Result<()>;
    async fn set_model(&self, model_id: &str) -> Result<()>;
    async fn set_config_option(
        &self,
        config_id: &str,
        value: &str,
    ) -> Result<Vec<SessionConfigOption>>;

    async fn list_sessions(
        &self,
        cwd: Option<PathBuf>,
        cursor: Option<String>,
    ) -> Result<ListSessionsResponse>;
    async fn load_session(&self, session_id: &str) -> Result<Session>;
    async fn fork_session(&self, session_id: &str) -> Result<Session>;
    async fn resume_session(&self, session_id: &str) -> Result<Session>;

    fn supports_terminal(&self) -> bool;
    async fn create_terminal(&self, options: TerminalOptions) -> Result<TerminalHandle>;

    /// Every stream event, whether or not a turn is being consumed
    fn subscribe(&self) -> broadcast::Receiver<StreamEvent>;

    /// Fires when teardown of the connection begins
    fn cancellation_token(&self) -> CancellationToken;

    /// Fires once teardown has finished
    fn closed(&self) -> CancellationToken;
}

/// Teardown signals of one connection
#[derive(Debug, Clone)]
struct Lifecycle {
    cancel: CancellationToken,
    closed: CancellationToken,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }

    /// State of a client that has never connected
    fn ended() -> Self {
        let lifecycle = Self::new();
        lifecycle.cancel.cancel();
        lifecycle.closed.cancel();
        lifecycle
    }
}

/// [`AgentClient`] over a [`Launcher`] and a [`TransportKind`]
pub struct Client {
    config: ClientConfig,
    transport: TransportKind,
    launcher: Arc<dyn Launcher>,
    state: Arc<SessionState>,
    host: Arc<HostBridge>,
    channel: RwLock<Option<Arc<dyn AgentChannel>>>,
    lifecycle: Mutex<Lifecycle>,
    connect_lock: tokio::sync::Mutex<()>,
    turn_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("command", &self.config.command)
            .field("transport", &self.transport)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Client that spawns `config.command` as the agent
    pub fn new(config: ClientConfig, transport: TransportKind) -> Self {
        Self::with_launcher(config, transport, Arc::new(ProcessLauncher::new()))
    }

    /// Client whose agent streams come from `launcher`
    pub fn with_launcher(
        config: ClientConfig,
        transport: TransportKind,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let state = Arc::new(SessionState::new());
        let host = Arc::new(HostBridge::new(config.clone(), state.clone()));
        Self {
            config,
            transport,
            launcher,
            state,
            host,
            channel: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle::ended()),
            connect_lock: tokio::sync::Mutex::new(()),
            turn_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    fn channel(&self) -> Option<Arc<dyn AgentChannel>> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Channel and session id of a live session, or `NotConnected`
    fn require_session(&self) -> Result<(Arc<dyn AgentChannel>, Session)> {
        let session = self.state.session().ok_or(ClientError::NotConnected)?;
        let channel = self.channel().ok_or(ClientError::NotConnected)?;
        if channel.closed().is_cancelled() {
            return Err(ClientError::NotConnected);
        }
        Ok((channel, session))
    }

    fn require_capability(
        &self,
        method: &str,
        supported: impl FnOnce(&AgentCapabilities) -> bool,
    ) -> Result<()> {
        match self.state.agent_capabilities() {
            Some(capabilities) if supported(&capabilities) => Ok(()),
            _ => Err(ClientError::Unsupported(format!(
                "Agent does not support {}",
                method
            ))),
        }
    }

    async fn call<Req, Resp>(
        channel: &Arc<dyn AgentChannel>,
        method: &str,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let result = channel.request(method, serde_json::to_value(request)?).await?;
        decode(result)
    }

    async fn handshake(&self, channel: &Arc<dyn AgentChannel>) -> Result<Session> {
        let initialize = InitializeRequest {
            protocol_version: PROTOCOL_VERSION,
            client_capabilities: self.config.client_capabilities(self.host.has_fs_handler()),
            client_info: Some(self.config.client_info()),
        };
        let agent: InitializeResponse =
            Self::call(channel, methods::INITIALIZE, &initialize).await?;
        if agent.protocol_version != PROTOCOL_VERSION {
            return Err(ClientError::Connection(format!(
                "Agent speaks protocol version {}, expected {}",
                agent.protocol_version, PROTOCOL_VERSION
            )));
        }
        tracing::info!(
            "Agent {} initialized",
            agent
                .agent_info
                .as_ref()
                .map(|info| format!("{} {}", info.name, info.version))
                .unwrap_or_else(|| self.config.command.clone())
        );
        self.state.set_agent(agent);

        let new_session = NewSessionRequest {
            cwd: self.config.cwd.clone(),
            mcp_servers: self.config.wire_mcp_servers(),
        };
        let response: NewSessionResponse =
            Self::call(channel, methods::SESSION_NEW, &new_session).await?;
        Ok(Session::new(
            response.session_id,
            self.config.cwd.clone(),
            response.setup,
        ))
    }

    /// Load or resume a session, keeping the history the agent replays
    /// before it answers
    async fn restore<Req: Serialize>(
        &self,
        channel: &Arc<dyn AgentChannel>,
        method: &str,
        request: &Req,
        session_id: &str,
        cwd: PathBuf,
    ) -> Result<Session> {
        let session_id = session_id.to_string();
        self.state.begin_pending(session_id.clone());
        let result: Result<SessionSetup> = Self::call(channel, method, request).await;
        let replayed = self.state.finish_pending();
        let setup = result?;
        tracing::debug!(
            "{} replayed {} update(s) for {}",
            method,
            replayed.len(),
            session_id
        );
        Ok(self.adopt(Session::restore(session_id, cwd, &replayed, setup)))
    }

    /// Make `session` the live session, forgetting the previous one's tool calls
    fn adopt(&self, session: Session) -> Session {
        self.host.reset();
        self.state.set_session(session.clone());
        session
    }

    /// Watch for the agent going away on its own
    fn watch(&self, channel: Arc<dyn AgentChannel>, lifecycle: Lifecycle) {
        let state = self.state.clone();
        let host = self.host.clone();
        tokio::spawn(async move {
            let closed = channel.closed();
            tokio::select! {
                biased;
                _ = lifecycle.cancel.cancelled() => return,
                _ = closed.cancelled() => {}
            }
            tracing::warn!("Agent connection lost");
            state.mark_inactive();
            host.abort_permissions();
            lifecycle.cancel.cancel();
            channel.close().await;
            host.terminals().release_all().await;
            lifecycle.closed.cancel();
        });
    }
}

#[async_trait]
impl AgentClient for Client {
    async fn connect(&self) -> Result<Session> {
        let _connecting = self.connect_lock.lock().await;
        self.disconnect().await;
        self.config
            .validate()
            .map_err(|e| ClientError::Connection(format!("Invalid configuration: {}", e)))?;

        tracing::info!(
            "Connecting to agent '{}' over {:?} transport",
            self.config.command,
            self.transport
        );
        let streams = self.launcher.launch(&self.config).await?;
        let channel = self
            .transport
            .open(streams, self.host.clone(), &self.config)?;

        let session = match self.handshake(&channel).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("Handshake with agent failed: {}", e);
                channel.close().await;
                self.state.clear();
                return Err(match e {
                    ClientError::Connection(_) => e,
                    other => ClientError::Connection(format!("Handshake failed: {}", other)),
                });
            }
        };

        let lifecycle = Lifecycle::new();
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = lifecycle.clone();
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());
        self.watch(channel, lifecycle);

        Ok(self.adopt(session))
    }

    async fn disconnect(&self) {
        let channel = self
            .channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let lifecycle = self.lifecycle();

        lifecycle.cancel.cancel();
        self.host.abort_permissions();
        if let Some(channel) = channel {
            tracing::info!("Disconnecting from agent '{}'", self.config.command);
            channel.close().await;
        }
        self.host.terminals().release_all().await;
        self.state.clear();
        self.host.reset();
        lifecycle.closed.cancel();
    }

    fn is_connected(&self) -> bool {
        self.state.session().is_some()
            && self
                .channel()
                .is_some_and(|channel| !channel.closed().is_cancelled())
    }

    fn get_session(&self) -> Option<Session> {
        self.state.session()
    }

    fn get_agent_capabilities(&self) -> Option<AgentCapabilities> {
        self.state.agent_capabilities()
    }

    fn send_message(&self, text: &str, options: MessageOptions) -> Result<EventStream> {
        let (channel, session) = self.require_session()?;
        let host = self.host.clone();
        let turn_lock = self.turn_lock.clone();

        let mut prompt = Vec::with_capacity(1 + options.content.len());
        prompt.push(ContentBlock::text(text));
        prompt.extend(options.content);
        let request = PromptRequest {
            session_id: session.id,
            prompt,
        };

        let start = async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let turn = turn_lock.lock_owned().await;
            host.begin_turn(tx.clone());
            tokio::spawn(async move {
                let result = run_prompt(&channel, request).await;
                host.end_turn();
                let last = match result {
                    Ok(stop_reason) => host.complete_turn(stop_reason),
                    Err(e) => {
                        tracing::error!("Prompt turn failed: {}", e);
                        StreamEvent::Error {
                            message: e.to_string(),
                            code: Some(e.to_json_rpc_error()),
                        }
                    }
                };
                host.publish(last.clone());
                let _ = tx.send(last);
                drop(turn);
            });
            UnboundedReceiverStream::new(rx)
        };

        Ok(Box::pin(stream::once(start).flatten()))
    }

    async fn send_message_sync(
        &self,
        text: &str,
        options: MessageOptions,
    ) -> Result<Vec<StreamEvent>> {
        Ok(self.send_message(text, options)?.collect().await)
    }

    async fn cancel(&self) {
        self.host.cancel_turn();
        let Ok((channel, session)) = self.require_session() else {
            return;
        };
        let notification = CancelNotification {
            session_id: session.id,
        };
        let params = match serde_json::to_value(notification) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("Could not encode session/cancel: {}", e);
                return;
            }
        };
        if let Err(e) = channel.notify(methods::SESSION_CANCEL, params).await {
            tracing::warn!("Failed to send session/cancel: {}", e);
        }
    }

    fn set_permission_handler(&self, handler: Arc<dyn PermissionHandler>) {
        self.host.permissions().set_handler(handler);
    }

    fn clear_permission_handler(&self) {
        self.host.permissions().clear_handler();
    }

    fn set_file_system_handler(&self, handler: Arc<dyn FileSystemHandler>) {
        self.host.set_fs_handler(handler);
    }

    fn available_modes(&self) -> Vec<SessionMode> {
        self.state
            .session()
            .map(|s| s.available_modes)
            .unwrap_or_default()
    }

    fn current_mode(&self) -> Option<String> {
        self.state.session().and_then(|s| s.current_mode_id)
    }

    fn available_models(&self) -> Vec<ModelInfo> {
        self.state
            .session()
            .map(|s| s.available_models)
            .unwrap_or_default()
    }

    fn current_model(&self) -> Option<String> {
        self.state.session().and_then(|s| s.current_model_id)
    }

    fn config_options(&self) -> Vec<SessionConfigOption> {
        self.state
            .session()
            .map(|s| s.config_options)
            .unwrap_or_default()
    }

    fn available_commands(&self) -> Vec<AvailableCommand> {
        self.state
            .session()
            .map(|s| s.available_commands)
            .unwrap_or_default()
    }

    async fn set_mode(&self, mode_id: &str) -> Result<()> {
        let (channel, session) = self.require_session()?;
        let request = SetSessionModeRequest {
            session_id: session.id,
            mode_id: mode_id.to_string(),
        };
        channel
            .request(methods::SESSION_SET_MODE, serde_json::to_value(request)?)
            .await?;
        self.state
            .update_session(|s| s.current_mode_id = Some(mode_id.to_string()));
        Ok(())
    }

    async fn set_model(&self, model_id: &str) -> Result<()> {
        let (channel, session) = self.require_session()?;
        let request = SetSessionModelRequest {
            session_id: session.id,
            model_id: model_id.to_string(),
        };
        channel
            .request(methods::SESSION_SET_MODEL, serde_json::to_value(request)?)
            .await?;
        self.state
            .update_session(|s| s.current_model_id = Some(model_id.to_string()));
        Ok(())
    }

    async fn set_config_option(
        &self,
        config_id: &str,
        value: &str,
    ) -> Result<Vec<SessionConfigOption>> {
        let (channel, session) = self.require_session()?;
        let request = SetSessionConfigOptionRequest {
            session_id: session.id,
            config_id: config_id.to_string(),
            value: value.to_string(),
        };
        let response: SetSessionConfigOptionResponse =
            Self::call(&channel, methods::SESSION_SET_CONFIG_OPTION, &request).await?;
        let options = response.config_options;
        self.state
            .update_session(|s| s.config_options = options.clone());
        Ok(options)
    }

    async fn list_sessions(
        &self,
        cwd: Option<PathBuf>,
        cursor: Option<String>,
    ) -> Result<ListSessionsResponse> {
        let (channel, _) = self.require_session()?;
        self.require_capability(methods::SESSION_LIST, AgentCapabilities::supports_list)?;
        Self::call(
            &channel,
            methods::SESSION_LIST,
            &ListSessionsRequest { cwd, cursor },
        )
        .await
    }

    async fn load_session(&self, session_id: &str) -> Result<Session> {
        let (channel, current) = self.require_session()?;
        self.require_capability(methods::SESSION_LOAD, |c| c.load_session)?;
        let request = LoadSessionRequest {
            session_id: session_id.to_string(),
            cwd: current.cwd.clone(),
            mcp_servers: self.config.wire_mcp_servers(),
        };
        self.restore(&channel, methods::SESSION_LOAD, &request, session_id, current.cwd)
            .await
    }

    async fn fork_session(&self, session_id: &str) -> Result<Session> {
        let (channel, current) = self.require_session()?;
        self.require_capability(methods::SESSION_FORK, AgentCapabilities::supports_fork)?;
        let request = ForkSessionRequest {
            session_id: session_id.to_string(),
            cwd: current.cwd.clone(),
            mcp_servers: self.config.wire_mcp_servers(),
        };
        let response: ForkSessionResponse =
            Self::call(&channel, methods::SESSION_FORK, &request).await?;
        Ok(self.adopt(Session::new(response.session_id, current.cwd, response.setup)))
    }

    async fn resume_session(&self, session_id: &str) -> Result<Session> {
        let (channel, current) = self.require_session()?;
        self.require_capability(methods::SESSION_RESUME, AgentCapabilities::supports_resume)?;
        let request = ResumeSessionRequest {
            session_id: session_id.to_string(),
            cwd: current.cwd.clone(),
            mcp_servers: self.config.wire_mcp_servers(),
        };
        self.restore(&channel, methods::SESSION_RESUME, &request, session_id, current.cwd)
            .await
    }

    fn supports_terminal(&self) -> bool {
        self.config.capabilities.terminal
    }

    async fn create_terminal(&self, options: TerminalOptions) -> Result<TerminalHandle> {
        let (_, session) = self.require_session()?;
        if !self.supports_terminal() {
            return Err(ClientError::Unsupported(
                "terminal capability is disabled".to_string(),
            ));
        }
        let request = CreateTerminalRequest {
            session_id: session.id,
            command: options.command,
            args: options.args,
            env: options.env,
            cwd: options.cwd,
            output_byte_limit: options.output_byte_limit,
        };
        let terminals = self.host.terminals().clone();
        let terminal_id = terminals.create(request, &session.cwd).await?;
        Ok(TerminalHandle::new(terminals, terminal_id))
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.host.subscribe()
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.lifecycle().cancel
    }

    fn closed(&self) -> CancellationToken {
        self.lifecycle().closed
    }
}

impl Drop for Client {
    /// Stop the agent even when `disconnect` was never called
    ///
    /// Closing is async, so it is handed to the current runtime; without one
    /// the channel's own drop kills the agent process.
    fn drop(&mut self) {
        let channel = self
            .channel
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // releases the watcher's reference to the channel
        lifecycle.cancel.cancel();
        self.host.abort_permissions();

        let Some(channel) = channel else {
            lifecycle.closed.cancel();
            return;
        };
        tracing::debug!("Client dropped, closing agent '{}'", self.config.command);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let host = self.host.clone();
                runtime.spawn(async move {
                    channel.close().await;
                    host.terminals().release_all().await;
                    lifecycle.closed.cancel();
                });
            }
            Err(_) => {
                drop(channel);
                lifecycle.closed.cancel();
            }
        }
    }
}

async fn run_prompt(
    channel: &Arc<dyn AgentChannel>,
    request: PromptRequest,
) -> Result<crate::protocol::StopReason> {
    tracing::debug!(
        "Prompting session {} with {} block(s)",
        request.session_id,
        request.prompt.len()
    );
    let response: PromptResponse = Client::call(channel, methods::SESSION_PROMPT, &request).await?;
    Ok(response.stop_reason)
}

/// Decode an agent result; `null` stands for an empty object
fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    Ok(serde_json::from_value(value)?)
}
