//! Channel delegating the protocol to the `agent-client-protocol` SDK
//!
//! The SDK's connection is `!Send`, so it lives on a dedicated thread with a
//! current-thread runtime and a `LocalSet`. Callers talk to it through a
//! command queue; each request runs as its own local task so a long prompt
//! never blocks a `session/cancel` sent behind it.
//!
//! Engine and SDK types share the same JSON shape, so values cross the
//! boundary through `serde_json`. Requests the agent makes of us are handed
//! back to the caller's runtime and served by the same
//! [`HostBridge`] the RPC channel uses.

use agent_client_protocol as acp;
use acp::Agent as _;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;

use crate::error::{AcpError, ClientError, Result};
use crate::host::HostBridge;
use crate::protocol::methods;

use super::{AgentChannel, AgentProcess, AgentStreams, BoxedReader, BoxedWriter};

enum SdkCommand {
    Request {
        method: String,
        params: Value,
        respond: oneshot::Sender<Result<Value>>,
    },
    Notify {
        method: String,
        params: Value,
        respond: oneshot::Sender<Result<()>>,
    },
}

/// Protocol connection driven by the SDK's `ClientSideConnection`
pub struct SdkChannel {
    commands: mpsc::UnboundedSender<SdkCommand>,
    closed: CancellationToken,
    process: tokio::sync::Mutex<Option<AgentProcess>>,
}

impl std::fmt::Debug for SdkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkChannel")
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SdkChannel {
    /// Start the connection thread over `streams`
    ///
    /// Must be called from within a tokio runtime; agent requests are served
    /// on that runtime.
    pub fn start(streams: AgentStreams, host: Arc<HostBridge>) -> Result<Self> {
        let caller = tokio::runtime::Handle::try_current().map_err(|e| {
            ClientError::Internal(format!("SDK transport needs a tokio runtime: {}", e))
        })?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let AgentStreams {
            reader,
            writer,
            process,
        } = streams;

        let thread_closed = closed.clone();
        std::thread::Builder::new()
            .name("acp-sdk-connection".to_string())
            .spawn(move || {
                let handler = SdkClientHandler { host, caller };
                let local = LocalSet::new();
                runtime.block_on(local.run_until(run_connection(
                    reader,
                    writer,
                    handler,
                    command_rx,
                    thread_closed.clone(),
                )));
                thread_closed.cancel();
                tracing::debug!("SDK connection thread finished");
            })
            .map_err(|e| {
                ClientError::Connection(format!("Failed to start SDK connection thread: {}", e))
            })?;

        Ok(Self {
            commands,
            closed,
            process: tokio::sync::Mutex::new(process),
        })
    }

    fn submit(&self, command: SdkCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::Connection("Agent connection closed".to_string()))
    }

    async fn await_answer<T>(&self, method: &str, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            answer = rx => answer.unwrap_or_else(|_| {
                Err(ClientError::Connection(format!(
                    "Agent connection closed while waiting for {}",
                    method
                )))
            }),
            _ = self.closed.cancelled() => Err(ClientError::Connection(format!(
                "Agent connection closed while waiting for {}",
                method
            ))),
        }
    }
}

#[async_trait]
impl AgentChannel for SdkChannel {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Connection("Agent connection closed".to_string()));
        }
        tracing::debug!("→ {} (sdk)", method);
        let (respond, rx) = oneshot::channel();
        self.submit(SdkCommand::Request {
            method: method.to_string(),
            params,
            respond,
        })?;
        self.await_answer(method, rx).await
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Connection("Agent connection closed".to_string()));
        }
        tracing::debug!("→ {} (sdk notification)", method);
        let (respond, rx) = oneshot::channel();
        self.submit(SdkCommand::Notify {
            method: method.to_string(),
            params,
            respond,
        })?;
        self.await_answer(method, rx).await
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Some(mut process) = self.process.lock().await.take() {
            process.kill().await;
        }
    }
}

impl Drop for SdkChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn run_connection(
    reader: BoxedReader,
    writer: BoxedWriter,
    handler: SdkClientHandler,
    mut commands: mpsc::UnboundedReceiver<SdkCommand>,
    closed: CancellationToken,
) {
    let (conn, io_task) =
        acp::ClientSideConnection::new(handler, writer.compat_write(), reader.compat(), |fut| {
            tokio::task::spawn_local(fut);
        });
    let conn = Rc::new(conn);

    let io_closed = closed.clone();
    tokio::task::spawn_local(async move {
        match io_task.await {
            Ok(()) => tracing::info!("Agent closed its output"),
            Err(e) => tracing::warn!("Agent connection ended: {:?}", e),
        }
        io_closed.cancel();
    });

    loop {
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = closed.cancelled() => break,
        };

        match command {
            SdkCommand::Request {
                method,
                params,
                respond,
            } => {
                let conn = conn.clone();
                tokio::task::spawn_local(async move {
                    let result = dispatch(&conn, &method, params).await;
                    // updates the agent sent before its answer are queued as
                    // local tasks; let them run before the caller resumes
                    tokio::task::yield_now().await;
                    if let Err(e) = &result {
                        tracing::debug!("← {} (sdk) failed: {}", method, e);
                    }
                    let _ = respond.send(result);
                });
            }
            SdkCommand::Notify {
                method,
                params,
                respond,
            } => {
                let _ = respond.send(notify(&conn, &method, params).await);
            }
        }
    }
}

async fn dispatch(conn: &acp::ClientSideConnection, method: &str, params: Value) -> Result<Value> {
    match method {
        methods::INITIALIZE => relay(conn.initialize(decode(params)?).await),
        methods::SESSION_NEW => relay(conn.new_session(decode(params)?).await),
        methods::SESSION_LOAD => relay(conn.load_session(decode(params)?).await),
        methods::SESSION_LIST => relay(conn.list_sessions(decode(params)?).await),
        methods::SESSION_RESUME => relay(conn.resume_session(decode(params)?).await),
        methods::SESSION_FORK => relay(conn.fork_session(decode(params)?).await),
        methods::SESSION_SET_MODE => relay(conn.set_session_mode(decode(params)?).await),
        methods::SESSION_SET_MODEL => relay(conn.set_session_model(decode(params)?).await),
        methods::SESSION_SET_CONFIG_OPTION => {
            relay(conn.set_session_config_option(decode(params)?).await)
        }
        methods::SESSION_PROMPT => relay(conn.prompt(decode(params)?).await),
        other => Err(ClientError::Unsupported(format!(
            "{} is not available over the SDK transport",
            other
        ))),
    }
}

async fn notify(conn: &acp::ClientSideConnection, method: &str, params: Value) -> Result<()> {
    match method {
        methods::SESSION_CANCEL => conn
            .cancel(decode(params)?)
            .await
            .map_err(|e| ClientError::Protocol(from_sdk_error(&e))),
        other => Err(ClientError::Unsupported(format!(
            "{} is not available over the SDK transport",
            other
        ))),
    }
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T> {
    Ok(serde_json::from_value(params)?)
}

fn relay<T: Serialize>(result: acp::Result<T>) -> Result<Value> {
    let response = result.map_err(|e| ClientError::Protocol(from_sdk_error(&e)))?;
    Ok(serde_json::to_value(response)?)
}

fn from_sdk_error(error: &acp::Error) -> AcpError {
    serde_json::to_value(error)
        .and_then(serde_json::from_value)
        .unwrap_or_else(|_| AcpError::internal_error(format!("{:?}", error)))
}

fn to_sdk_error(error: &AcpError) -> acp::Error {
    serde_json::to_value(error)
        .and_then(serde_json::from_value)
        .unwrap_or_else(|_| acp::Error::internal_error().data(error.message.clone()))
}

/// Serves the agent's calls by handing them to the [`HostBridge`]
struct SdkClientHandler {
    host: Arc<HostBridge>,
    caller: tokio::runtime::Handle,
}

impl SdkClientHandler {
    /// Run `method` on the caller's runtime, where terminals and permission
    /// handlers live
    async fn forward<Req, Resp>(&self, method: &'static str, args: &Req) -> acp::Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let params =
            serde_json::to_value(args).map_err(|e| to_sdk_error(&AcpError::invalid_params(e)))?;
        let host = self.host.clone();
        let result = self
            .caller
            .spawn(async move { host.handle_request(method, params).await })
            .await
            .map_err(|e| to_sdk_error(&AcpError::internal_error(e)))?
            .map_err(|e| to_sdk_error(&e))?;
        serde_json::from_value(result).map_err(|e| to_sdk_error(&AcpError::internal_error(e)))
    }
}

#[async_trait::async_trait(?Send)]
impl acp::Client for SdkClientHandler {
    async fn request_permission(
        &self,
        args: acp::RequestPermissionRequest,
    ) -> acp::Result<acp::RequestPermissionResponse> {
        self.forward(methods::SESSION_REQUEST_PERMISSION, &args).await
    }

    async fn session_notification(&self, args: acp::SessionNotification) -> acp::Result<()> {
        let params = serde_json::to_value(&args)
            .map_err(|e| to_sdk_error(&AcpError::internal_error(e)))?;
        self.host.handle_notification(methods::SESSION_UPDATE, params);
        Ok(())
    }

    async fn write_text_file(
        &self,
        args: acp::WriteTextFileRequest,
    ) -> acp::Result<acp::WriteTextFileResponse> {
        self.forward(methods::FS_WRITE_TEXT_FILE, &args).await
    }

    async fn read_text_file(
        &self,
        args: acp::ReadTextFileRequest,
    ) -> acp::Result<acp::ReadTextFileResponse> {
        self.forward(methods::FS_READ_TEXT_FILE, &args).await
    }

    async fn create_terminal(
        &self,
        args: acp::CreateTerminalRequest,
    ) -> acp::Result<acp::CreateTerminalResponse> {
        self.forward(methods::TERMINAL_CREATE, &args).await
    }

    async fn terminal_output(
        &self,
        args: acp::TerminalOutputRequest,
    ) -> acp::Result<acp::TerminalOutputResponse> {
        self.forward(methods::TERMINAL_OUTPUT, &args).await
    }

    async fn release_terminal(
        &self,
        args: acp::ReleaseTerminalRequest,
    ) -> acp::Result<acp::ReleaseTerminalResponse> {
        self.forward(methods::TERMINAL_RELEASE, &args).await
    }

    async fn wait_for_terminal_exit(
        &self,
        args: acp::WaitForTerminalExitRequest,
    ) -> acp::Result<acp::WaitForTerminalExitResponse> {
        self.forward(methods::TERMINAL_WAIT_FOR_EXIT, &args).await
    }

    async fn kill_terminal_command(
        &self,
        args: acp::KillTerminalCommandRequest,
    ) -> acp::Result<acp::KillTerminalCommandResponse> {
        self.forward(methods::TERMINAL_KILL, &args).await
    }

    async fn ext_method(&self, _args: acp::ExtRequest) -> acp::Result<acp::ExtResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn ext_notification(&self, _args: acp::ExtNotification) -> acp::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::session::SessionState;
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct Peer {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn channel() -> (SdkChannel, Peer) {
        let (client_side, agent_side) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (agent_read, agent_write) = tokio::io::split(agent_side);

        let host = Arc::new(HostBridge::new(
            ClientConfig::new("agent", vec![], "/tmp"),
            Arc::new(SessionState::new()),
        ));
        let channel = SdkChannel::start(
            AgentStreams {
                reader: Box::new(client_read),
                writer: Box::new(client_write),
                process: None,
            },
            host,
        )
        .unwrap();
        let peer = Peer {
            lines: BufReader::new(agent_read).lines(),
            writer: agent_write,
        };
        (channel, peer)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initialize_through_sdk() {
        let (channel, mut peer) = channel();
        let call = tokio::spawn(async move {
            let result = channel
                .request(
                    methods::INITIALIZE,
                    json!({"protocolVersion": 1, "clientCapabilities": {}}),
                )
                .await;
            (channel, result)
        });

        let request = peer.recv().await;
        assert_eq!(request["method"], "initialize");
        assert_eq!(request["params"]["protocolVersion"], 1);
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {"protocolVersion": 1, "agentCapabilities": {}, "authMethods": []}
        }))
        .await;

        let (_channel, result) = call.await.unwrap();
        assert_eq!(result.unwrap()["protocolVersion"], 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsupported_method() {
        let (channel, _peer) = channel();
        let err = channel
            .request("session/rewind", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Unsupported(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_agent_eof_closes_channel() {
        let (channel, peer) = channel();
        drop(peer);
        channel.closed().cancelled().await;
        assert!(matches!(
            channel.request(methods::INITIALIZE, json!({})).await,
            Err(ClientError::Connection(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_is_idempotent() {
        let (channel, _peer) = channel();
        channel.close().await;
        channel.close().await;
        assert!(channel.closed().is_cancelled());
    }
}
