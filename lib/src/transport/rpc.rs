//! Process-backed JSON-RPC channel
//!
//! One writer task owns the outbound half and serialises lines; one reader
//! task owns the inbound half and classifies every line:
//!
//! - responses complete the pending request with the same id,
//! - notifications are handed to the host inline, so their order is kept,
//! - requests each get their own task, bounded by a semaphore, so a slow
//!   permission prompt never holds up session updates.
//!
//! When the agent's output ends every pending request fails with
//! [`ClientError::Connection`] and the closed token fires.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{AcpError, ClientError, Result};
use crate::host::HostBridge;
use crate::protocol::jsonrpc::{Incoming, Outgoing, RequestId};

use super::{AgentChannel, AgentProcess, AgentStreams, BoxedReader, BoxedWriter};

type PendingMap = HashMap<RequestId, oneshot::Sender<std::result::Result<Value, AcpError>>>;

struct Shared {
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<PendingMap>,
    next_id: AtomicI64,
    closed: CancellationToken,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_line(&self, message: &Outgoing) -> Result<()> {
        let line = message.to_line()?;
        self.outbound
            .send(line)
            .map_err(|_| ClientError::Connection("Agent connection closed".to_string()))
    }
}

/// JSON-RPC 2.0 over newline-delimited streams
pub struct RpcChannel {
    shared: Arc<Shared>,
    process: tokio::sync::Mutex<Option<AgentProcess>>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("closed", &self.shared.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RpcChannel {
    /// Spawn the reader and writer tasks over `streams`
    pub fn start(streams: AgentStreams, host: Arc<HostBridge>, max_inflight_requests: usize) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(streams.writer, outbound_rx, shared.closed.clone()));
        tokio::spawn(read_loop(
            streams.reader,
            shared.clone(),
            host,
            Arc::new(Semaphore::new(max_inflight_requests.max(1))),
        ));

        Self {
            shared,
            process: tokio::sync::Mutex::new(streams.process),
        }
    }
}

#[async_trait]
impl AgentChannel for RpcChannel {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.shared.closed.is_cancelled() {
            return Err(ClientError::Connection("Agent connection closed".to_string()));
        }

        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        // registered before sending so a fast answer cannot be missed
        self.shared.pending().insert(id.clone(), tx);

        tracing::debug!("→ {} #{}", method, id);
        if let Err(e) = self
            .shared
            .send_line(&Outgoing::request(id.clone(), method, params))
        {
            self.shared.pending().remove(&id);
            return Err(e);
        }

        let answer = tokio::select! {
            biased;
            answer = rx => answer,
            _ = self.shared.closed.cancelled() => {
                self.shared.pending().remove(&id);
                return Err(ClientError::Connection(format!(
                    "Agent connection closed while waiting for {}",
                    method
                )));
            }
        };

        match answer {
            Ok(Ok(result)) => {
                tracing::debug!("← {} #{} ok", method, id);
                Ok(result)
            }
            Ok(Err(error)) => {
                tracing::debug!("← {} #{} error {}: {}", method, id, error.code, error.message);
                Err(ClientError::Protocol(error))
            }
            Err(_) => Err(ClientError::Connection(format!(
                "Agent connection closed while waiting for {}",
                method
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        tracing::debug!("→ {} (notification)", method);
        self.shared.send_line(&Outgoing::notification(method, params))
    }

    fn closed(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    async fn close(&self) {
        self.shared.closed.cancel();
        self.shared.pending().clear();
        if let Some(mut process) = self.process.lock().await.take() {
            process.kill().await;
        }
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

async fn write_loop(
    mut writer: BoxedWriter,
    mut outbound: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            line = outbound.recv() => match line {
                Some(line) => line,
                None => break,
            },
            _ = closed.cancelled() => break,
        };

        tracing::trace!("Writing line: {}", line);
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            tracing::error!("Failed to write to agent: {}", e);
            closed.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    reader: BoxedReader,
    shared: Arc<Shared>,
    host: Arc<HostBridge>,
    inflight: Arc<Semaphore>,
) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shared.closed.cancelled() => break,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("Agent closed its output");
                break;
            }
            Err(e) => {
                tracing::error!("Failed to read from agent: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::trace!("Read line: {}", line);

        match Incoming::parse(line) {
            Ok(Incoming::Response { id, result }) => {
                match shared.pending().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => tracing::warn!("Response for unknown request id {}", id),
                }
            }
            Ok(Incoming::Notification { method, params }) => {
                host.handle_notification(&method, params);
            }
            Ok(Incoming::Request { id, method, params }) => {
                let host = host.clone();
                let shared = shared.clone();
                let inflight = inflight.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = inflight.acquire_owned().await else {
                        return;
                    };
                    let result = host.handle_request(&method, params).await;
                    if let Err(e) = &result {
                        tracing::debug!("Answering {} #{} with error {}", method, id, e.code);
                    }
                    if let Err(e) = shared.send_line(&Outgoing::response(id, result)) {
                        tracing::debug!("Could not answer {}: {}", method, e);
                    }
                });
            }
            Err((Some(id), error)) => {
                tracing::warn!("Malformed message #{}: {}", id, error.message);
                let _ = shared.send_line(&Outgoing::response(id, Err(error)));
            }
            Err((None, error)) => {
                tracing::warn!("Dropping malformed line: {}", error.message);
            }
        }
    }

    shared.closed.cancel();
    let abandoned: Vec<_> = shared.pending().drain().collect();
    if !abandoned.is_empty() {
        tracing::warn!("Failing {} pending request(s): agent gone", abandoned.len());
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

    fn channel() -> (RpcChannel, Peer) {
        let (client_side, agent_side) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (agent_read, agent_write) = tokio::io::split(agent_side);

        let host = Arc::new(HostBridge::new(
            ClientConfig::new("agent", vec![], "/tmp"),
            Arc::new(SessionState::new()),
        ));
        let channel = RpcChannel::start(
            AgentStreams {
                reader: Box::new(client_read),
                writer: Box::new(client_write),
                process: None,
            },
            host,
            8,
        );
        let peer = Peer {
            lines: BufReader::new(agent_read).lines(),
            writer: agent_write,
        };
        (channel, peer)
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (channel, mut peer) = channel();

        let call = tokio::spawn(async move {
            let result = channel.request("initialize", json!({"protocolVersion": 1})).await;
            (channel, result)
        });

        let request = peer.recv().await;
        assert_eq!(request["method"], "initialize");
        assert_eq!(request["jsonrpc"], "2.0");
        peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"ok": true}}))
            .await;

        let (_channel, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_agent_error_is_protocol_error() {
        let (channel, mut peer) = channel();
        let call = tokio::spawn(async move { channel.request("session/load", json!({})).await });

        let request = peer.recv().await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32601, "message": "Method not found: session/load"}
        }))
        .await;

        match call.await.unwrap() {
            Err(ClientError::Protocol(e)) => assert_eq!(e.code, -32601),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_fails_pending_requests() {
        let (channel, mut peer) = channel();
        let closed = channel.closed();
        let call = tokio::spawn(async move { channel.request("session/prompt", json!({})).await });

        peer.recv().await;
        drop(peer);

        assert!(matches!(
            call.await.unwrap(),
            Err(ClientError::Connection(_))
        ));
        closed.cancelled().await;
    }

    #[tokio::test]
    async fn test_agent_request_answered() {
        let (_channel, mut peer) = channel();
        peer.send(json!({"jsonrpc": "2.0", "id": 41, "method": "foo", "params": {}}))
            .await;

        let answer = peer.recv().await;
        assert_eq!(answer["id"], 41);
        assert_eq!(answer["error"]["code"], -32601);
        assert_eq!(answer["error"]["message"], "Method not found: foo");
    }

    #[tokio::test]
    async fn test_malformed_request_answered() {
        let (_channel, mut peer) = channel();
        peer.send(json!({"id": 5, "method": "fs/read_text_file"})).await;

        let answer = peer.recv().await;
        assert_eq!(answer["id"], 5);
        assert_eq!(answer["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, _peer) = channel();
        channel.close().await;
        channel.close().await;
        assert!(channel.closed().is_cancelled());
        assert!(matches!(
            channel.request("initialize", json!({})).await,
            Err(ClientError::Connection(_))
        ));
    }
}
