//! Transports carrying the protocol between client and agent
//!
//! A [`Launcher`] produces the byte streams (normally the stdio of a child
//! process) and an [`AgentChannel`] speaks the protocol over them. Two
//! channels exist: [`rpc`] frames JSON-RPC itself, [`sdk`] delegates to the
//! `agent-client-protocol` crate. Both call back into the same
//! [`HostBridge`](crate::host::HostBridge).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::host::HostBridge;

pub mod process;
pub mod rpc;
pub mod sdk;

pub use process::{AgentProcess, ProcessLauncher};
pub use rpc::RpcChannel;
pub use sdk::SdkChannel;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Byte streams to an agent, plus the process behind them if any
pub struct AgentStreams {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub process: Option<AgentProcess>,
}

impl std::fmt::Debug for AgentStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStreams")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// Starts an agent and hands back its streams
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, config: &ClientConfig) -> Result<AgentStreams>;
}

/// A live protocol connection to an agent
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Send a request and wait for its result
    ///
    /// An error answer from the agent surfaces as
    /// [`ClientError::Protocol`](crate::error::ClientError::Protocol); loss of
    /// the connection as [`ClientError::Connection`](crate::error::ClientError::Connection).
    async fn request(&self, method: &str, params: Value) -> Result<Value>;

    async fn notify(&self, method: &str, params: Value) -> Result<()>;

    /// Cancelled once the connection is gone, whichever side ended it
    fn closed(&self) -> CancellationToken;

    /// Tear down the connection and kill the agent process; idempotent
    async fn close(&self);
}

/// Which channel implementation speaks to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// JSON-RPC framed by this crate
    Rpc,
    /// Delegates to the `agent-client-protocol` SDK
    Sdk,
}

impl TransportKind {
    /// Start a channel of this kind over `streams`
    pub fn open(
        self,
        streams: AgentStreams,
        host: Arc<HostBridge>,
        config: &ClientConfig,
    ) -> Result<Arc<dyn AgentChannel>> {
        match self {
            TransportKind::Rpc => Ok(Arc::new(RpcChannel::start(
                streams,
                host,
                config.max_inflight_requests,
            ))),
            TransportKind::Sdk => Ok(Arc::new(SdkChannel::start(streams, host)?)),
        }
    }
}
