//! Permission correlation
//!
//! Bridges an agent's `session/request_permission` call to the host's
//! decision function and turns the decision back into exactly one protocol
//! outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{
    PermissionOption, RequestPermissionRequest, RequestPermissionResponse, SessionId, ToolKind,
    ToolCallUpdate,
};

/// Rough danger of letting a tool call proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn for_kind(kind: Option<ToolKind>) -> Self {
        match kind {
            Some(ToolKind::Execute) | Some(ToolKind::Delete) => RiskLevel::High,
            Some(ToolKind::Edit) | Some(ToolKind::Move) => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

/// What the host sees of a permission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub session_id: SessionId,
    pub tool_call: ToolCallUpdate,
    pub options: Vec<PermissionOption>,
    pub description: Option<String>,
    pub risk: RiskLevel,
}

impl From<RequestPermissionRequest> for PermissionRequest {
    fn from(request: RequestPermissionRequest) -> Self {
        Self {
            session_id: request.session_id,
            description: request.tool_call.title.clone(),
            risk: RiskLevel::for_kind(request.tool_call.kind),
            tool_call: request.tool_call,
            options: request.options,
        }
    }
}

/// The host's decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PermissionHandlerResponse {
    /// Proceed; without an option id the first allow option is chosen
    Granted { option_id: Option<String> },
    Denied { reason: Option<String> },
}

impl PermissionHandlerResponse {
    pub fn allow(option_id: impl Into<String>) -> Self {
        PermissionHandlerResponse::Granted {
            option_id: Some(option_id.into()),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        PermissionHandlerResponse::Denied {
            reason: Some(reason.into()),
        }
    }
}

/// Host-supplied decision function
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn handle(&self, request: PermissionRequest) -> Result<PermissionHandlerResponse>;
}

#[async_trait]
impl<F, Fut> PermissionHandler for F
where
    F: Fn(PermissionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PermissionHandlerResponse>> + Send + 'static,
{
    async fn handle(&self, request: PermissionRequest) -> Result<PermissionHandlerResponse> {
        (self)(request).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn PermissionHandler>
where
    F: Fn(PermissionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PermissionHandlerResponse>> + Send + 'static,
{
    Arc::new(f)
}

/// Holds the single active handler and answers permission requests
#[derive(Default)]
pub struct PermissionBroker {
    handler: RwLock<Option<Arc<dyn PermissionHandler>>>,
}

impl std::fmt::Debug for PermissionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionBroker")
            .field("has_handler", &self.has_handler())
            .finish()
    }
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active handler
    pub fn set_handler(&self, handler: Arc<dyn PermissionHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn has_handler(&self) -> bool {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn current(&self) -> Option<Arc<dyn PermissionHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Produce the one outcome for an agent permission request
    ///
    /// Cancelling `turn` while the handler is still deciding answers
    /// `cancelled` and drops the handler's future.
    pub async fn resolve(
        &self,
        request: RequestPermissionRequest,
        turn: &CancellationToken,
    ) -> RequestPermissionResponse {
        let Some(handler) = self.current() else {
            tracing::debug!(
                "No permission handler, cancelling request for tool call {}",
                request.tool_call.tool_call_id
            );
            return RequestPermissionResponse::cancelled();
        };

        let request = PermissionRequest::from(request);
        let tool_call_id = request.tool_call.tool_call_id.clone();
        let options = request.options.clone();

        let decision = tokio::select! {
            decision = handler.handle(request) => decision,
            _ = turn.cancelled() => {
                tracing::info!("Permission request for {} cancelled with the turn", tool_call_id);
                return RequestPermissionResponse::cancelled();
            }
        };

        match decision {
            Ok(decision) => outcome_for(decision, &options, &tool_call_id),
            Err(e) => {
                tracing::error!("Permission handler failed for {}: {}", tool_call_id, e);
                RequestPermissionResponse::cancelled()
            }
        }
    }
}

fn outcome_for(
    decision: PermissionHandlerResponse,
    options: &[PermissionOption],
    tool_call_id: &str,
) -> RequestPermissionResponse {
    match decision {
        PermissionHandlerResponse::Granted {
            option_id: Some(option_id),
        } => {
            if options.iter().any(|o| o.option_id == option_id) {
                RequestPermissionResponse::selected(option_id)
            } else {
                tracing::warn!(
                    "Permission handler chose option '{}' not offered for {}",
                    option_id,
                    tool_call_id
                );
                RequestPermissionResponse::cancelled()
            }
        }
        PermissionHandlerResponse::Granted { option_id: None } => {
            match options.iter().find(|o| o.kind.is_allow()) {
                Some(option) => RequestPermissionResponse::selected(option.option_id.clone()),
                None => {
                    tracing::warn!("No allow option offered for {}", tool_call_id);
                    RequestPermissionResponse::cancelled()
                }
            }
        }
        PermissionHandlerResponse::Denied { reason } => {
            tracing::info!(
                "Permission denied for {}: {}",
                tool_call_id,
                reason.as_deref().unwrap_or("no reason given")
            );
            RequestPermissionResponse::cancelled()
        }
    }
}
