//! Console prompt for permission requests
//!
//! Used by the CLI: prints the tool call and its options on stderr and reads
//! a numbered choice from the console input it shares with the prompt loop.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::permission::{PermissionHandler, PermissionHandlerResponse, PermissionRequest};
use crate::protocol::PermissionOption;

/// Lines typed at the console
///
/// Holding the lock makes the holder the only reader until it lets go.
pub type ConsoleInput = Arc<Mutex<mpsc::UnboundedReceiver<String>>>;

/// One reader for stdin, shared by every consumer of console lines
///
/// A pending stdin read cannot be cancelled, so the process should exit
/// explicitly rather than wait for the runtime to shut down.
pub fn console_input() -> ConsoleInput {
    spawn_line_reader(tokio::io::stdin())
}

/// Forward the lines of `reader` until it ends or nobody listens
pub fn spawn_line_reader<R>(reader: R) -> ConsoleInput
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to read console input: {}", e);
                    break;
                }
            }
        }
    });
    Arc::new(Mutex::new(rx))
}

/// Asks the person at the terminal
#[derive(Debug)]
pub struct ConsolePermissionHandler {
    input: ConsoleInput,
}

impl ConsolePermissionHandler {
    pub fn new(input: ConsoleInput) -> Self {
        Self { input }
    }

    fn render(request: &PermissionRequest) -> String {
        let mut out = String::new();
        out.push_str("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
        out.push_str("🔐 PERMISSION REQUEST\n");
        out.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
        out.push_str(&format!("\nTool call: {}\n", request.tool_call.tool_call_id));
        if let Some(description) = &request.description {
            out.push_str(&format!("Action: {}\n", description));
        }
        out.push_str(&format!("Risk: {:?}\n", request.risk));
        out.push_str("\nAvailable options:\n");
        for (idx, option) in request.options.iter().enumerate() {
            out.push_str(&format!("  {}. {} - {:?}\n", idx + 1, option.name, option.kind));
        }
        out.push_str("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
        out.push_str(&format!("Enter your choice (1-{}): ", request.options.len()));
        out
    }
}

/// Map a typed line to a decision; anything unusable denies
pub fn parse_choice(input: &str, options: &[PermissionOption]) -> PermissionHandlerResponse {
    let trimmed = input.trim();
    let Ok(selection) = trimmed.parse::<usize>() else {
        return PermissionHandlerResponse::deny(format!("Not a valid number: {}", trimmed));
    };
    match selection.checked_sub(1).and_then(|idx| options.get(idx)) {
        Some(option) if option.kind.is_allow() => {
            PermissionHandlerResponse::allow(option.option_id.clone())
        }
        Some(option) => PermissionHandlerResponse::deny(format!("Rejected: {}", option.name)),
        None => PermissionHandlerResponse::deny(format!(
            "Selection {} is out of range (1-{})",
            selection,
            options.len()
        )),
    }
}

#[async_trait]
impl PermissionHandler for ConsolePermissionHandler {
    async fn handle(&self, request: PermissionRequest) -> Result<PermissionHandlerResponse> {
        // one prompt on screen at a time
        let mut input = self.input.lock().await;

        let mut stderr = std::io::stderr();
        stderr.write_all(Self::render(&request).as_bytes())?;
        stderr.flush()?;

        let decision = match input.recv().await {
            Some(line) => parse_choice(&line, &request.options),
            None => PermissionHandlerResponse::deny("Console input closed"),
        };
        match &decision {
            PermissionHandlerResponse::Granted { option_id } => {
                eprintln!("✓ Selected: {}\n", option_id.as_deref().unwrap_or("allow"));
            }
            PermissionHandlerResponse::Denied { reason } => {
                eprintln!("✗ Denied: {}\n", reason.as_deref().unwrap_or("no reason"));
            }
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::RiskLevel;
    use crate::protocol::{PermissionOptionKind, ToolCallUpdate};

    fn options() -> Vec<PermissionOption> {
        vec![
            PermissionOption {
                option_id: "allow-once".to_string(),
                name: "Allow Once".to_string(),
                kind: PermissionOptionKind::AllowOnce,
            },
            PermissionOption {
                option_id: "reject-once".to_string(),
                name: "Reject Once".to_string(),
                kind: PermissionOptionKind::RejectOnce,
            },
        ]
    }

    #[test]
    fn test_parse_allow_choice() {
        assert_eq!(
            parse_choice("1\n", &options()),
            PermissionHandlerResponse::allow("allow-once")
        );
    }

    #[test]
    fn test_parse_reject_choice_denies() {
        assert!(matches!(
            parse_choice("2", &options()),
            PermissionHandlerResponse::Denied { .. }
        ));
    }

    #[test]
    fn test_parse_invalid_input_denies() {
        for input in ["", "abc", "0", "3"] {
            assert!(
                matches!(
                    parse_choice(input, &options()),
                    PermissionHandlerResponse::Denied { .. }
                ),
                "input {:?}",
                input
            );
        }
    }

    fn request() -> PermissionRequest {
        PermissionRequest {
            session_id: "s1".to_string(),
            tool_call: ToolCallUpdate {
                tool_call_id: "tc-1".to_string(),
                title: Some("Run tests".to_string()),
                ..Default::default()
            },
            options: options(),
            description: Some("Run tests".to_string()),
            risk: RiskLevel::High,
        }
    }

    #[test]
    fn test_render_lists_options() {
        let text = ConsolePermissionHandler::render(&request());
        assert!(text.contains("Tool call: tc-1"));
        assert!(text.contains("Action: Run tests"));
        assert!(text.contains("  2. Reject Once"));
        assert!(text.ends_with("Enter your choice (1-2): "));
    }

    #[tokio::test]
    async fn test_prompt_loop_and_handler_share_one_reader() {
        let input = spawn_line_reader(&b"ping\n1\nnext prompt\n"[..]);
        let handler = ConsolePermissionHandler::new(input.clone());

        assert_eq!(input.lock().await.recv().await.as_deref(), Some("ping"));
        assert_eq!(
            handler.handle(request()).await.unwrap(),
            PermissionHandlerResponse::allow("allow-once")
        );
        assert_eq!(input.lock().await.recv().await.as_deref(), Some("next prompt"));

        assert!(matches!(
            handler.handle(request()).await.unwrap(),
            PermissionHandlerResponse::Denied { .. }
        ));
    }
}
