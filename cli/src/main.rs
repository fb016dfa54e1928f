//! ACP Bridge CLI
//!
//! Drives an ACP agent from the command line: connects, sends one prompt (or
//! reads prompts from stdin), prints the stream events and answers
//! permission requests on the console.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use acp_bridge_lib::{
    console_input, create_client, handler_fn, AgentClient, ClientConfig, ConsoleInput,
    ConsolePermissionHandler, LocalFileSystem, MessageOptions, MessageRole, PermissionHandlerResponse, PermissionRequest,
    StreamEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// JSON-RPC framed by this client
    Process,
    /// Delegate to the agent-client-protocol SDK
    Sdk,
}

impl Transport {
    fn implementation(self) -> &'static str {
        match self {
            Transport::Process => "process",
            Transport::Sdk => "sdk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Agent text as it streams, other events summarised
    Text,
    /// One JSON object per event
    Json,
}

/// ACP Bridge - drive an Agent Client Protocol agent from the terminal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Agent executable; overrides the config file
    command: Option<String>,

    /// Arguments passed to the agent
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Configuration file (.json, .toml, .yaml or .yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session working directory (defaults to the current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Prompt to send; reads prompts from stdin when omitted
    #[arg(short, long)]
    prompt: Option<String>,

    #[arg(short, long, value_enum, default_value_t = Transport::Process)]
    transport: Transport,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Grant every permission request with its first allow option
    #[arg(short = 'y', long)]
    yes: bool,

    /// Serve the agent's file requests from the local disk
    #[arg(long)]
    allow_fs: bool,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// Load a config file, picking the format from its extension
fn load_config(path: &Path) -> Result<ClientConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ClientConfig = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&text)
            .with_context(|| format!("Invalid TOML in {}", path.display()))?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?,
        Some("json") | None => serde_json::from_str(&text)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?,
        Some(other) => bail!("Unsupported config format: .{}", other),
    };
    Ok(config)
}

/// Merge the command line over the config file
fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ClientConfig::default(),
    };

    if let Some(command) = &cli.command {
        config.command = command.clone();
        config.args = cli.args.clone();
    }
    if let Some(cwd) = &cli.cwd {
        config.cwd = std::path::absolute(cwd)
            .with_context(|| format!("Invalid working directory {}", cwd.display()))?;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_event(event: &StreamEvent, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    use std::io::Write;
    match event {
        StreamEvent::TextDelta {
            text,
            role: MessageRole::Agent,
        } => {
            print!("{}", text);
            std::io::stdout().flush()?;
        }
        StreamEvent::TextDelta { .. } => {}
        StreamEvent::ThoughtDelta { text } => eprint!("{}", text),
        StreamEvent::ToolCallStart {
            id, title, status, ..
        } => eprintln!("\n[tool {}] {} ({:?})", id, title, status),
        StreamEvent::ToolCallDelta { id, status, .. } => {
            if let Some(status) = status {
                eprintln!("[tool {}] {:?}", id, status);
            }
        }
        StreamEvent::ToolCallComplete { id, status, .. } => {
            eprintln!("[tool {}] done: {:?}", id, status)
        }
        StreamEvent::Plan { entries } => {
            eprintln!("\n[plan]");
            for entry in entries {
                eprintln!("  {}. {} ({:?})", entry.id, entry.title, entry.status);
            }
        }
        StreamEvent::AvailableCommands { commands } => {
            let names: Vec<_> = commands.iter().map(|c| c.name.as_str()).collect();
            eprintln!("[commands] {}", names.join(", "));
        }
        StreamEvent::ModeChange { mode_id } => eprintln!("[mode] {}", mode_id),
        StreamEvent::ConfigOptionChange { options } => {
            eprintln!("[config] {} option(s)", options.len())
        }
        StreamEvent::SessionInfo { title, .. } => {
            if let Some(title) = title {
                eprintln!("[session] {}", title);
            }
        }
        StreamEvent::MessageComplete { stop_reason } => {
            println!();
            eprintln!("[done] {:?}", stop_reason);
        }
        StreamEvent::Error { message, code } => match code {
            Some(code) => eprintln!("\n[error {}] {}", code, message),
            None => eprintln!("\n[error] {}", message),
        },
    }
    Ok(())
}

/// Send one prompt and print its events; whether the turn ended cleanly
///
/// Ctrl-C cancels the turn, whose remaining events are still printed.
async fn run_turn(client: &dyn AgentClient, prompt: &str, format: OutputFormat) -> Result<bool> {
    let mut events = client.send_message(prompt, MessageOptions::default())?;
    let mut ok = true;
    let mut cancelled = false;
    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                eprintln!("\n[cancelling]");
                cancelled = true;
                client.cancel().await;
                continue;
            }
        };
        let Some(event) = event else { break };
        if matches!(event, StreamEvent::Error { .. }) {
            ok = false;
        }
        print_event(&event, format)?;
    }
    Ok(ok)
}

async fn run(cli: Cli, config: ClientConfig) -> Result<bool> {
    let client = create_client(config, Some(cli.transport.implementation()))?;
    let input = console_input();

    if cli.yes {
        client.set_permission_handler(handler_fn(|_request: PermissionRequest| async {
            Ok(PermissionHandlerResponse::Granted { option_id: None })
        }));
    } else {
        client.set_permission_handler(Arc::new(ConsolePermissionHandler::new(input.clone())));
    }
    if cli.allow_fs {
        client.set_file_system_handler(Arc::new(LocalFileSystem::new()));
    }

    let session = client.connect().await.context("Failed to connect to agent")?;
    tracing::info!("Session {} in {}", session.id, session.cwd.display());

    let result = match &cli.prompt {
        Some(prompt) => run_turn(client.as_ref(), prompt, cli.format).await,
        None => interactive(client.as_ref(), &input, cli.format).await,
    };

    client.disconnect().await;
    result
}

/// Read prompts until end of input or Ctrl-C at the prompt
async fn interactive(
    client: &dyn AgentClient,
    input: &ConsoleInput,
    format: OutputFormat,
) -> Result<bool> {
    let mut ok = true;
    loop {
        eprint!("> ");
        let line = tokio::select! {
            line = async { input.lock().await.recv().await } => line,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if !client.is_connected() {
            bail!("Agent connection lost");
        }
        ok &= run_turn(client, prompt, format).await?;
    }
    Ok(ok)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.clone().unwrap_or_else(|| "info".to_string());
    init_tracing(&level, cli.json_logs);

    let config = build_config(&cli)?;
    let ok = match run(cli, config).await {
        Ok(ok) => ok,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            false
        }
    };
    // the console reader may be parked in a stdin read the runtime would wait on
    std::process::exit(if ok { 0 } else { 1 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(suffix: &str, body: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_json_config() {
        let file = write_config(
            ".json",
            r#"{"command": "my-agent", "args": ["--acp"], "cwd": "/tmp/proj"}"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.command, "my-agent");
        assert_eq!(config.args, vec!["--acp"]);
        assert_eq!(config.cwd, PathBuf::from("/tmp/proj"));
    }

    #[test]
    fn test_load_toml_config() {
        let file = write_config(
            ".toml",
            "command = \"my-agent\"\ncwd = \"/tmp/proj\"\nkill_grace_period_ms = 100\n\n[capabilities]\nterminal = false\n",
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.kill_grace_period_ms, 100);
        assert!(!config.capabilities.terminal);
        assert!(config.capabilities.read_text_file);
    }

    #[test]
    fn test_load_yaml_config() {
        let file = write_config(
            ".yaml",
            "command: my-agent\ncwd: /tmp/proj\nmcp_servers:\n  - name: files\n    command: mcp-files\n",
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.mcp_servers.len(), 1);
        assert_eq!(config.mcp_servers[0].name, "files");
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = write_config(".ini", "command=x");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_command_line_overrides_config() {
        let file = write_config(".json", r#"{"command": "from-file", "cwd": "/tmp"}"#);
        let cli = Cli::parse_from([
            "acp-bridge",
            "--config",
            file.path().to_str().unwrap(),
            "--cwd",
            "/tmp/proj",
            "my-agent",
            "--acp",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.command, "my-agent");
        assert_eq!(config.args, vec!["--acp"]);
        assert_eq!(config.cwd, PathBuf::from("/tmp/proj"));
    }

    #[test]
    fn test_missing_command_fails_validation() {
        let cli = Cli::parse_from(["acp-bridge", "--prompt", "hi"]);
        assert!(build_config(&cli).is_err());
    }
}
