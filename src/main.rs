use anyhow::Result;
use cctm_engine::config::Config;
use cctm_engine::engine::Engine;
use cctm_engine::mcp::handler::ToolHandler;
use rust_mcp_schema::{Implementation, InitializeResult, ServerCapabilities, ServerCapabilitiesTools, LATEST_PROTOCOL_VERSION};
use rust_mcp_sdk::error::McpSdkError;
use rust_mcp_sdk::mcp_server::server_runtime::create_server;
use rust_mcp_sdk::McpServer;
use rust_mcp_transport::{StdioTransport, TransportOptions};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cctm_engine={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))
}

fn get_server_details() -> InitializeResult {
    InitializeResult {
        server_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            logging: Some(Default::default()),
            ..Default::default()
        },
        meta: None,
        instructions: Some(
            "Terminal session engine. Create sessions with `create_session`, drive them with `send_input`, \
            and route natural-language commands with `dispatch_command`. Session state changes are delivered \
            as logging notifications from the `session_event` logger."
                .to_string(),
        ),
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

fn map_mcp_sdk_error(err: McpSdkError) -> anyhow::Error {
    anyhow::anyhow!("MCP SDK Error: {:?}", err)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting cctm-engine");
    tracing::debug!("Loaded configuration: {:?}", config);

    if config.default_shell.as_deref().map_or(false, |shell| which::which(shell).is_err()) {
        tracing::warn!(shell = ?config.default_shell, "Configured DEFAULT_SHELL not found in PATH; session creation will fail");
    }

    let engine = Arc::new(Engine::new(config));
    engine.start().await;
    let handler = ToolHandler::new(engine.clone());

    tracing::info!("Using STDIO transport mode.");
    let transport = StdioTransport::new(TransportOptions::default())
        .map_err(|e| anyhow::anyhow!("Failed to create StdioTransport: {}", e))?;
    let server = create_server(get_server_details(), transport, handler);

    tokio::select! {
        result = server.start() => {
            if let Err(e) = result.map_err(map_mcp_sdk_error) {
                tracing::error!(error = %e, "Command surface failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received");
        }
    }

    engine.shutdown().await;
    tracing::info!("Server shutdown.");
    Ok(())
}
