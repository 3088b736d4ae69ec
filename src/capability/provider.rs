//! The `Capability` seam and its process-backed implementation, an MCP client
//! that launches the provider as a subprocess and calls its `respond` tool.

use crate::bridge::ConversationTurn;
use crate::capability::descriptor::ProviderDescriptor;
use crate::error::{AppError, AppResult};
use crate::project::ProjectContext;
use crate::session::types::SessionId;
use async_trait::async_trait;
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, Implementation, InitializeRequestParams,
    LATEST_PROTOCOL_VERSION,
};
use rust_mcp_sdk::mcp_client::{client_runtime, ClientHandler, ClientRuntime};
use rust_mcp_sdk::McpClient;
use rust_mcp_transport::{StdioTransport, TransportOptions};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RESPOND_TOOL: &str = "respond";

/// What a provider receives for one conversational command.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityRequest {
    pub session_id: SessionId,
    pub input: String,
    pub project: ProjectContext,
    /// Most recent turns, oldest first.
    pub history: Vec<ConversationTurn>,
}

#[async_trait]
pub trait Capability: Send + Sync {
    async fn respond(&self, request: CapabilityRequest) -> AppResult<String>;
    async fn health_check(&self) -> AppResult<()>;
    async fn shutdown(&self);
}

/// Turns a descriptor into a live capability.
#[async_trait]
pub trait ProviderLauncher: Send + Sync {
    async fn launch(&self, descriptor: &ProviderDescriptor) -> AppResult<Arc<dyn Capability>>;
}

fn sdk_fault(provider: &str, what: &str, err: impl std::fmt::Debug) -> AppError {
    AppError::ProcessFault(format!("provider '{}' {}: {:?}", provider, what, err))
}

/// Joins the text items of a tool result. `isError` results become faults.
fn reply_text(provider: &str, result: &CallToolResult) -> AppResult<String> {
    let text = result
        .content
        .iter()
        .filter_map(|item| item.as_text_content().ok())
        .map(|content| content.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if result.is_error == Some(true) {
        return Err(AppError::ProcessFault(format!("provider '{}' reported an error: {}", provider, text)));
    }
    Ok(text)
}

/// Provider-initiated traffic gets the runtime's default handling.
struct ProviderClientHandler;

#[async_trait]
impl ClientHandler for ProviderClientHandler {}

/// A provider subprocess driven through the MCP client runtime.
pub struct StdioCapability {
    id: String,
    client: Arc<ClientRuntime>,
    stopped: AtomicBool,
}

#[async_trait]
impl Capability for StdioCapability {
    async fn respond(&self, request: CapabilityRequest) -> AppResult<String> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AppError::ProcessFault(format!("provider '{}' is stopped", self.id)));
        }
        let arguments = match serde_json::to_value(&request)? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let result = self
            .client
            .call_tool(CallToolRequestParams {
                name: RESPOND_TOOL.to_string(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| sdk_fault(&self.id, "failed to respond", e))?;
        reply_text(&self.id, &result)
    }

    async fn health_check(&self) -> AppResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AppError::ProcessFault(format!("provider '{}' is stopped", self.id)));
        }
        let tools = self
            .client
            .list_tools(None)
            .await
            .map_err(|e| sdk_fault(&self.id, "failed health check", e))?;
        debug!(provider = %self.id, tools = tools.tools.len(), "Provider healthy");
        Ok(())
    }

    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.client.shut_down().await {
            Ok(()) => info!(provider = %self.id, "Provider process stopped"),
            Err(e) => warn!(provider = %self.id, error = ?e, "Failed to stop provider process"),
        }
    }
}

/// Launches manifest providers over a server-launching stdio transport. The
/// client runtime performs the `initialize` handshake before `launch` returns.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

#[async_trait]
impl ProviderLauncher for ProcessLauncher {
    async fn launch(&self, descriptor: &ProviderDescriptor) -> AppResult<Arc<dyn Capability>> {
        let program = descriptor
            .command
            .as_deref()
            .ok_or_else(|| AppError::InvalidInputArgument(format!("provider '{}' has no command", descriptor.id)))?;

        let env: Option<HashMap<String, String>> = if descriptor.env.is_empty() {
            None
        } else {
            Some(descriptor.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        };
        let transport =
            StdioTransport::create_with_server_launch(program, descriptor.args.clone(), env, TransportOptions::default())
                .map_err(|e| sdk_fault(&descriptor.id, "could not prepare transport", e))?;

        let client_details = InitializeRequestParams {
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
        };
        let client = client_runtime::create_client(client_details, transport, ProviderClientHandler);
        client
            .clone()
            .start()
            .await
            .map_err(|e| sdk_fault(&descriptor.id, "failed to start", e))?;
        debug!(provider = %descriptor.id, command = %program, "Provider initialized");

        Ok(Arc::new(StdioCapability {
            id: descriptor.id.clone(),
            client,
            stopped: AtomicBool::new(false),
        }))
    }
}
