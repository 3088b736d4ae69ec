use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::mcp::schemas::*;
use crate::monitor::ResourceBudgets;
use crate::session::types::{Rect, Session, SessionEvent, SessionId, SessionOptions};
use crate::utils::audit_logger::AuditLogger;
use crate::utils::path_utils::validate_working_dir;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::CallToolError;
use rust_mcp_schema::{
    CallToolRequest, CallToolResult, CallToolResultContentItem, ListToolsRequest, ListToolsResult,
    LoggingLevel, LoggingMessageNotificationParams, RpcError, TextContent, Tool,
};
use rust_mcp_sdk::mcp_server::ServerHandler;
use rust_mcp_sdk::McpServer;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

const EVENT_LOGGER: &str = "session_event";

fn tool(name: &str, description: &str, input_schema: Value) -> Option<Tool> {
    let value = json!({ "name": name, "description": description, "inputSchema": input_schema });
    match serde_json::from_value(value) {
        Ok(tool) => Some(tool),
        Err(e) => {
            error!(tool = name, error = %e, "Invalid tool schema");
            None
        }
    }
}

fn json_result(value: &Value) -> Result<CallToolResult, CallToolError> {
    let text = serde_json::to_string_pretty(value).map_err(AppError::from)?;
    Ok(CallToolResult {
        content: vec![CallToolResultContentItem::TextContent(TextContent::new(text, None))],
        meta: None,
        is_error: Some(false),
    })
}

type SessionLocks = Arc<StdMutex<HashMap<String, Arc<TokioMutex<()>>>>>;

/// Holds one session's turn on the command surface. The table entry goes away
/// with the last holder.
struct SessionTurn {
    key: String,
    lock: Arc<TokioMutex<()>>,
    locks: SessionLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionTurn {
    fn drop(&mut self) {
        self.guard.take();
        if let Ok(mut locks) = self.locks.lock() {
            // One reference in the table, one here.
            if Arc::strong_count(&self.lock) == 2 {
                locks.remove(&self.key);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionIdParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct GetSessionParams {
    session_id: String,
    #[serde(default)]
    tail: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ListSessionsParams {
    #[serde(default)]
    include_output: bool,
}

#[derive(Debug, Deserialize)]
struct SendInputParams {
    session_id: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct UpdatePositionParams {
    session_id: String,
    position: Rect,
}

#[derive(Debug, Deserialize)]
struct SetOpacityParams {
    session_id: String,
    opacity: f64,
}

#[derive(Debug, Deserialize)]
struct SetPopupParams {
    session_id: String,
    is_popup: bool,
}

#[derive(Debug, Deserialize)]
struct DispatchCommandParams {
    session_id: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct ProbeProjectParams {
    path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct SetLimitsParams {
    #[serde(default)]
    max_sessions: Option<usize>,
    #[serde(default)]
    session_memory_budget_mb: Option<u64>,
    #[serde(default)]
    cpu_alert_fraction: Option<f64>,
}

fn session_id(raw: &str) -> AppResult<SessionId> {
    raw.parse()
}

fn trim_output(mut session: Session, keep: usize) -> Session {
    let skip = session.output.len().saturating_sub(keep);
    session.output.drain(..skip);
    session
}

/// Maps tool calls onto engine operations. Calls naming the same `session_id`
/// run one at a time, in arrival order.
pub struct ToolHandler {
    engine: Arc<Engine>,
    audit: Option<AuditLogger>,
    session_locks: SessionLocks,
    events: TokioMutex<broadcast::Receiver<SessionEvent>>,
}

impl std::fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandler").field("audit", &self.audit).finish_non_exhaustive()
    }
}

impl ToolHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        let audit = engine
            .config()
            .audit_log_file()
            .map(|path| AuditLogger::new(path, engine.config().audit_log_max_size_bytes));
        let events = TokioMutex::new(engine.pool().subscribe());
        Self {
            engine,
            audit,
            session_locks: Arc::new(StdMutex::new(HashMap::new())),
            events,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        [
            // Sessions
            ("create_session", "Start a new terminal session in a working directory.", create_session_schema()),
            ("get_session", "Get one session, including its buffered output.", get_session_schema()),
            ("list_sessions", "List all sessions, oldest first.", list_sessions_schema()),
            ("send_input", "Write a line of input to a session.", send_input_schema()),
            ("terminate_session", "Stop a live session.", session_id_schema()),
            ("purge_session", "Remove the record of an ended session.", session_id_schema()),
            ("update_position", "Move or resize a session.", update_position_schema()),
            ("set_opacity", "Set a session's opacity.", set_opacity_schema()),
            ("set_popup", "Mark a session as popup or regular.", set_popup_schema()),
            // Conversation
            ("dispatch_command", "Send a natural-language command to the session's capability provider.", dispatch_command_schema()),
            ("probe_project", "Classify the project in a directory.", probe_project_schema()),
            // Capabilities
            ("list_capabilities", "List known capability providers and their state.", empty_schema()),
            ("discover_capabilities", "Rescan provider manifest directories.", empty_schema()),
            // Config
            ("get_config", "Get engine configuration and current limits.", empty_schema()),
            ("set_limits", "Change the session ceiling and resource budgets.", set_limits_schema()),
        ]
        .into_iter()
        .filter_map(|(name, description, schema)| tool(name, description, schema))
        .collect()
    }

    fn is_known_tool(&self, name: &str) -> bool {
        self.list_tools().iter().any(|t| t.name == name)
    }

    async fn session_turn(&self, key: &str) -> SessionTurn {
        let lock = match self.session_locks.lock() {
            Ok(mut locks) => locks.entry(key.to_string()).or_default().clone(),
            Err(poisoned) => poisoned.into_inner().entry(key.to_string()).or_default().clone(),
        };
        let guard = lock.clone().lock_owned().await;
        SessionTurn {
            key: key.to_string(),
            lock,
            locks: self.session_locks.clone(),
            guard: Some(guard),
        }
    }

    /// Session events queued since the last call, oldest first.
    async fn drain_events(&self) -> Vec<SessionEvent> {
        let mut events = self.events.lock().await;
        let mut drained = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => drained.push(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session event backlog overflowed; oldest events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        drained
    }

    /// Forwards queued session events to the client as logging notifications.
    async fn publish_events(&self, runtime: &dyn McpServer) {
        for event in self.drain_events().await {
            let data = match serde_json::to_value(&event) {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "Unserializable session event");
                    continue;
                }
            };
            let params = LoggingMessageNotificationParams {
                data,
                level: LoggingLevel::Info,
                logger: Some(EVENT_LOGGER.to_string()),
            };
            if let Err(e) = runtime.send_logging_message(params).await {
                debug!(error = ?e, "Could not deliver session event");
                break;
            }
        }
    }

    #[instrument(skip(self, args), fields(tool_name = %name))]
    pub async fn call_tool(&self, name: &str, args: Value) -> AppResult<Value> {
        info!("Handling call_tool request for: {}", name);
        let key = args.get("session_id").and_then(Value::as_str).map(str::to_owned);
        let _turn = match &key {
            Some(key) => Some(self.session_turn(key).await),
            None => None,
        };
        if let Some(audit) = &self.audit {
            audit.log_tool_call(name, &args).await;
        }
        let args = if args.is_null() { json!({}) } else { args };

        // Helper macro to parse args into a params struct
        macro_rules! params {
            ($param_type:ty) => {
                serde_json::from_value::<$param_type>(args.clone())
                    .map_err(|e| AppError::InvalidInputArgument(format!("{}: {}", name, e)))?
            };
        }

        let engine = &self.engine;
        let pool = engine.pool();
        match name {
            "create_session" => {
                let options = params!(SessionOptions);
                let id = pool.create_with(options).await?;
                Ok(serde_json::to_value(pool.get(&id).await?)?)
            }
            "get_session" => {
                let p = params!(GetSessionParams);
                let session = pool.get(&session_id(&p.session_id)?).await?;
                let session = match p.tail {
                    Some(keep) => trim_output(session, keep),
                    None => session,
                };
                Ok(serde_json::to_value(session)?)
            }
            "list_sessions" => {
                let p = params!(ListSessionsParams);
                let sessions: Vec<Session> = pool
                    .list()
                    .await
                    .into_iter()
                    .map(|s| if p.include_output { s } else { trim_output(s, 0) })
                    .collect();
                Ok(json!({ "sessions": sessions, "active": pool.active_count(), "max_sessions": pool.max_sessions() }))
            }
            "send_input" => {
                let p = params!(SendInputParams);
                let id = session_id(&p.session_id)?;
                pool.send_input(&id, &p.text).await?;
                Ok(json!({ "session_id": id, "sent": true }))
            }
            "terminate_session" => {
                let p = params!(SessionIdParams);
                let id = session_id(&p.session_id)?;
                pool.terminate(&id).await?;
                Ok(serde_json::to_value(pool.get(&id).await?)?)
            }
            "purge_session" => {
                let p = params!(SessionIdParams);
                let id = session_id(&p.session_id)?;
                pool.purge(&id).await?;
                engine.bridge().forget(&id);
                Ok(json!({ "session_id": id, "purged": true }))
            }
            "update_position" => {
                let p = params!(UpdatePositionParams);
                let id = session_id(&p.session_id)?;
                pool.update_position(&id, p.position).await?;
                Ok(json!({ "session_id": id, "position": p.position }))
            }
            "set_opacity" => {
                let p = params!(SetOpacityParams);
                let id = session_id(&p.session_id)?;
                pool.set_opacity(&id, p.opacity).await?;
                Ok(json!({ "session_id": id, "opacity": p.opacity }))
            }
            "set_popup" => {
                let p = params!(SetPopupParams);
                let id = session_id(&p.session_id)?;
                pool.set_popup(&id, p.is_popup).await?;
                Ok(json!({ "session_id": id, "is_popup": p.is_popup }))
            }
            "dispatch_command" => {
                let p = params!(DispatchCommandParams);
                let id = session_id(&p.session_id)?;
                let reply = engine.bridge().dispatch(&id, &p.input).await?;
                Ok(serde_json::to_value(reply)?)
            }
            "probe_project" => {
                let p = params!(ProbeProjectParams);
                let dir = validate_working_dir(&p.path)?;
                let probe = engine.probe().clone();
                let context = tokio::task::spawn_blocking(move || probe.probe(&dir))
                    .await
                    .map_err(|e| AppError::ProcessFault(format!("probe task failed: {}", e)))?;
                Ok(serde_json::to_value(context)?)
            }
            "list_capabilities" => Ok(json!({ "providers": engine.registry().list().await })),
            "discover_capabilities" => Ok(serde_json::to_value(engine.registry().discover().await)?),
            "get_config" => Ok(json!({
                "config": engine.config().as_ref(),
                "max_sessions": pool.max_sessions(),
                "budgets": engine.monitor().budgets(),
                "utilization": engine.monitor().utilization(),
            })),
            "set_limits" => {
                let p = params!(SetLimitsParams);
                self.set_limits(p)
            }
            _ => {
                error!("Unknown tool called: {}", name);
                Err(AppError::InvalidInputArgument(format!("unknown tool '{}'", name)))
            }
        }
    }

    fn set_limits(&self, p: SetLimitsParams) -> AppResult<Value> {
        let monitor = self.engine.monitor();
        let current = monitor.budgets();
        let memory_bytes = match p.session_memory_budget_mb {
            Some(0) => return Err(AppError::OutOfRange("session_memory_budget_mb must be positive".to_string())),
            Some(mb) => mb.saturating_mul(1024 * 1024),
            None => current.memory_bytes,
        };
        let cpu_alert_fraction = match p.cpu_alert_fraction {
            Some(f) if !(f > 0.0 && f <= 1.0) => {
                return Err(AppError::OutOfRange(format!("cpu_alert_fraction must be within (0, 1], got {}", f)))
            }
            Some(f) => f,
            None => current.cpu_alert_fraction,
        };
        if let Some(max) = p.max_sessions {
            self.engine.pool().set_max_sessions(max)?;
        }
        let budgets = ResourceBudgets {
            memory_bytes,
            cpu_alert_fraction,
        };
        monitor.set_budgets(budgets);
        info!(?budgets, max_sessions = self.engine.pool().max_sessions(), "Limits updated");
        Ok(json!({ "max_sessions": self.engine.pool().max_sessions(), "budgets": budgets }))
    }
}

#[async_trait]
impl ServerHandler for ToolHandler {
    #[instrument(skip(self, _request, runtime))]
    async fn handle_list_tools_request(
        &self,
        _request: ListToolsRequest,
        runtime: &dyn McpServer,
    ) -> Result<ListToolsResult, RpcError> {
        self.publish_events(runtime).await;
        Ok(ListToolsResult {
            tools: self.list_tools(),
            meta: None,
            next_cursor: None,
        })
    }

    #[instrument(skip(self, request, runtime), fields(tool_name = %request.params.name))]
    async fn handle_call_tool_request(
        &self,
        request: CallToolRequest,
        runtime: &dyn McpServer,
    ) -> Result<CallToolResult, CallToolError> {
        let name = request.params.name.clone();
        if !self.is_known_tool(&name) {
            error!("Unknown tool called: {}", name);
            return Err(CallToolError::unknown_tool(name));
        }
        let args = Value::Object(request.params.arguments.clone().unwrap_or_default());
        let outcome = self.engine.run_cancellable(self.call_tool(&name, args)).await;
        self.publish_events(runtime).await;
        json_result(&outcome?)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::monitor::testing::FixedSampler;
    use std::time::Duration;

    fn handler(state_dir: Option<PathBuf>) -> ToolHandler {
        let config = Config {
            default_shell: Some("sh".into()),
            provider_dirs: Vec::new(),
            state_dir,
            ..Config::default()
        };
        ToolHandler::new(Arc::new(Engine::with_sampler(config, Box::new(FixedSampler::default()))))
    }

    #[test]
    fn every_tool_has_a_schema() {
        let handler = handler(None);
        let tools = handler.list_tools();
        assert_eq!(tools.len(), 15);
        for tool in &tools {
            let schema = serde_json::to_value(&tool.input_schema).unwrap();
            assert_eq!(schema["type"], "object", "{}", tool.name);
        }
        assert!(handler.is_known_tool("dispatch_command"));
        assert!(!handler.is_known_tool("no_such_tool"));
    }

    #[tokio::test]
    async fn session_tools_round_trip() {
        let state = tempfile::tempdir().unwrap();
        let handler = handler(Some(state.path().to_path_buf()));
        let dir = tempfile::tempdir().unwrap();

        let created = handler
            .call_tool("create_session", json!({ "working_dir": dir.path(), "title": "work" }))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["title"], "work");

        let err = handler
            .call_tool("set_opacity", json!({ "session_id": id, "opacity": 1.5 }))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::OutOfRange(_)));

        handler
            .call_tool("send_input", json!({ "session_id": id, "text": "echo hi" }))
            .await
            .unwrap();
        let listed = handler.call_tool("list_sessions", Value::Null).await.unwrap();
        assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);
        assert_eq!(listed["sessions"][0]["output"], json!([]));

        let ended = handler
            .call_tool("terminate_session", json!({ "session_id": id }))
            .await
            .unwrap();
        assert_eq!(ended["status"], "completed");
        handler.call_tool("purge_session", json!({ "session_id": id })).await.unwrap();
        let err = handler.call_tool("get_session", json!({ "session_id": id })).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        // Every call lands in the audit log.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let audit = std::fs::read_to_string(state.path().join("logs").join("tool_calls.log")).unwrap();
        assert!(audit.contains("create_session"));
        assert!(audit.contains("purge_session"));
    }

    #[tokio::test]
    async fn calls_for_one_session_take_turns() {
        let handler = Arc::new(handler(None));
        let first = handler.session_turn("a").await;

        let waiting = {
            let handler = handler.clone();
            tokio::spawn(async move {
                let _turn = handler.session_turn("a").await;
            })
        };
        // Another session is not held up.
        let other = tokio::time::timeout(Duration::from_millis(50), handler.session_turn("b")).await;
        assert!(other.is_ok());
        drop(other);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        drop(first);
        waiting.await.unwrap();
        assert!(handler.session_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_events_are_drained_in_order() {
        let handler = handler(None);
        let dir = tempfile::tempdir().unwrap();
        let created = handler
            .call_tool("create_session", json!({ "working_dir": dir.path() }))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        handler
            .call_tool("terminate_session", json!({ "session_id": id }))
            .await
            .unwrap();

        let events: Vec<Value> = handler
            .drain_events()
            .await
            .iter()
            .map(|e| serde_json::to_value(e).unwrap())
            .filter(|e| e["session_id"] == id.as_str())
            .collect();
        assert_eq!(events.first().unwrap()["event"], "created");
        assert!(events.iter().any(|e| e["event"] == "terminated"));
        assert!(handler.drain_events().await.is_empty());
    }

    #[tokio::test]
    async fn set_limits_validates_and_applies() {
        let handler = handler(None);
        let err = handler.call_tool("set_limits", json!({ "max_sessions": 0 })).await.unwrap_err();
        assert!(matches!(err, AppError::OutOfRange(_)));
        let result = handler
            .call_tool("set_limits", json!({ "max_sessions": 3, "session_memory_budget_mb": 64 }))
            .await
            .unwrap();
        assert_eq!(result["max_sessions"], 3);
        assert_eq!(handler.engine().monitor().budgets().memory_bytes, 64 * 1024 * 1024);

        let err = handler.call_tool("no_such_tool", json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInputArgument(_)));
        let err = handler.call_tool("get_session", json!({ "session_id": "nope" })).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
