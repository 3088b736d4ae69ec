//! Routes conversational commands from a session to a capability provider chosen
//! by the session's project context, keeping a short per-session memory.

use crate::capability::{CapabilityRegistry, CapabilityRequest, ProviderHandle};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::session::types::{SessionEventKind, SessionId};
use crate::session::SessionPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, instrument, warn};

const DISPATCH_BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub session_id: SessionId,
    pub input_text: String,
    pub resolved_provider_id: String,
    pub output_text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReply {
    pub output: String,
    pub provider_id: String,
}

pub struct ConversationalBridge {
    config: Arc<Config>,
    pool: SessionPool,
    registry: Arc<CapabilityRegistry>,
    memories: StdMutex<HashMap<SessionId, VecDeque<ConversationTurn>>>,
    turns: StdMutex<HashMap<SessionId, Arc<TokioMutex<()>>>>,
}

impl std::fmt::Debug for ConversationalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationalBridge").finish_non_exhaustive()
    }
}

impl ConversationalBridge {
    pub fn new(config: Arc<Config>, pool: SessionPool, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            config,
            pool,
            registry,
            memories: StdMutex::new(HashMap::new()),
            turns: StdMutex::new(HashMap::new()),
        }
    }

    /// Sends `input` to the provider for the session's project, falling back to a
    /// default provider. Nothing is remembered unless a reply comes back.
    /// Dispatches to one session run one at a time, in arrival order.
    #[instrument(skip(self, input), fields(sid = %session_id))]
    pub async fn dispatch(&self, session_id: &SessionId, input: &str) -> AppResult<DispatchReply> {
        let turn_lock = self.turn_lock(session_id);
        let _turn = turn_lock.lock().await;
        let (project, status) = self.pool.context(session_id).await?;
        if status.is_terminal() {
            return Err(AppError::InvalidState(format!("session {} is {}", session_id, status)));
        }

        let handle = match self.registry.ensure_ready(project.tag()).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(tag = project.tag(), error = %e, "No provider for project; trying default");
                self.registry.ensure_default().await.map_err(|_| {
                    AppError::NoCapabilityAvailable(format!(
                        "no provider supports '{}' and no default provider is available",
                        project.tag()
                    ))
                })?
            }
        };

        let request = CapabilityRequest {
            session_id: *session_id,
            input: input.to_string(),
            project,
            history: self.recent(session_id),
        };
        let result = self.attempt(&handle, request).await;
        if let Err(e @ AppError::ProcessFault(_)) = &result {
            self.registry.report_failure(&handle, e).await;
        }
        self.registry.release(&handle.provider_id).await;
        let output = result?;

        let turn = ConversationTurn {
            session_id: *session_id,
            input_text: input.to_string(),
            resolved_provider_id: handle.provider_id.clone(),
            output_text: output.clone(),
            timestamp: Utc::now(),
        };
        // The session may have ended while the provider was thinking.
        if matches!(self.pool.context(session_id).await, Ok((_, status)) if !status.is_terminal()) {
            self.remember(turn);
            if self.config.echo_dispatch_output {
                if let Err(e) = self.pool.write_output(session_id, &output).await {
                    warn!(error = %e, "Failed to echo dispatch reply into session");
                }
            }
        }

        info!(provider = %handle.provider_id, "Dispatch completed");
        Ok(DispatchReply {
            output,
            provider_id: handle.provider_id,
        })
    }

    async fn attempt(&self, handle: &ProviderHandle, request: CapabilityRequest) -> AppResult<String> {
        let ceiling = self.config.dispatch_timeout;
        let retries = self.config.dispatch_retries;
        for attempt in 0..=retries {
            if attempt > 0 {
                sleep(DISPATCH_BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }
            match timeout(ceiling, handle.respond(request.clone())).await {
                Ok(result) => return result,
                Err(_) => warn!(provider = %handle.provider_id, attempt, "Dispatch attempt timed out"),
            }
        }
        Err(AppError::Timeout(format!(
            "provider '{}' did not reply within {:?} ({} attempts)",
            handle.provider_id,
            ceiling,
            retries + 1
        )))
    }

    fn turn_lock(&self, session_id: &SessionId) -> Arc<TokioMutex<()>> {
        let mut turns = match self.turns.lock() {
            Ok(turns) => turns,
            Err(poisoned) => poisoned.into_inner(),
        };
        turns.entry(*session_id).or_default().clone()
    }

    fn recent(&self, session_id: &SessionId) -> Vec<ConversationTurn> {
        let window = self.config.conversation_window;
        let memories = match self.memories.lock() {
            Ok(memories) => memories,
            Err(poisoned) => poisoned.into_inner(),
        };
        memories
            .get(session_id)
            .map(|turns| turns.iter().skip(turns.len().saturating_sub(window)).cloned().collect())
            .unwrap_or_default()
    }

    fn remember(&self, turn: ConversationTurn) {
        let capacity = self.config.conversation_history.max(1);
        let mut memories = match self.memories.lock() {
            Ok(memories) => memories,
            Err(poisoned) => poisoned.into_inner(),
        };
        let turns = memories.entry(turn.session_id).or_default();
        if turns.len() == capacity {
            turns.pop_front();
        }
        turns.push_back(turn);
    }

    /// Remembered turns for a session, oldest first.
    pub fn history(&self, session_id: &SessionId) -> Vec<ConversationTurn> {
        match self.memories.lock() {
            Ok(memories) => memories.get(session_id).map(|t| t.iter().cloned().collect()).unwrap_or_default(),
            Err(poisoned) => poisoned
                .into_inner()
                .get(session_id)
                .map(|t| t.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    pub fn forget(&self, session_id: &SessionId) {
        match self.turns.lock() {
            Ok(mut turns) => turns.remove(session_id),
            Err(poisoned) => poisoned.into_inner().remove(session_id),
        };
        let removed = match self.memories.lock() {
            Ok(mut memories) => memories.remove(session_id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(session_id).is_some(),
        };
        if removed {
            debug!(sid = %session_id, "Conversation memory discarded");
        }
    }

    /// Drops memories whose session is gone or ended. Used after missed events.
    async fn prune(&self) {
        let ids: Vec<SessionId> = match self.memories.lock() {
            Ok(memories) => memories.keys().copied().collect(),
            Err(poisoned) => poisoned.into_inner().keys().copied().collect(),
        };
        for id in ids {
            let live = matches!(self.pool.context(&id).await, Ok((_, status)) if !status.is_terminal());
            if !live {
                self.forget(&id);
            }
        }
    }

    /// Forgets conversations as their sessions terminate or are purged.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        let mut events = bridge.pool.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if matches!(event.kind, SessionEventKind::Terminated { .. } | SessionEventKind::Purged) {
                            bridge.forget(&event.session_id);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Bridge listener lagged; pruning conversation memory");
                        bridge.prune().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
