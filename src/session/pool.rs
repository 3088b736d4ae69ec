//! The session pool: single owner of every session's mutable state.
//!
//! Sessions live in an id-keyed table. Each entry sits behind its own async mutex,
//! so all transitions of one session are serialised while unrelated sessions
//! proceed in parallel. The table lock itself is only held for lookups and inserts.

use crate::attention;
use crate::cache::{CacheArea, StateCache};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::monitor::{BudgetViolation, SessionResourceMonitor};
use crate::project::{ProjectContext, ProjectContextProbe};
use crate::session::buffer::OutputBuffer;
use crate::session::process::{self, ExitOutcome, LaunchSpec, ProcessObserver, SessionIo};
use crate::session::types::{
    validate_opacity, Rect, Session, SessionEvent, SessionEventKind, SessionId, SessionOptions,
    SessionStatus, TerminationReason,
};
use crate::utils::path_utils::validate_working_dir;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock as StdRwLock};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as TokioMutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, instrument, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const PROBE_CEILING: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct SessionRecord {
    id: SessionId,
    title: String,
    working_dir: PathBuf,
    project: ProjectContext,
    status: SessionStatus,
    needs_attention: bool,
    opacity: f64,
    output: OutputBuffer,
    position: Rect,
    is_popup: bool,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    last_activity: Instant,
    ended_at: Option<DateTime<Utc>>,
    ended: Option<Instant>,
    exit_code: Option<i32>,
    termination: Option<TerminationReason>,
}

impl SessionRecord {
    /// Marks activity; wall-clock time never moves backwards for a session.
    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
        self.last_activity = Instant::now();
    }
}

#[derive(Debug)]
struct SessionEntry {
    record: SessionRecord,
    io: Option<SessionIo>,
}

impl SessionEntry {
    fn snapshot(&self) -> Session {
        let r = &self.record;
        let pid = if r.status.exposes_process() {
            self.io.as_ref().map(|io| io.pid)
        } else {
            None
        };
        Session {
            id: r.id,
            pid,
            title: r.title.clone(),
            working_dir: r.working_dir.clone(),
            project: r.project.clone(),
            status: r.status,
            needs_attention: r.needs_attention,
            opacity: r.opacity,
            output: r.output.to_vec(),
            position: r.position,
            is_popup: r.is_popup,
            created_at: r.created_at,
            last_activity_at: r.last_activity_at,
            ended_at: r.ended_at,
            exit_code: r.exit_code,
            termination: r.termination.clone(),
        }
    }
}

#[derive(Debug)]
struct SessionSlot {
    seq: u64,
    entry: TokioMutex<SessionEntry>,
}

enum CacheWrite {
    Store(Box<Session>),
    Remove(SessionId),
    Flush(oneshot::Sender<()>),
}

/// Starts the task that applies cache writes one at a time, in submission order.
fn spawn_cache_writer(cache: StateCache) -> mpsc::UnboundedSender<CacheWrite> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(write) = rx.recv().await {
            match write {
                CacheWrite::Store(session) => {
                    cache.store(CacheArea::Sessions, &session.id.to_string(), &session).await;
                }
                CacheWrite::Remove(id) => cache.remove(CacheArea::Sessions, &id.to_string()).await,
                CacheWrite::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    });
    tx
}

struct PoolInner {
    config: Arc<Config>,
    max_sessions: AtomicUsize,
    active: AtomicUsize,
    next_seq: AtomicU64,
    sessions: StdRwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    monitor: Arc<SessionResourceMonitor>,
    probe: ProjectContextProbe,
    events: broadcast::Sender<SessionEvent>,
    cache: Option<StateCache>,
    cache_writer: OnceLock<mpsc::UnboundedSender<CacheWrite>>,
    shutting_down: AtomicBool,
}

/// Cheaply cloneable handle to one pool instance.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("active", &self.inner.active.load(Ordering::SeqCst))
            .field("max_sessions", &self.inner.max_sessions.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    fn slot(&self, id: &SessionId) -> AppResult<Arc<SessionSlot>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| AppError::ProcessFault(format!("session table lock poisoned: {}", e)))?;
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {}", id)))
    }

    fn all_slots(&self) -> Vec<(SessionId, Arc<SessionSlot>)> {
        let mut slots: Vec<(SessionId, Arc<SessionSlot>)> = match self.sessions.read() {
            Ok(sessions) => sessions.iter().map(|(id, slot)| (*id, slot.clone())).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(id, slot)| (*id, slot.clone()))
                .collect(),
        };
        slots.sort_by_key(|(_, slot)| slot.seq);
        slots
    }

    fn emit(&self, session_id: SessionId, kind: SessionEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(SessionEvent { session_id, kind });
    }

    fn set_status(&self, entry: &mut SessionEntry, to: SessionStatus) {
        let from = entry.record.status;
        if from == to {
            return;
        }
        entry.record.status = to;
        debug!(sid = %entry.record.id, %from, %to, "Session status changed");
        self.emit(entry.record.id, SessionEventKind::StatusChanged { from, to });
    }

    fn admit(&self) -> AppResult<()> {
        let utilization = self.monitor.utilization();
        if utilization.system_memory_fraction >= self.config.memory_pressure_threshold {
            warn!(fraction = utilization.system_memory_fraction, "Refusing session under system memory pressure");
            return Err(AppError::ResourceExhausted(format!(
                "system memory pressure ({:.0}% used)",
                utilization.system_memory_fraction * 100.0
            )));
        }
        let max = self.max_sessions.load(Ordering::SeqCst);
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|n| AppError::ResourceExhausted(format!("pool at capacity ({}/{})", n, max)))
    }

    fn release_slot(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Moves a live session to a terminal status. Returns false if it already was terminal.
    fn finish(
        &self,
        entry: &mut SessionEntry,
        status: SessionStatus,
        reason: TerminationReason,
        exit_code: Option<i32>,
    ) -> bool {
        if entry.record.status.is_terminal() {
            return false;
        }
        let id = entry.record.id;
        if let Some(mut io) = entry.io.take() {
            io.kill();
        }
        self.monitor.detach(&id);
        entry.record.exit_code = exit_code.or(entry.record.exit_code);
        entry.record.ended_at = Some(Utc::now().max(entry.record.last_activity_at));
        entry.record.ended = Some(Instant::now());
        entry.record.termination = Some(reason.clone());
        self.set_status(entry, status);
        self.release_slot();
        info!(sid = %id, %status, reason = %reason.message, "Session ended");
        self.emit(id, SessionEventKind::Terminated { status, reason });
        self.persist(entry.snapshot());
        true
    }

    fn write_cache(&self, write: CacheWrite) {
        let Some(cache) = &self.cache else {
            return;
        };
        let writer = self.cache_writer.get_or_init(|| spawn_cache_writer(cache.clone()));
        if writer.send(write).is_err() {
            warn!("Session cache writer stopped; dropping write");
        }
    }

    fn persist(&self, snapshot: Session) {
        self.write_cache(CacheWrite::Store(Box::new(snapshot)));
    }

    /// Resolves once every write submitted so far has been applied.
    async fn flush_cache(&self) {
        if self.cache_writer.get().is_none() {
            return;
        }
        let (done, flushed) = oneshot::channel();
        self.write_cache(CacheWrite::Flush(done));
        let _ = flushed.await;
    }

    /// Appends a chunk and re-derives attention and status from the buffer.
    async fn ingest(&self, id: SessionId, chunk: String) -> AppResult<()> {
        let slot = self.slot(&id)?;
        let mut entry = slot.entry.lock().await;
        if entry.record.status.is_terminal() {
            return Err(AppError::InvalidState(format!("session {} is {}", id, entry.record.status)));
        }
        entry.record.output.push(chunk.clone());
        entry.record.touch();
        self.emit(id, SessionEventKind::Output { chunk });
        self.reclassify(&mut entry, true);
        Ok(())
    }

    /// Re-derives attention from the buffer tail. Idle sessions only change status
    /// when `wake` is set, i.e. when new output arrived.
    fn reclassify(&self, entry: &mut SessionEntry, wake: bool) {
        let needs_attention = attention::classify(&entry.record.output.tail(self.config.attention_window));
        if needs_attention != entry.record.needs_attention {
            entry.record.needs_attention = needs_attention;
            self.emit(entry.record.id, SessionEventKind::Attention { needs_attention });
        }
        let status = entry.record.status;
        if matches!(status, SessionStatus::Running | SessionStatus::Waiting) || (wake && status == SessionStatus::Idle) {
            let to = if needs_attention { SessionStatus::Waiting } else { SessionStatus::Running };
            self.set_status(entry, to);
        }
    }

    async fn fail(&self, id: &SessionId, err: AppError) -> bool {
        let Ok(slot) = self.slot(id) else {
            return false;
        };
        let mut entry = slot.entry.lock().await;
        self.finish(&mut entry, SessionStatus::Error, TerminationReason::from_error(&err), None)
    }

    async fn probe_project(&self, dir: &Path) -> ProjectContext {
        let probe = self.probe.clone();
        let dir_owned = dir.to_path_buf();
        match timeout(PROBE_CEILING, tokio::task::spawn_blocking(move || probe.probe(&dir_owned))).await {
            Ok(Ok(context)) => context,
            Ok(Err(e)) => {
                warn!(error = %e, "Project probe task failed");
                ProjectContext::unknown(dir)
            }
            Err(_) => {
                warn!(dir = %dir.display(), "Project probe exceeded its ceiling");
                ProjectContext::unknown(dir)
            }
        }
    }
}

#[async_trait]
impl ProcessObserver for PoolInner {
    async fn on_output(&self, session_id: SessionId, chunk: String) {
        if let Err(e) = self.ingest(session_id, chunk).await {
            debug!(sid = %session_id, error = %e, "Dropping output for inactive session");
        }
    }

    async fn on_exit(&self, session_id: SessionId, outcome: ExitOutcome) {
        let Ok(slot) = self.slot(&session_id) else {
            return;
        };
        let mut entry = slot.entry.lock().await;
        match outcome {
            ExitOutcome::Exited { code, success: true } => {
                self.finish(&mut entry, SessionStatus::Completed, TerminationReason::completed("process exited"), code);
            }
            ExitOutcome::Exited { code, success: false } => {
                let err = AppError::ProcessFault(match code {
                    Some(code) => format!("process exited with code {}", code),
                    None => "process terminated by signal".to_string(),
                });
                self.finish(&mut entry, SessionStatus::Error, TerminationReason::from_error(&err), code);
            }
            ExitOutcome::Killed => {
                let err = AppError::ProcessFault("process was killed".to_string());
                self.finish(&mut entry, SessionStatus::Error, TerminationReason::from_error(&err), None);
            }
            ExitOutcome::WaitFailed(message) => {
                let err = AppError::ProcessFault(format!("waiting on process failed: {}", message));
                self.finish(&mut entry, SessionStatus::Error, TerminationReason::from_error(&err), None);
            }
        }
    }
}

fn default_title(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| dir.display().to_string())
}

impl SessionPool {
    pub fn new(config: Arc<Config>, monitor: Arc<SessionResourceMonitor>) -> Self {
        Self::with_cache(config, monitor, None)
    }

    pub fn with_cache(config: Arc<Config>, monitor: Arc<SessionResourceMonitor>, cache: Option<StateCache>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PoolInner {
                max_sessions: AtomicUsize::new(config.max_sessions.max(1)),
                config,
                active: AtomicUsize::new(0),
                next_seq: AtomicU64::new(0),
                sessions: StdRwLock::new(HashMap::new()),
                monitor,
                probe: ProjectContextProbe::default(),
                events,
                cache,
                cache_writer: OnceLock::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn monitor(&self) -> &Arc<SessionResourceMonitor> {
        &self.inner.monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Sessions currently holding a concurrency slot (non-terminal).
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.max_sessions.load(Ordering::SeqCst)
    }

    /// Administrative: changes the concurrency ceiling. Live sessions are never
    /// evicted; a lower ceiling only blocks new admissions.
    pub fn set_max_sessions(&self, max: usize) -> AppResult<()> {
        if max == 0 {
            return Err(AppError::OutOfRange("max_sessions must be at least 1".to_string()));
        }
        self.inner.max_sessions.store(max, Ordering::SeqCst);
        info!(max, "Session ceiling updated");
        Ok(())
    }

    pub async fn create(&self, working_dir: impl AsRef<Path>, title: Option<String>) -> AppResult<SessionId> {
        let mut options = SessionOptions::new(working_dir.as_ref());
        options.title = title;
        self.create_with(options).await
    }

    #[instrument(skip(self, options), fields(working_dir = %options.working_dir.display()))]
    pub async fn create_with(&self, options: SessionOptions) -> AppResult<SessionId> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(AppError::Cancelled("pool is shutting down".to_string()));
        }

        let working_dir = validate_working_dir(&options.working_dir)?;
        if let Some(opacity) = options.opacity {
            validate_opacity(opacity)?;
        }
        let position = options.position.unwrap_or_default();
        position.validate()?;

        inner.admit()?;

        let project = inner.probe_project(&working_dir).await;
        let id = SessionId::new();
        let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let title = options
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| default_title(&working_dir));
        let now = Utc::now();

        let slot = Arc::new(SessionSlot {
            seq,
            entry: TokioMutex::new(SessionEntry {
                record: SessionRecord {
                    id,
                    title: title.clone(),
                    working_dir: working_dir.clone(),
                    project,
                    status: SessionStatus::Starting,
                    needs_attention: false,
                    opacity: options.opacity.unwrap_or(1.0),
                    output: OutputBuffer::new(inner.config.output_buffer_chunks),
                    position,
                    is_popup: options.is_popup,
                    created_at: now,
                    last_activity_at: now,
                    last_activity: Instant::now(),
                    ended_at: None,
                    ended: None,
                    exit_code: None,
                    termination: None,
                },
                io: None,
            }),
        });

        match inner.sessions.write() {
            Ok(mut sessions) => {
                sessions.insert(id, slot.clone());
            }
            Err(e) => {
                inner.release_slot();
                return Err(AppError::ProcessFault(format!("session table lock poisoned: {}", e)));
            }
        }
        inner.emit(id, SessionEventKind::Created { title });

        // Spawn unlocked; readers see the session as Starting meanwhile.
        let launch = LaunchSpec::resolve(&inner.config, &options, &working_dir);
        let spawned = timeout(inner.config.startup_timeout, process::spawn(&launch)).await;

        let mut entry = slot.entry.lock().await;
        if inner.shutting_down.load(Ordering::SeqCst) {
            inner.finish(
                &mut entry,
                SessionStatus::Completed,
                TerminationReason::completed("pool shutdown"),
                None,
            );
        }
        if entry.record.status != SessionStatus::Starting {
            if let Ok(Ok((_child, pid))) = spawned {
                process::kill_group(pid);
            }
            return Err(AppError::Cancelled(format!("session {} ended during startup", id)));
        }
        match spawned {
            Ok(Ok((child, pid))) => {
                let observer: Arc<dyn ProcessObserver> = inner.clone();
                entry.io = Some(process::supervise(id, child, pid, observer));
                inner.monitor.register(id, pid);
                inner.set_status(&mut entry, SessionStatus::Running);
                info!(sid = %id, pid, command = %launch.display(), project = %entry.record.project.kind, "Session started");
                inner.persist(entry.snapshot());
                Ok(id)
            }
            Ok(Err(err)) => {
                inner.finish(&mut entry, SessionStatus::Error, TerminationReason::from_error(&err), None);
                Err(err)
            }
            Err(_) => {
                let err = AppError::Timeout(format!(
                    "session did not start within {:?}",
                    inner.config.startup_timeout
                ));
                inner.finish(&mut entry, SessionStatus::Error, TerminationReason::from_error(&err), None);
                Err(err)
            }
        }
    }

    pub async fn get(&self, id: &SessionId) -> AppResult<Session> {
        let slot = self.inner.slot(id)?;
        let entry = slot.entry.lock().await;
        Ok(entry.snapshot())
    }

    /// All sessions, oldest first.
    pub async fn list(&self) -> Vec<Session> {
        let mut sessions = Vec::new();
        for (_, slot) in self.inner.all_slots() {
            sessions.push(slot.entry.lock().await.snapshot());
        }
        sessions
    }

    /// Project context and status, for routing conversational commands.
    pub async fn context(&self, id: &SessionId) -> AppResult<(ProjectContext, SessionStatus)> {
        let slot = self.inner.slot(id)?;
        let entry = slot.entry.lock().await;
        Ok((entry.record.project.clone(), entry.record.status))
    }

    /// Writes `text` to the session's stdin, appending a newline if absent. The
    /// session lock is held across the write, so inputs are delivered in call order.
    #[instrument(skip(self, text), fields(sid = %id, len = text.len()))]
    pub async fn send_input(&self, id: &SessionId, text: &str) -> AppResult<()> {
        let slot = self.inner.slot(id)?;
        let mut entry = slot.entry.lock().await;
        let status = entry.record.status;
        if !status.accepts_input() {
            return Err(AppError::InvalidState(format!("session {} is {}", id, status)));
        }

        let mut payload = text.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }

        let write_timeout = self.inner.config.startup_timeout;
        let stdin = entry
            .io
            .as_mut()
            .and_then(|io| io.stdin.as_mut())
            .ok_or_else(|| AppError::InvalidState(format!("session {} has no open input", id)))?;
        let write = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        };
        match timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(sid = %id, error = %e, "Failed to write session input");
                return Err(AppError::ProcessFault(format!("failed to write input: {}", e)));
            }
            Err(_) => {
                return Err(AppError::Timeout(format!("input write did not complete within {:?}", write_timeout)));
            }
        }

        entry.record.touch();
        if status == SessionStatus::Idle {
            self.inner.set_status(&mut entry, SessionStatus::Running);
        }
        Ok(())
    }

    /// Appends text produced outside the process (e.g. a conversational reply).
    pub async fn write_output(&self, id: &SessionId, text: &str) -> AppResult<()> {
        self.inner.ingest(*id, text.to_string()).await
    }

    /// Ends a live session as Completed. Unknown or already-ended sessions are `NotFound`.
    #[instrument(skip(self), fields(sid = %id))]
    pub async fn terminate(&self, id: &SessionId) -> AppResult<()> {
        let slot = self.inner.slot(id)?;
        let mut entry = slot.entry.lock().await;
        if entry.record.status.is_terminal() {
            return Err(AppError::NotFound(format!("no live session {}", id)));
        }
        self.inner.finish(
            &mut entry,
            SessionStatus::Completed,
            TerminationReason::completed("terminated by request"),
            None,
        );
        Ok(())
    }

    /// Drops the record of an ended session.
    pub async fn purge(&self, id: &SessionId) -> AppResult<()> {
        let slot = self.inner.slot(id)?;
        {
            let entry = slot.entry.lock().await;
            if !entry.record.status.is_terminal() {
                return Err(AppError::InvalidState(format!(
                    "session {} is {}; terminate it first",
                    id, entry.record.status
                )));
            }
        }
        self.remove_record(id);
        Ok(())
    }

    fn remove_record(&self, id: &SessionId) {
        let removed = match self.inner.sessions.write() {
            Ok(mut sessions) => sessions.remove(id).is_some(),
            Err(_) => false,
        };
        if removed {
            self.inner.emit(*id, SessionEventKind::Purged);
            self.inner.write_cache(CacheWrite::Remove(*id));
        }
    }

    async fn live_entry<'a>(
        &self,
        slot: &'a SessionSlot,
    ) -> AppResult<tokio::sync::MutexGuard<'a, SessionEntry>> {
        let entry = slot.entry.lock().await;
        if entry.record.status.is_terminal() {
            return Err(AppError::InvalidState(format!(
                "session {} is {} and read-only",
                entry.record.id, entry.record.status
            )));
        }
        Ok(entry)
    }

    pub async fn update_position(&self, id: &SessionId, rect: Rect) -> AppResult<()> {
        let slot = self.inner.slot(id)?;
        rect.validate()?;
        let mut entry = self.live_entry(&slot).await?;
        entry.record.position = rect;
        Ok(())
    }

    pub async fn set_opacity(&self, id: &SessionId, value: f64) -> AppResult<()> {
        let slot = self.inner.slot(id)?;
        validate_opacity(value)?;
        let mut entry = self.live_entry(&slot).await?;
        entry.record.opacity = value;
        Ok(())
    }

    pub async fn set_popup(&self, id: &SessionId, is_popup: bool) -> AppResult<()> {
        let slot = self.inner.slot(id)?;
        let mut entry = self.live_entry(&slot).await?;
        entry.record.is_popup = is_popup;
        Ok(())
    }

    /// Ends a session with `err` as its reason. No-op for unknown or ended sessions.
    pub async fn fail_session(&self, id: &SessionId, err: AppError) -> bool {
        self.inner.fail(id, err).await
    }

    /// Periodic pass: re-derives attention, moves quiet sessions to Idle, and purges
    /// ended records older than the retention period.
    pub async fn sweep(&self) {
        let idle_timeout = self.inner.config.idle_timeout;
        let retention = self.inner.config.session_retention;
        let mut expired = Vec::new();

        for (id, slot) in self.inner.all_slots() {
            let mut entry = slot.entry.lock().await;
            if entry.record.status.is_terminal() {
                if entry.record.ended.map_or(false, |t| t.elapsed() >= retention) {
                    expired.push(id);
                }
                continue;
            }
            if entry.record.status == SessionStatus::Starting {
                continue;
            }
            self.inner.reclassify(&mut entry, false);
            let quiet = entry.record.last_activity.elapsed() >= idle_timeout;
            if quiet && matches!(entry.record.status, SessionStatus::Running | SessionStatus::Waiting) {
                self.inner.set_status(&mut entry, SessionStatus::Idle);
            }
        }

        for id in expired {
            debug!(sid = %id, "Purging session past retention");
            self.remove_record(&id);
        }
    }

    /// Samples resources and applies budget violations.
    pub async fn check_resources(&self) {
        let monitor = self.inner.monitor.clone();
        let result = tokio::task::spawn_blocking(move || {
            let samples = monitor.sample();
            let violations = monitor.enforce(&samples);
            (samples, violations)
        })
        .await;
        let (samples, violations) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Resource sampling task failed");
                return;
            }
        };

        for violation in violations {
            match violation {
                BudgetViolation::Memory { session_id, used_bytes, budget_bytes } => {
                    let err = AppError::ResourceBudgetExceeded(format!(
                        "memory {} bytes exceeds budget of {} bytes",
                        used_bytes, budget_bytes
                    ));
                    self.inner.fail(&session_id, err).await;
                }
                BudgetViolation::Cpu { session_id, .. } => {
                    if let Some((_, usage)) = samples.iter().find(|(id, _)| *id == session_id) {
                        self.inner.emit(session_id, SessionEventKind::ResourceAlert { usage: *usage });
                    }
                }
                BudgetViolation::HealthCheck { session_id, misses } => {
                    let err = AppError::ProcessFault(format!("health check failed {} times in a row", misses));
                    self.inner.fail(&session_id, err).await;
                }
            }
        }
    }

    /// Loads records cached by a previous run as read-only ended sessions.
    pub async fn restore_cached(&self) -> usize {
        let Some(cache) = self.inner.cache.clone() else {
            return 0;
        };
        let mut cached: Vec<Session> = cache.load_all(CacheArea::Sessions).await;
        cached.sort_by_key(|s| s.created_at);
        let mut restored = 0;
        for session in cached {
            let status = if session.status.is_terminal() { session.status } else { SessionStatus::Completed };
            let termination = session
                .termination
                .clone()
                .or_else(|| Some(TerminationReason::completed("engine restarted")));
            let mut output = OutputBuffer::new(self.inner.config.output_buffer_chunks);
            for chunk in session.output {
                output.push(chunk);
            }
            let slot = Arc::new(SessionSlot {
                seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst),
                entry: TokioMutex::new(SessionEntry {
                    record: SessionRecord {
                        id: session.id,
                        title: session.title,
                        working_dir: session.working_dir,
                        project: session.project,
                        status,
                        needs_attention: session.needs_attention,
                        opacity: session.opacity,
                        output,
                        position: session.position,
                        is_popup: session.is_popup,
                        created_at: session.created_at,
                        last_activity_at: session.last_activity_at,
                        last_activity: Instant::now(),
                        ended_at: session.ended_at.or(Some(session.last_activity_at)),
                        ended: Some(Instant::now()),
                        exit_code: session.exit_code,
                        termination,
                    },
                    io: None,
                }),
            });
            if let Ok(mut sessions) = self.inner.sessions.write() {
                if sessions.insert(session.id, slot).is_none() {
                    restored += 1;
                }
            }
        }
        if restored > 0 {
            info!(restored, "Restored cached session records");
        }
        restored
    }

    /// Terminates every live session. New creations fail with `Cancelled` afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        for (_, slot) in self.inner.all_slots() {
            let mut entry = slot.entry.lock().await;
            self.inner.finish(
                &mut entry,
                SessionStatus::Completed,
                TerminationReason::completed("pool shutdown"),
                None,
            );
        }
        self.inner.flush_cache().await;
        info!("Session pool shut down");
    }
}
