use crate::error::{AppError, ErrorKind};
use crate::monitor::ResourceUsage;
use crate::project::ProjectContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Largest accepted coordinate or extent for a session rectangle.
pub const MAX_COORDINATE: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(SessionId)
            .map_err(|_| AppError::NotFound(format!("session {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Waiting,
    Idle,
    Error,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Error | SessionStatus::Completed)
    }

    /// Statuses in which the process handle is exposed.
    pub fn exposes_process(&self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Waiting)
    }

    pub fn accepts_input(&self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Waiting | SessionStatus::Idle)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Idle => "idle",
            SessionStatus::Error => "error",
            SessionStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for Rect {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 800.0,
            height: 600.0,
        }
    }
}

impl Rect {
    pub fn validate(&self) -> Result<(), AppError> {
        let coords = [self.x, self.y, self.width, self.height];
        if coords.iter().any(|v| !v.is_finite()) {
            return Err(AppError::OutOfRange(format!("position must be finite: {:?}", self)));
        }
        if self.x.abs() > MAX_COORDINATE || self.y.abs() > MAX_COORDINATE {
            return Err(AppError::OutOfRange(format!("position origin out of range: {:?}", self)));
        }
        if self.width <= 0.0 || self.height <= 0.0 || self.width > MAX_COORDINATE || self.height > MAX_COORDINATE {
            return Err(AppError::OutOfRange(format!("position extent out of range: {:?}", self)));
        }
        Ok(())
    }
}

pub fn validate_opacity(value: f64) -> Result<(), AppError> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(AppError::OutOfRange(format!("opacity must be within [0, 1], got {}", value)));
    }
    Ok(())
}

/// Why a session reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationReason {
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl TerminationReason {
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }

    pub fn from_error(err: &AppError) -> Self {
        Self {
            kind: Some(err.kind()),
            message: err.to_string(),
        }
    }
}

/// Read-only view of a session handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub pid: Option<u32>,
    pub title: String,
    pub working_dir: PathBuf,
    pub project: ProjectContext,
    pub status: SessionStatus,
    pub needs_attention: bool,
    pub opacity: f64,
    pub output: Vec<String>,
    pub position: Rect,
    pub is_popup: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub termination: Option<TerminationReason>,
}

/// Creation parameters beyond the working directory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionOptions {
    pub working_dir: PathBuf,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_popup: bool,
    #[serde(default)]
    pub position: Option<Rect>,
    #[serde(default)]
    pub opacity: Option<f64>,
    /// Program to run instead of the configured shell.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl SessionOptions {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn command(mut self, program: impl Into<String>, args: &[&str]) -> Self {
        self.program = Some(program.into());
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// State-change notifications delivered to subscribers, keyed by session id.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventKind {
    Created { title: String },
    StatusChanged { from: SessionStatus, to: SessionStatus },
    Output { chunk: String },
    Attention { needs_attention: bool },
    ResourceAlert { usage: ResourceUsage },
    Terminated { status: SessionStatus, reason: TerminationReason },
    Purged,
}
