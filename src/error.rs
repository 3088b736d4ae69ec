use rust_mcp_schema::schema_utils::{CallToolError, RpcErrorCodes};
use rust_mcp_schema::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Stable, serializable classification of an [`AppError`]. Callers branch on this
/// rather than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidPath,
    ResourceExhausted,
    OutOfRange,
    InvalidState,
    NotFound,
    ResourceBudgetExceeded,
    NoCapabilityAvailable,
    Timeout,
    ProcessFault,
    Cancelled,
    InvalidInput,
    Internal,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource budget exceeded: {0}")]
    ResourceBudgetExceeded(String),

    #[error("No capability available: {0}")]
    NoCapabilityAvailable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Process fault: {0}")]
    ProcessFault(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InvalidPath(_) => ErrorKind::InvalidPath,
            AppError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            AppError::OutOfRange(_) => ErrorKind::OutOfRange,
            AppError::InvalidState(_) => ErrorKind::InvalidState,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::ResourceBudgetExceeded(_) => ErrorKind::ResourceBudgetExceeded,
            AppError::NoCapabilityAvailable(_) => ErrorKind::NoCapabilityAvailable,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::ProcessFault(_) => ErrorKind::ProcessFault,
            AppError::Cancelled(_) => ErrorKind::Cancelled,
            AppError::InvalidInputArgument(_) | AppError::SerdeJsonError(_) => ErrorKind::InvalidInput,
            AppError::ConfigError(_) | AppError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller should wait and retry rather than recreate the session.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::ResourceExhausted)
    }

    /// JSON-RPC error for the command surface. `data.kind` carries the precise
    /// classification; the code only separates bad arguments from the rest.
    pub fn to_rpc_error(&self) -> RpcError {
        let code = match self.kind() {
            ErrorKind::InvalidPath | ErrorKind::OutOfRange | ErrorKind::InvalidInput => RpcErrorCodes::INVALID_PARAMS,
            _ => RpcErrorCodes::INTERNAL_ERROR,
        };
        RpcError::new(
            code,
            self.to_string(),
            Some(json!({
                "kind": self.kind(),
                "retryable": self.is_retryable(),
            })),
        )
    }
}

impl From<AppError> for CallToolError {
    fn from(err: AppError) -> Self {
        tracing::warn!(kind = ?err.kind(), error = %err, "Tool call failed");
        CallToolError::new(err.to_rpc_error())
    }
}

pub type AppResult<T> = Result<T, AppError>;
