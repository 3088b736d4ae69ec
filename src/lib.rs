//! Session engine for a canvas of terminal sessions: a pool of supervised shell
//! processes with attention detection, resource budgets, project classification,
//! and conversational routing to capability providers.

pub mod attention;
pub mod bridge;
pub mod cache;
pub mod capability;
pub mod config;
pub mod engine;
pub mod error;
pub mod mcp;
pub mod monitor;
pub mod project;
pub mod session;
pub mod utils;

pub use config::Config;
pub use engine::Engine;
pub use error::{AppError, AppResult, ErrorKind};
