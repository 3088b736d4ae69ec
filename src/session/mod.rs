pub mod buffer;
pub mod pool;
pub mod process;
pub mod types;

pub use pool::SessionPool;
pub use types::{Rect, Session, SessionEvent, SessionEventKind, SessionId, SessionOptions, SessionStatus};
