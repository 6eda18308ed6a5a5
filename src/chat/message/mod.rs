//! 本地消息日志：已确认消息 + 每会话同步游标

pub mod dao;
pub mod models;

pub use dao::{LocalLog, LogInconsistency};
pub use models::{ConfirmedMessage, CursorStatus, Role, SyncCursor, PLACEHOLDER_SEQUENCE};
