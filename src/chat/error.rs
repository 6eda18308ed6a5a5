//! 同步核心的错误分类
//!
//! DAO 层沿用 `anyhow::Result`，组件边界统一收敛为 [`SyncError`]，
//! 调用方据此区分“可重试的传输错误”和“当次流上不可恢复的协议错误”。

use thiserror::Error;

/// 同步核心错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 连接被拒绝、中途断开或打开时返回非 2xx
    #[error("传输错误: {0}")]
    Transport(String),

    /// 事件负载格式错误或顺序错乱（当次连接致命，不在同一次连接内重试）
    #[error("流协议错误: {0}")]
    StreamProtocol(String),

    /// 服务器通过 `error` 事件报告的失败
    #[error("服务器错误: {message}")]
    Server {
        code: Option<String>,
        message: String,
        retry_after: Option<u64>,
    },

    /// 提交未能到达 complete（已转为 failed 等待补发）
    #[error("提交失败 (local_id={local_id}): {reason}")]
    Submission { local_id: i64, reason: String },

    /// 增量补齐拉取失败（游标已标记 stale，等待下一次触发）
    #[error("增量补齐失败: {0}")]
    Reconciliation(String),

    /// 连接被同会话的新连接取代或被主动取消
    #[error("连接已取消")]
    Cancelled,

    /// 本地存储错误
    #[error("本地存储错误: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    /// 流在没有 complete / error 的情况下结束
    pub fn closed_without_completion() -> Self {
        SyncError::Transport("connection closed without completion".to_string())
    }

    /// 是否为传输层错误（走退避重连）
    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::StreamProtocol(e.to_string())
    }
}
