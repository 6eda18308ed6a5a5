//! 待发送提交与乐观占位消息模型

use crate::chat::message::PLACEHOLDER_SEQUENCE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 待发送提交状态
///
/// 流转：pending → sending → failed → sending → ...，确认消息落库后删除。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Sending,
    Failed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Sending => "sending",
            PendingStatus::Failed => "failed",
        }
    }
}

impl FromStr for PendingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PendingStatus::Pending),
            "sending" => Ok(PendingStatus::Sending),
            "failed" => Ok(PendingStatus::Failed),
            other => Err(anyhow::anyhow!("未知的提交状态: {}", other)),
        }
    }
}

/// 尚未被服务器确认的用户提交
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSubmission {
    /// 设备本地自增 ID
    pub local_id: i64,
    pub conversation_id: String,
    pub content: String,
    /// 提交时选择的模型，重试时沿用
    pub model: String,
    /// 每次发送都携带的幂等键
    pub idempotency_key: String,
    pub status: PendingStatus,
    pub created_at: DateTime<Utc>,
    pub retry_count: i64,
}

impl PendingSubmission {
    /// 生成用于界面即时展示的占位消息
    pub fn placeholder(&self) -> PlaceholderMessage {
        PlaceholderMessage {
            local_id: self.local_id,
            conversation_id: self.conversation_id.clone(),
            content: self.content.clone(),
            sequence: PLACEHOLDER_SEQUENCE,
            created_at: self.created_at,
            status: self.status,
            retry_count: self.retry_count,
        }
    }
}

/// 乐观占位消息（仅存在于客户端视图，不写入确认消息表）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderMessage {
    pub local_id: i64,
    pub conversation_id: String,
    pub content: String,
    /// 固定为 [`PLACEHOLDER_SEQUENCE`]
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub status: PendingStatus,
    pub retry_count: i64,
}

impl PlaceholderMessage {
    /// 发送失败（界面上显示为“未送达”）
    pub fn is_failed(&self) -> bool {
        self.status == PendingStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_carries_sentinel_sequence_and_status() {
        let sub = PendingSubmission {
            local_id: 7,
            conversation_id: "c1".into(),
            content: "hello".into(),
            model: "m".into(),
            idempotency_key: "k".into(),
            status: PendingStatus::Failed,
            created_at: Utc::now(),
            retry_count: 2,
        };
        let ph = sub.placeholder();
        assert_eq!(ph.sequence, PLACEHOLDER_SEQUENCE);
        assert_eq!(ph.local_id, 7);
        assert!(ph.is_failed());
        assert_eq!("sending".parse::<PendingStatus>().unwrap(), PendingStatus::Sending);
    }
}
