//! 消息与同步游标的本地模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 乐观占位消息使用的哨兵序号，小于任何真实序号，永远不会写入确认消息表
pub const PLACEHOLDER_SEQUENCE: i64 = -1;

/// 消息发送方角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(anyhow::anyhow!("未知的消息角色: {}", other)),
        }
    }
}

/// 已确认消息（由服务器分配 id 和 sequence，写入后不可变）
///
/// 可以直接从服务器返回的 JSON 反序列化；服务器对 `sequence` 使用 omitempty，
/// 缺失时为 0，由外层 `message_complete` 事件补齐。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl ConfirmedMessage {
    /// 同 id 重复写入时用于判断内容是否一致
    pub(crate) fn same_record(&self, other: &ConfirmedMessage) -> bool {
        self.id == other.id
            && self.conversation_id == other.conversation_id
            && self.role == other.role
            && self.content == other.content
            && self.sequence == other.sequence
    }
}

/// 游标状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorStatus {
    /// 已追平服务器
    Synced,
    /// 增量拉取进行中
    Syncing,
    /// 拉取失败或仍有未拉取的分页
    Stale,
}

impl CursorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorStatus::Synced => "synced",
            CursorStatus::Syncing => "syncing",
            CursorStatus::Stale => "stale",
        }
    }
}

impl FromStr for CursorStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(CursorStatus::Synced),
            "syncing" => Ok(CursorStatus::Syncing),
            "stale" => Ok(CursorStatus::Stale),
            other => Err(anyhow::anyhow!("未知的游标状态: {}", other)),
        }
    }
}

/// 每个会话一条的同步游标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub conversation_id: String,
    /// 本地已持久化的最高序号，只会前进
    pub last_sequence: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub status: CursorStatus,
}

impl SyncCursor {
    /// 本地不存在游标时的默认值
    pub fn initial(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            last_sequence: 0,
            last_sync_at: None,
            status: CursorStatus::Stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_without_sequence_defaults_to_zero() {
        let json = r#"{
            "id": "m1",
            "conversation_id": "c1",
            "tenant_id": "t1",
            "role": "assistant",
            "content": "hi",
            "model": "claude-3-5-sonnet-20241022",
            "tokens_in": 12,
            "tokens_out": 3,
            "stop_reason": "end_turn",
            "created_at": "2024-05-01T10:00:00Z"
        }"#;
        let msg: ConfirmedMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.sequence, 0);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.tokens_out, Some(3));
        assert_eq!(msg.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(msg.latency_ms, None);
    }

    #[test]
    fn role_and_status_parse_back_from_storage_text() {
        for role in [Role::User, Role::Assistant, Role::System, Role::Tool] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("robot".parse::<Role>().is_err());
        assert_eq!("syncing".parse::<CursorStatus>().unwrap(), CursorStatus::Syncing);
    }
}
