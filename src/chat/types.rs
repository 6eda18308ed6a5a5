//! 远端接口的请求/响应与 SSE 事件负载定义

use crate::chat::error::SyncError;
use crate::chat::message::ConfirmedMessage;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// `POST /conversations/{id}/stream` 请求体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    pub stream: bool,
}

impl SendMessageRequest {
    pub fn streaming(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            stream: true,
        }
    }
}

/// `GET /conversations/{id}/messages` 响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMessagesResp {
    #[serde(default)]
    pub messages: Vec<ConfirmedMessage>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub last_sequence: i64,
    #[serde(default)]
    pub stream_active: bool,
}

/// `token` 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEvent {
    pub token: String,
    pub index: i64,
}

/// `message_complete` 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCompleteEvent {
    pub message: ConfirmedMessage,
    #[serde(default)]
    pub sequence: i64,
}

/// `error` 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// `replay_complete` 事件（订阅连接回放结束）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayCompleteEvent {
    #[serde(default)]
    pub last_sequence: i64,
    #[serde(default)]
    pub message_count: i64,
}

/// 非 2xx 响应体：`{"error": "..."}`
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// 从非 2xx 响应体中提取错误描述，不是 `{"error"}` 格式时原样返回
pub fn error_message_from_body(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(b) => format!("HTTP {}: {}", status.as_u16(), b.error),
        Err(_) if body.trim().is_empty() => format!("HTTP {}", status.as_u16()),
        Err(_) => format!("HTTP {}: {}", status.as_u16(), body.trim()),
    }
}

/// 通用 HTTP 响应处理：非 2xx 视为传输错误，2xx 直接反序列化为 `T`
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<T, SyncError> {
    let status = response.status();
    let body_bytes = response.bytes().await?;
    let body_str = String::from_utf8_lossy(&body_bytes);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(SyncError::Transport(error_message_from_body(
            status, &body_str,
        )));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        SyncError::StreamProtocol(format!("{}响应格式错误: {}", operation_name, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_response_tolerates_missing_fields() {
        let resp: ListMessagesResp =
            serde_json::from_str(r#"{"messages": [], "has_more": false}"#).unwrap();
        assert_eq!(resp.last_sequence, 0);
        assert!(!resp.stream_active);
    }

    #[test]
    fn error_body_is_unwrapped() {
        let msg = error_message_from_body(
            reqwest::StatusCode::NOT_FOUND,
            r#"{"error":"conversation not found"}"#,
        );
        assert_eq!(msg, "HTTP 404: conversation not found");
        let raw = error_message_from_body(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(raw, "HTTP 502: upstream down");
    }

    #[test]
    fn send_request_serializes_stream_flag() {
        let body = serde_json::to_value(SendMessageRequest::streaming("hi", "m")).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["content"], "hi");
    }
}
