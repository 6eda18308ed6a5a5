//! SSE 事件解析与顺序校验
//!
//! 事件名与负载来自服务器的 `event:` / `data:` 行。解析失败或顺序错乱都是
//! [`SyncError::StreamProtocol`]，对当次连接是致命的。

use crate::chat::error::SyncError;
use crate::chat::message::ConfirmedMessage;
use crate::chat::types::{ErrorEvent, MessageCompleteEvent, ReplayCompleteEvent, TokenEvent};

/// 解析后的流事件
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected,
    Heartbeat,
    Token { token: String, index: i64 },
    /// 服务器确认并回显的用户消息
    UserMessage(ConfirmedMessage),
    /// 回复完成，`message.sequence` 已与外层 `sequence` 对齐
    Complete {
        message: ConfirmedMessage,
        sequence: i64,
    },
    /// 订阅连接回放的已确认消息
    Replayed(ConfirmedMessage),
    ReplayComplete {
        last_sequence: i64,
        message_count: i64,
    },
    ServerError {
        code: Option<String>,
        message: String,
        retry_after: Option<u64>,
    },
    Done,
    /// 未知事件，忽略
    Unknown(String),
}

fn decode<T: serde::de::DeserializeOwned>(name: &str, data: &str) -> Result<T, SyncError> {
    serde_json::from_str(data)
        .map_err(|e| SyncError::StreamProtocol(format!("{} 事件负载格式错误: {}", name, e)))
}

/// 把一条 SSE 记录解析为 [`StreamEvent`]
pub fn parse_event(name: &str, data: &str) -> Result<StreamEvent, SyncError> {
    match name {
        "connected" => Ok(StreamEvent::Connected),
        "heartbeat" => Ok(StreamEvent::Heartbeat),
        "token" => {
            let ev: TokenEvent = decode(name, data)?;
            if ev.index < 0 {
                return Err(SyncError::StreamProtocol(format!(
                    "token 序号非法: {}",
                    ev.index
                )));
            }
            Ok(StreamEvent::Token {
                token: ev.token,
                index: ev.index,
            })
        }
        "user_message" => Ok(StreamEvent::UserMessage(decode(name, data)?)),
        "message_complete" => {
            let ev: MessageCompleteEvent = decode(name, data)?;
            let mut message = ev.message;
            let sequence = match (message.sequence, ev.sequence) {
                (0, outer) => outer,
                (inner, 0) => inner,
                (inner, outer) if inner == outer => inner,
                (inner, outer) => {
                    return Err(SyncError::StreamProtocol(format!(
                        "message_complete 序号不一致: message.sequence={}, sequence={}",
                        inner, outer
                    )))
                }
            };
            if sequence <= 0 {
                return Err(SyncError::StreamProtocol(format!(
                    "message_complete 缺少有效序号: message={}",
                    message.id
                )));
            }
            message.sequence = sequence;
            Ok(StreamEvent::Complete { message, sequence })
        }
        // 未命名的 SSE 事件默认为 message
        "message" | "" => Ok(StreamEvent::Replayed(decode(name, data)?)),
        "replay_complete" => {
            let ev: ReplayCompleteEvent = decode(name, data)?;
            Ok(StreamEvent::ReplayComplete {
                last_sequence: ev.last_sequence,
                message_count: ev.message_count,
            })
        }
        "error" => {
            let ev: ErrorEvent = decode(name, data)?;
            Ok(StreamEvent::ServerError {
                code: ev.code.filter(|c| !c.is_empty()),
                message: ev.message,
                retry_after: ev.retry_after.filter(|r| *r > 0),
            })
        }
        "done" => Ok(StreamEvent::Done),
        other => Ok(StreamEvent::Unknown(other.to_string())),
    }
}

/// 一次回复内的事件顺序校验
///
/// - token 序号严格递增（允许跳号，不允许重复或回退）
/// - complete 之后不再有 token
/// - 最多一个 complete
/// - complete 与 error 互斥
#[derive(Debug, Default)]
pub struct EventGuard {
    last_index: Option<i64>,
    completed: bool,
    errored: bool,
}

impl EventGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, event: &StreamEvent) -> Result<(), SyncError> {
        match event {
            StreamEvent::Token { index, .. } => {
                if self.completed || self.errored {
                    return Err(SyncError::StreamProtocol(format!(
                        "终态之后收到 token: index={}",
                        index
                    )));
                }
                if let Some(last) = self.last_index {
                    if *index <= last {
                        return Err(SyncError::StreamProtocol(format!(
                            "token 序号未递增: last={}, index={}",
                            last, index
                        )));
                    }
                }
                self.last_index = Some(*index);
            }
            StreamEvent::Complete { message, .. } => {
                if self.completed {
                    return Err(SyncError::StreamProtocol(format!(
                        "重复的 message_complete: id={}",
                        message.id
                    )));
                }
                if self.errored {
                    return Err(SyncError::StreamProtocol(
                        "error 之后又收到 message_complete".to_string(),
                    ));
                }
                self.completed = true;
            }
            StreamEvent::ServerError { .. } => {
                if self.completed {
                    return Err(SyncError::StreamProtocol(
                        "message_complete 之后又收到 error".to_string(),
                    ));
                }
                self.errored = true;
            }
            _ => {}
        }
        Ok(())
    }

    /// 订阅连接上开始新一轮回复
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &str = r#"{"id":"m5","conversation_id":"c1","role":"assistant","content":"hi","created_at":"2024-05-01T10:00:00Z"}"#;

    fn token(index: i64) -> StreamEvent {
        StreamEvent::Token {
            token: format!("t{}", index),
            index,
        }
    }

    #[test]
    fn complete_takes_sequence_from_envelope() {
        let data = format!(r#"{{"message":{},"sequence":5}}"#, MESSAGE);
        match parse_event("message_complete", &data).unwrap() {
            StreamEvent::Complete { message, sequence } => {
                assert_eq!(sequence, 5);
                assert_eq!(message.sequence, 5);
                assert_eq!(message.content, "hi");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn complete_with_conflicting_sequences_is_protocol_error() {
        let inner = MESSAGE.replace(r#""content":"hi""#, r#""content":"hi","sequence":4"#);
        let data = format!(r#"{{"message":{},"sequence":5}}"#, inner);
        let err = parse_event("message_complete", &data).unwrap_err();
        assert!(matches!(err, SyncError::StreamProtocol(_)));
    }

    #[test]
    fn complete_without_any_sequence_is_protocol_error() {
        let data = format!(r#"{{"message":{}}}"#, MESSAGE);
        assert!(matches!(
            parse_event("message_complete", &data),
            Err(SyncError::StreamProtocol(_))
        ));
    }

    #[test]
    fn malformed_payload_is_protocol_error() {
        assert!(matches!(
            parse_event("token", "{not json"),
            Err(SyncError::StreamProtocol(_))
        ));
        assert!(matches!(
            parse_event("token", r#"{"token":"a","index":-1}"#),
            Err(SyncError::StreamProtocol(_))
        ));
    }

    #[test]
    fn server_error_drops_empty_fields() {
        let ev = parse_event("error", r#"{"code":"","message":"rate limited","retry_after":0}"#)
            .unwrap();
        assert_eq!(
            ev,
            StreamEvent::ServerError {
                code: None,
                message: "rate limited".into(),
                retry_after: None
            }
        );
    }

    #[test]
    fn keepalive_and_unknown_events_parse() {
        assert_eq!(
            parse_event("heartbeat", r#"{"timestamp":"2024-05-01T10:00:00Z"}"#).unwrap(),
            StreamEvent::Heartbeat
        );
        assert_eq!(
            parse_event("connected", r#"{"conversation_id":"c1"}"#).unwrap(),
            StreamEvent::Connected
        );
        assert_eq!(
            parse_event("typing", "{}").unwrap(),
            StreamEvent::Unknown("typing".into())
        );
        assert!(matches!(
            parse_event("message", MESSAGE).unwrap(),
            StreamEvent::Replayed(_)
        ));
    }

    #[test]
    fn guard_accepts_increasing_tokens_then_complete() {
        let mut guard = EventGuard::new();
        for i in 0..10 {
            guard.check(&token(i)).unwrap();
        }
        let complete = parse_event(
            "message_complete",
            &format!(r#"{{"message":{},"sequence":5}}"#, MESSAGE),
        )
        .unwrap();
        guard.check(&complete).unwrap();

        assert!(guard.check(&token(10)).is_err());
        assert!(guard.check(&complete).is_err());
    }

    #[test]
    fn guard_rejects_regressing_or_repeated_index() {
        let mut guard = EventGuard::new();
        guard.check(&token(0)).unwrap();
        guard.check(&token(2)).unwrap();
        assert!(guard.check(&token(2)).is_err());
        assert!(guard.check(&token(1)).is_err());
    }

    #[test]
    fn guard_keeps_error_and_complete_exclusive() {
        let error = StreamEvent::ServerError {
            code: None,
            message: "boom".into(),
            retry_after: None,
        };
        let complete = parse_event(
            "message_complete",
            &format!(r#"{{"message":{},"sequence":5}}"#, MESSAGE),
        )
        .unwrap();

        let mut guard = EventGuard::new();
        guard.check(&error).unwrap();
        assert!(guard.check(&complete).is_err());

        let mut guard = EventGuard::new();
        guard.check(&complete).unwrap();
        assert!(guard.check(&error).is_err());

        guard.reset();
        guard.check(&token(0)).unwrap();
    }
}
