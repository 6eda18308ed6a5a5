//! 会话远端接口
//!
//! [`ConversationRemote`] 是同步核心访问服务器的唯一入口：
//! 打开 SSE 流（提交或订阅）以及按序号分页拉取已确认消息。
//! 生产实现 [`HttpConversationApi`] 基于 reqwest + reqwest-eventsource。

use crate::chat::auth::TokenProvider;
use crate::chat::error::SyncError;
use crate::chat::types::{
    error_message_from_body, handle_http_response, ListMessagesResp, SendMessageRequest,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest_eventsource::{Error as EsError, Event, EventSource};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 打开 SSE 流的两种方式
#[derive(Debug, Clone)]
pub enum StreamRequest {
    /// `GET /conversations/{id}/stream?after_sequence=N`，只读订阅
    Subscribe { after_sequence: i64 },
    /// `POST /conversations/{id}/stream`，提交并流式接收回复
    Submit {
        body: SendMessageRequest,
        idempotency_key: String,
    },
}

/// 传输层看到的原始帧
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// 连接已打开（2xx 且 content-type 为 event-stream）
    Open,
    Event { name: String, data: String },
}

/// 原始帧流；服务器正常关闭时流结束（返回 `None`），
/// 连接失败或中途断开时产出一个 `Err` 后结束
pub type WireStream = BoxStream<'static, Result<WireFrame, SyncError>>;

/// 会话远端接口
#[async_trait]
pub trait ConversationRemote: Send + Sync {
    /// 打开一条 SSE 流；连接错误通过流中的 `Err` 报告
    fn open_stream(&self, conversation_id: &str, request: StreamRequest) -> WireStream;

    /// 拉取 `sequence > after_sequence` 的已确认消息，最多 `limit` 条
    async fn list_messages(
        &self,
        conversation_id: &str,
        after_sequence: i64,
        limit: i64,
    ) -> Result<ListMessagesResp, SyncError>;
}

/// 基于 HTTP 的会话 API 客户端
pub struct HttpConversationApi {
    client: reqwest::Client,
    api_base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpConversationApi {
    /// 创建 HTTP 客户端
    ///
    /// 只设置连接超时；流式响应可能持续很久，不设置整体超时。
    pub fn new(api_base_url: &str, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self::with_client(client, api_base_url, tokens))
    }

    pub fn with_client(
        client: reqwest::Client,
        api_base_url: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn conversation_url(&self, conversation_id: &str, path: &str) -> String {
        format!(
            "{}/conversations/{}/{}",
            self.api_base_url, conversation_id, path
        )
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.tokens.access_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// reqwest-eventsource 错误 → 同步核心错误
async fn map_es_error(err: EsError) -> SyncError {
    match err {
        EsError::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            SyncError::Transport(error_message_from_body(status, &body))
        }
        EsError::InvalidContentType(header, _) => {
            SyncError::Transport(format!("非 SSE 响应: content-type={:?}", header))
        }
        EsError::Transport(e) => SyncError::Transport(e.to_string()),
        e @ (EsError::Utf8(_) | EsError::Parser(_)) => {
            SyncError::StreamProtocol(format!("SSE 解析失败: {}", e))
        }
        other => SyncError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ConversationRemote for HttpConversationApi {
    fn open_stream(&self, conversation_id: &str, request: StreamRequest) -> WireStream {
        let url = self.conversation_url(conversation_id, "stream");
        let builder = match &request {
            StreamRequest::Subscribe { after_sequence } => {
                debug!(
                    "[StreamAPI] 📡 打开订阅流: {}?after_sequence={}",
                    url, after_sequence
                );
                self.client
                    .get(&url)
                    .query(&[("after_sequence", after_sequence)])
            }
            StreamRequest::Submit {
                body,
                idempotency_key,
            } => {
                debug!(
                    "[StreamAPI] 📤 打开提交流: {}, idempotencyKey={}",
                    url, idempotency_key
                );
                self.client
                    .post(&url)
                    .header("Idempotency-Key", idempotency_key.as_str())
                    .json(body)
            }
        };
        let builder = self
            .authorize(builder)
            .header(reqwest::header::ACCEPT, "text/event-stream");

        let mut es = match EventSource::new(builder) {
            Ok(es) => es,
            Err(e) => {
                return stream::once(async move {
                    Err(SyncError::Transport(format!("无法创建 SSE 请求: {}", e)))
                })
                .boxed()
            }
        };
        // 重连由传输层统一负责
        es.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        stream::unfold(Some(es), |state| async move {
            let mut es = state?;
            match es.next().await {
                None => None,
                Some(Ok(Event::Open)) => Some((Ok(WireFrame::Open), Some(es))),
                Some(Ok(Event::Message(msg))) => Some((
                    Ok(WireFrame::Event {
                        name: msg.event,
                        data: msg.data,
                    }),
                    Some(es),
                )),
                Some(Err(EsError::StreamEnded)) => {
                    es.close();
                    None
                }
                Some(Err(e)) => {
                    es.close();
                    let err = map_es_error(e).await;
                    warn!("[StreamAPI] ⚠️ SSE 连接错误: {}", err);
                    Some((Err(err), None))
                }
            }
        })
        .boxed()
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        after_sequence: i64,
        limit: i64,
    ) -> Result<ListMessagesResp, SyncError> {
        let url = self.conversation_url(conversation_id, "messages");
        info!(
            "[StreamAPI] 📡 拉取消息: conversationID={}, afterSequence={}, limit={}",
            conversation_id, after_sequence, limit
        );

        let response = self
            .authorize(self.client.get(&url))
            .query(&[("after_sequence", after_sequence), ("limit", limit)])
            .send()
            .await?;

        let resp: ListMessagesResp = handle_http_response(response, "拉取消息").await?;
        debug!(
            "[StreamAPI] 拉取完成: {} 条, lastSequence={}, hasMore={}",
            resp.messages.len(),
            resp.last_sequence,
            resp.has_more
        );
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::auth::StaticTokenProvider;

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let api = HttpConversationApi::new(
            "http://localhost:8080/api/v1/",
            Arc::new(StaticTokenProvider::new(None)),
        )
        .unwrap();
        assert_eq!(
            api.conversation_url("c1", "stream"),
            "http://localhost:8080/api/v1/conversations/c1/stream"
        );
    }

    #[tokio::test]
    async fn unreachable_server_yields_single_transport_error() {
        // 端口 9 (discard) 通常无人监听，连接会被拒绝
        let api = HttpConversationApi::new(
            "http://127.0.0.1:9/api/v1",
            Arc::new(StaticTokenProvider::new(Some("t".into()))),
        )
        .unwrap();
        let frames: Vec<_> = api
            .open_stream("c1", StreamRequest::Subscribe { after_sequence: 0 })
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Err(SyncError::Transport(_))));

        let err = api.list_messages("c1", 0, 100).await.unwrap_err();
        assert!(err.is_transport());
    }
}
