//! 流式连接回调接口

use crate::chat::message::ConfirmedMessage;
use crate::chat::pending::PlaceholderMessage;
use async_trait::async_trait;

/// 流式发送/订阅的回调接口
///
/// 所有回调都在连接所在的任务内按流顺序 await，不会并发触发。
#[async_trait]
pub trait StreamListener: Send + Sync {
    /// 连接已打开
    async fn on_connected(&self, conversation_id: &str);

    /// 连接已关闭（无论成功与否，只要触发过 on_connected 就会触发）
    async fn on_disconnected(&self, conversation_id: &str);

    /// 增量 token，`index` 在一次回复内严格递增
    async fn on_token(&self, conversation_id: &str, token: &str, index: i64);

    /// 服务器回显了已确认的用户消息（替换占位消息）
    async fn on_user_message_echoed(&self, message: &ConfirmedMessage);

    /// 回复完成，每次成功的发送只触发一次
    async fn on_complete(&self, message: &ConfirmedMessage, sequence: i64);

    /// 出错（传输错误超过重连上限、协议错误、服务器 error 事件）
    async fn on_error(&self, conversation_id: &str, error: &str);

    /// 订阅连接回放的历史消息
    async fn on_message_replayed(&self, message: &ConfirmedMessage);

    /// 提交入队后立即产生的乐观占位消息
    async fn on_placeholder(&self, placeholder: &PlaceholderMessage);
}

/// 空实现（默认监听器）
pub struct EmptyStreamListener;

#[async_trait]
impl StreamListener for EmptyStreamListener {
    async fn on_connected(&self, _conversation_id: &str) {}
    async fn on_disconnected(&self, _conversation_id: &str) {}
    async fn on_token(&self, _conversation_id: &str, _token: &str, _index: i64) {}
    async fn on_user_message_echoed(&self, _message: &ConfirmedMessage) {}
    async fn on_complete(&self, _message: &ConfirmedMessage, _sequence: i64) {}
    async fn on_error(&self, _conversation_id: &str, _error: &str) {}
    async fn on_message_replayed(&self, _message: &ConfirmedMessage) {}
    async fn on_placeholder(&self, _placeholder: &PlaceholderMessage) {}
}
