//! 测试辅助：脚本化的远端、记录回调的监听器、测试日志

use crate::chat::error::SyncError;
use crate::chat::message::{ConfirmedMessage, Role};
use crate::chat::pending::PlaceholderMessage;
use crate::chat::stream::{
    ConversationRemote, StreamListener, StreamRequest, WireFrame, WireStream,
};
use crate::chat::types::ListMessagesResp;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::stream;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, Once};
use std::time::Duration;

static INIT_LOGGER: Once = Once::new();

pub(crate) fn init_test_logger() {
    INIT_LOGGER.call_once(|| {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        // 测试中默认打开当前 crate 的 debug，关闭 sqlx 和底层 HTTP 客户端的噪音
        let filter_layer = EnvFilter::new(
            "info,convo_sync_core_rust=debug,sqlx=warn,hyper_util::client=info,reqwest=info",
        );

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .with_test_writer();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}

/// 构造一条已确认消息（id 为 `m{sequence}`）
pub(crate) fn confirmed(conversation_id: &str, sequence: i64, content: &str) -> ConfirmedMessage {
    ConfirmedMessage {
        id: format!("m{}", sequence),
        conversation_id: conversation_id.to_string(),
        role: Role::Assistant,
        content: content.to_string(),
        sequence,
        created_at: Utc
            .timestamp_opt(1_700_000_000 + sequence, 0)
            .single()
            .unwrap_or_else(Utc::now),
        model: None,
        tokens_in: None,
        tokens_out: None,
        latency_ms: None,
        stop_reason: None,
    }
}

pub(crate) fn confirmed_user(
    conversation_id: &str,
    sequence: i64,
    content: &str,
) -> ConfirmedMessage {
    ConfirmedMessage {
        role: Role::User,
        ..confirmed(conversation_id, sequence, content)
    }
}

/// 脚本中的一步
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Open,
    Event(&'static str, String),
    /// 传输错误，之后流结束
    Fail(&'static str),
    /// 之后永远不再产出（直到被取消）
    Hang,
}

pub(crate) fn token(text: &str, index: i64) -> Step {
    Step::Event(
        "token",
        serde_json::json!({ "token": text, "index": index }).to_string(),
    )
}

pub(crate) fn user_message(message: &ConfirmedMessage) -> Step {
    Step::Event("user_message", serde_json::to_string(message).unwrap())
}

pub(crate) fn complete(message: &ConfirmedMessage) -> Step {
    let mut inner = serde_json::to_value(message).unwrap();
    // 服务器对 message.sequence 使用 omitempty，序号放在外层
    if let Some(obj) = inner.as_object_mut() {
        obj.remove("sequence");
    }
    Step::Event(
        "message_complete",
        serde_json::json!({ "message": inner, "sequence": message.sequence }).to_string(),
    )
}

pub(crate) fn replayed(message: &ConfirmedMessage) -> Step {
    Step::Event("message", serde_json::to_string(message).unwrap())
}

pub(crate) fn server_error(message: &str) -> Step {
    Step::Event(
        "error",
        serde_json::json!({ "code": "llm_error", "message": message }).to_string(),
    )
}

pub(crate) fn done() -> Step {
    Step::Event("done", r#"{"success":true}"#.to_string())
}

/// 一次完整的成功回复：open → tokens → user_message → message_complete → done
pub(crate) fn reply_script(
    user: &ConfirmedMessage,
    reply: &ConfirmedMessage,
    tokens: &[&str],
) -> Vec<Step> {
    let mut steps = vec![Step::Open];
    steps.extend(tokens.iter().enumerate().map(|(i, t)| token(t, i as i64)));
    steps.push(user_message(user));
    steps.push(complete(reply));
    steps.push(done());
    steps
}

fn build_stream(steps: Vec<Step>) -> WireStream {
    let mut items = Vec::new();
    let mut hang = false;
    for step in steps {
        match step {
            Step::Open => items.push(Ok(WireFrame::Open)),
            Step::Event(name, data) => items.push(Ok(WireFrame::Event {
                name: name.to_string(),
                data,
            })),
            Step::Fail(reason) => {
                items.push(Err(SyncError::Transport(reason.to_string())));
                break;
            }
            Step::Hang => {
                hang = true;
                break;
            }
        }
    }
    let frames = stream::iter(items);
    if hang {
        frames.chain(stream::pending()).boxed()
    } else {
        frames.boxed()
    }
}

/// 脚本化远端：按会话排队的 SSE 脚本 + 内存中的服务器消息历史
#[derive(Default)]
pub(crate) struct ScriptedRemote {
    scripts: Mutex<HashMap<String, VecDeque<Vec<Step>>>>,
    history: Mutex<HashMap<String, Vec<ConfirmedMessage>>>,
    list_failures: Mutex<usize>,
    list_calls: Mutex<Vec<(String, i64)>>,
    stream_requests: Mutex<Vec<(String, StreamRequest)>>,
}

impl ScriptedRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 为会话排队一条流脚本；没有脚本时 open_stream 返回连接被拒绝
    pub(crate) fn push_script(&self, conversation_id: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(conversation_id.to_string())
            .or_default()
            .push_back(steps);
    }

    pub(crate) fn set_history(&self, conversation_id: &str, messages: Vec<ConfirmedMessage>) {
        self.history
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), messages);
    }

    pub(crate) fn fail_next_lists(&self, n: usize) {
        *self.list_failures.lock().unwrap() = n;
    }

    pub(crate) fn list_calls(&self) -> Vec<(String, i64)> {
        self.list_calls.lock().unwrap().clone()
    }

    pub(crate) fn stream_requests(&self) -> Vec<(String, StreamRequest)> {
        self.stream_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationRemote for ScriptedRemote {
    fn open_stream(&self, conversation_id: &str, request: StreamRequest) -> WireStream {
        self.stream_requests
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), request));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(conversation_id)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| vec![Step::Fail("connection refused")]);
        build_stream(script)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        after_sequence: i64,
        limit: i64,
    ) -> Result<ListMessagesResp, SyncError> {
        self.list_calls
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), after_sequence));
        {
            let mut failures = self.list_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SyncError::Transport("HTTP 503: unavailable".to_string()));
            }
        }

        let mut all: Vec<ConfirmedMessage> = self
            .history
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.sequence > after_sequence)
            .collect();
        all.sort_by_key(|m| m.sequence);
        let has_more = all.len() as i64 > limit;
        all.truncate(limit.max(0) as usize);
        let last_sequence = all.last().map_or(0, |m| m.sequence);
        Ok(ListMessagesResp {
            messages: all,
            has_more,
            last_sequence,
            stream_active: false,
        })
    }
}

/// 监听器回调记录
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Connected,
    Disconnected,
    Token(String, i64),
    Echoed(String),
    Complete(String, i64),
    Error(String),
    Replayed(i64),
    Placeholder(i64),
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    calls: Mutex<Vec<Call>>,
}

impl RecordingListener {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn token_indices(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Token(_, i) => Some(i),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl StreamListener for RecordingListener {
    async fn on_connected(&self, _conversation_id: &str) {
        self.push(Call::Connected);
    }
    async fn on_disconnected(&self, _conversation_id: &str) {
        self.push(Call::Disconnected);
    }
    async fn on_token(&self, _conversation_id: &str, token: &str, index: i64) {
        self.push(Call::Token(token.to_string(), index));
    }
    async fn on_user_message_echoed(&self, message: &ConfirmedMessage) {
        self.push(Call::Echoed(message.id.clone()));
    }
    async fn on_complete(&self, message: &ConfirmedMessage, sequence: i64) {
        self.push(Call::Complete(message.id.clone(), sequence));
    }
    async fn on_error(&self, _conversation_id: &str, error: &str) {
        self.push(Call::Error(error.to_string()));
    }
    async fn on_message_replayed(&self, message: &ConfirmedMessage) {
        self.push(Call::Replayed(message.sequence));
    }
    async fn on_placeholder(&self, placeholder: &PlaceholderMessage) {
        self.push(Call::Placeholder(placeholder.local_id));
    }
}

/// 轮询等待条件成立（最多 2 秒）
pub(crate) async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("条件在 2 秒内未满足");
}
