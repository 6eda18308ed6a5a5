//! 流式传输层
//!
//! 每个会话同一时刻最多一条活动连接：新的 `connect` / `send_and_stream`
//! 会先取消旧连接（CancellationToken），旧连接的迟到事件按 generation 丢弃。
//! 传输错误按 [`ReconnectPolicy`] 指数退避重连，每次重连前做一次增量补齐。

use crate::chat::error::SyncError;
use crate::chat::message::ConfirmedMessage;
use crate::chat::reconciler::Reconciler;
use crate::chat::status::StatusBoard;
use crate::chat::stream::api::{ConversationRemote, StreamRequest, WireFrame, WireStream};
use crate::chat::stream::events::{parse_event, EventGuard, StreamEvent};
use crate::chat::stream::listener::StreamListener;
use crate::chat::stream::state::{ConnectionState, ConnectionStatus, ReconnectPolicy};
use crate::chat::types::SendMessageRequest;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 连接注册表中的一项
struct Slot {
    generation: u64,
    cancel: CancellationToken,
    state: ConnectionState,
}

/// 连接模式：提交在终态后结束，订阅在终态后开始新一轮回复
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Submit,
    Subscribe,
}

/// 单次连接尝试的结果
enum Attempt {
    /// 收到 message_complete（提交模式）
    Completed(ConfirmedMessage),
    /// 服务器正常关闭连接
    Closed,
    Failed(SyncError),
    /// 被取消或被同会话的新连接取代
    Cancelled,
}

/// 订阅连接句柄
pub struct ConnectionHandle {
    conversation_id: String,
    generation: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 取消订阅（幂等）
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 等待订阅任务结束
    pub async fn closed(self) {
        if let Err(e) = self.join.await {
            error!("[Transport] 订阅任务异常退出: {}", e);
        }
    }
}

/// 流式传输
pub struct StreamTransport {
    remote: Arc<dyn ConversationRemote>,
    reconciler: Arc<Reconciler>,
    status: Arc<StatusBoard>,
    policy: ReconnectPolicy,
    slots: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
}

impl StreamTransport {
    pub fn new(
        remote: Arc<dyn ConversationRemote>,
        reconciler: Arc<Reconciler>,
        status: Arc<StatusBoard>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            remote,
            reconciler,
            status,
            policy,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记新连接并取消同会话的旧连接
    fn claim(&self, conversation_id: &str) -> (u64, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let previous = self.slots().insert(
            conversation_id.to_string(),
            Slot {
                generation,
                cancel: cancel.clone(),
                state: ConnectionState::new(generation),
            },
        );
        if let Some(old) = previous {
            info!(
                "[Transport] 🔁 新连接取代旧连接: conversationID={}, generation {} → {}",
                conversation_id, old.generation, generation
            );
            old.cancel.cancel();
        }
        (generation, cancel)
    }

    fn release(&self, conversation_id: &str, generation: u64) {
        let mut slots = self.slots();
        if slots
            .get(conversation_id)
            .is_some_and(|s| s.generation == generation)
        {
            slots.remove(conversation_id);
        }
    }

    fn is_current(&self, conversation_id: &str, generation: u64) -> bool {
        self.slots()
            .get(conversation_id)
            .is_some_and(|s| s.generation == generation)
    }

    fn store_state(&self, conversation_id: &str, state: ConnectionState) {
        if let Some(slot) = self.slots().get_mut(conversation_id) {
            if slot.generation == state.generation {
                slot.state = state;
            }
        }
    }

    /// 当前连接状态（没有活动连接时为 `None`）
    pub fn connection_state(&self, conversation_id: &str) -> Option<ConnectionState> {
        self.slots().get(conversation_id).map(|s| s.state)
    }

    pub fn is_connected(&self, conversation_id: &str) -> bool {
        self.connection_state(conversation_id)
            .is_some_and(|s| s.status == ConnectionStatus::Connected)
    }

    /// 主动断开会话的活动连接，返回是否存在活动连接
    pub fn disconnect(&self, conversation_id: &str) -> bool {
        match self.slots().remove(conversation_id) {
            Some(slot) => {
                info!(
                    "[Transport] 🔌 断开连接: conversationID={}, generation={}",
                    conversation_id, slot.generation
                );
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// 断开全部连接
    pub fn disconnect_all(&self) {
        for (_, slot) in self.slots().drain() {
            slot.cancel.cancel();
        }
    }

    /// 提交一条消息并流式接收回复
    ///
    /// 成功时返回序号已对齐的 complete 消息。只有在流打开之前失败才会原地退避重试；
    /// 打开之后断开不再重发，交给待发送队列的补发流程。
    pub async fn send_and_stream(
        &self,
        conversation_id: &str,
        request: SendMessageRequest,
        idempotency_key: &str,
        listener: Arc<dyn StreamListener>,
    ) -> Result<ConfirmedMessage, SyncError> {
        let (generation, cancel) = self.claim(conversation_id);
        self.status.stream_started();
        info!(
            "[Transport] 📤 开始发送: conversationID={}, generation={}",
            conversation_id, generation
        );

        let result = self
            .run_send(
                conversation_id,
                generation,
                &cancel,
                request,
                idempotency_key,
                listener.as_ref(),
            )
            .await;

        self.status.stream_finished();
        self.release(conversation_id, generation);
        result
    }

    async fn run_send(
        &self,
        conversation_id: &str,
        generation: u64,
        cancel: &CancellationToken,
        request: SendMessageRequest,
        idempotency_key: &str,
        listener: &dyn StreamListener,
    ) -> Result<ConfirmedMessage, SyncError> {
        let mut state = ConnectionState::new(generation);

        loop {
            state = state.on_connecting();
            self.store_state(conversation_id, state);

            let stream = self.remote.open_stream(
                conversation_id,
                StreamRequest::Submit {
                    body: request.clone(),
                    idempotency_key: idempotency_key.to_string(),
                },
            );
            let (attempt, opened) = self
                .pump(
                    conversation_id,
                    cancel,
                    stream,
                    listener,
                    &mut state,
                    Mode::Submit,
                )
                .await;

            let err = match attempt {
                Attempt::Completed(message) => {
                    state = state.on_clean_close();
                    self.store_state(conversation_id, state);
                    self.close_connection(conversation_id, listener, opened)
                        .await;
                    info!(
                        "[Transport] ✅ 发送完成: conversationID={}, messageID={}, sequence={}",
                        conversation_id, message.id, message.sequence
                    );
                    return Ok(message);
                }
                Attempt::Closed => {
                    state = state.on_clean_close();
                    self.store_state(conversation_id, state);
                    let err = SyncError::closed_without_completion();
                    listener.on_error(conversation_id, &err.to_string()).await;
                    self.reconcile_quietly(conversation_id).await;
                    self.close_connection(conversation_id, listener, opened)
                        .await;
                    return Err(err);
                }
                Attempt::Cancelled => {
                    let err = SyncError::Cancelled;
                    listener.on_error(conversation_id, &err.to_string()).await;
                    self.close_connection(conversation_id, listener, opened)
                        .await;
                    return Err(err);
                }
                Attempt::Failed(err) => err,
            };

            // 流已打开或非传输错误：不在原地重发
            if opened || !err.is_transport() {
                state = state.on_fatal();
                self.store_state(conversation_id, state);
                warn!(
                    "[Transport] ❌ 发送失败: conversationID={}, error={}",
                    conversation_id, err
                );
                listener.on_error(conversation_id, &err.to_string()).await;
                if err.is_transport() {
                    self.reconcile_quietly(conversation_id).await;
                }
                self.close_connection(conversation_id, listener, opened)
                    .await;
                return Err(err);
            }

            let (next, delay) = state.on_transport_error(&self.policy);
            state = next;
            self.store_state(conversation_id, state);
            let Some(delay) = delay else {
                let err = SyncError::Transport(format!(
                    "重连 {} 次后仍失败: {}",
                    self.policy.max_attempts, err
                ));
                error!("[Transport] ❌ {}: conversationID={}", err, conversation_id);
                listener.on_error(conversation_id, &err.to_string()).await;
                return Err(err);
            };

            warn!(
                "[Transport] ⚠️ 连接失败，{:?} 后第 {} 次重连: conversationID={}, error={}",
                delay, state.attempt, conversation_id, err
            );
            self.reconcile_quietly(conversation_id).await;
            if !self.backoff(cancel, delay).await
                || !self.is_current(conversation_id, generation)
            {
                let err = SyncError::Cancelled;
                listener.on_error(conversation_id, &err.to_string()).await;
                return Err(err);
            }
        }
    }

    /// 打开只读订阅，在后台任务中运行直到正常关闭、取消或超过重连上限
    pub fn connect(
        self: &Arc<Self>,
        conversation_id: &str,
        listener: Arc<dyn StreamListener>,
    ) -> ConnectionHandle {
        let (generation, cancel) = self.claim(conversation_id);
        info!(
            "[Transport] 📡 开始订阅: conversationID={}, generation={}",
            conversation_id, generation
        );

        let this = Arc::clone(self);
        let conv = conversation_id.to_string();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            this.status.stream_started();
            this.run_subscribe(&conv, generation, &token, listener.as_ref())
                .await;
            this.status.stream_finished();
            this.release(&conv, generation);
            debug!(
                "[Transport] 订阅任务结束: conversationID={}, generation={}",
                conv, generation
            );
        });

        ConnectionHandle {
            conversation_id: conversation_id.to_string(),
            generation,
            cancel,
            join,
        }
    }

    async fn run_subscribe(
        &self,
        conversation_id: &str,
        generation: u64,
        cancel: &CancellationToken,
        listener: &dyn StreamListener,
    ) {
        let mut state = ConnectionState::new(generation);

        loop {
            if cancel.is_cancelled() {
                return;
            }
            state = state.on_connecting();
            self.store_state(conversation_id, state);

            let after_sequence = match self.reconciler.resume_point(conversation_id).await {
                Ok(seq) => seq,
                Err(e) => {
                    warn!("[Transport] 读取续传位置失败，从头订阅: {}", e);
                    0
                }
            };
            let stream = self
                .remote
                .open_stream(conversation_id, StreamRequest::Subscribe { after_sequence });
            let (attempt, opened) = self
                .pump(
                    conversation_id,
                    cancel,
                    stream,
                    listener,
                    &mut state,
                    Mode::Subscribe,
                )
                .await;

            match attempt {
                Attempt::Closed | Attempt::Completed(_) => {
                    state = state.on_clean_close();
                    self.store_state(conversation_id, state);
                    info!(
                        "[Transport] 订阅连接正常关闭: conversationID={}",
                        conversation_id
                    );
                    self.reconcile_quietly(conversation_id).await;
                    self.close_connection(conversation_id, listener, opened)
                        .await;
                    return;
                }
                Attempt::Cancelled => {
                    self.close_connection(conversation_id, listener, opened)
                        .await;
                    return;
                }
                Attempt::Failed(err) if err.is_transport() => {
                    self.close_connection(conversation_id, listener, opened)
                        .await;
                    let (next, delay) = state.on_transport_error(&self.policy);
                    state = next;
                    self.store_state(conversation_id, state);
                    let Some(delay) = delay else {
                        let err = SyncError::Transport(format!(
                            "重连 {} 次后仍失败: {}",
                            self.policy.max_attempts, err
                        ));
                        error!("[Transport] ❌ {}: conversationID={}", err, conversation_id);
                        listener.on_error(conversation_id, &err.to_string()).await;
                        return;
                    };
                    warn!(
                        "[Transport] ⚠️ 订阅断开，{:?} 后第 {} 次重连: conversationID={}, error={}",
                        delay, state.attempt, conversation_id, err
                    );
                    self.reconcile_quietly(conversation_id).await;
                    if !self.backoff(cancel, delay).await {
                        return;
                    }
                }
                Attempt::Failed(err) => {
                    state = state.on_fatal();
                    self.store_state(conversation_id, state);
                    warn!(
                        "[Transport] ❌ 订阅协议错误: conversationID={}, error={}",
                        conversation_id, err
                    );
                    listener.on_error(conversation_id, &err.to_string()).await;
                    self.close_connection(conversation_id, listener, opened)
                        .await;
                    return;
                }
            }
        }
    }

    /// 读取一次连接的全部帧，返回结果以及连接是否打开过
    async fn pump(
        &self,
        conversation_id: &str,
        cancel: &CancellationToken,
        mut stream: WireStream,
        listener: &dyn StreamListener,
        state: &mut ConnectionState,
        mode: Mode,
    ) -> (Attempt, bool) {
        let generation = state.generation;
        let mut guard = EventGuard::new();
        let mut opened = false;
        let mut completed: Option<ConfirmedMessage> = None;

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return (completed.map_or(Attempt::Cancelled, Attempt::Completed), opened);
                }
                frame = stream.next() => frame,
            };

            // 已被取代的连接：丢弃迟到事件
            if completed.is_none() && !self.is_current(conversation_id, generation) {
                debug!(
                    "[Transport] 丢弃过期连接的事件: conversationID={}, generation={}",
                    conversation_id, generation
                );
                return (Attempt::Cancelled, opened);
            }

            let frame = match frame {
                None => {
                    return (completed.map_or(Attempt::Closed, Attempt::Completed), opened);
                }
                Some(Err(e)) => {
                    return match completed {
                        Some(message) => {
                            debug!("[Transport] complete 之后连接断开，忽略: {}", e);
                            (Attempt::Completed(message), opened)
                        }
                        None => (Attempt::Failed(e), opened),
                    };
                }
                Some(Ok(frame)) => frame,
            };

            if !opened {
                opened = true;
                *state = state.on_open();
                self.store_state(conversation_id, *state);
                self.status.connection_opened();
                listener.on_connected(conversation_id).await;
            }

            let (name, data) = match frame {
                WireFrame::Open => continue,
                WireFrame::Event { name, data } => (name, data),
            };

            let checked = parse_event(&name, &data).and_then(|event| {
                guard.check(&event)?;
                Ok(event)
            });
            let event = match checked {
                Ok(event) => event,
                Err(e) => {
                    return match completed {
                        Some(message) => {
                            warn!(
                                "[Transport] ⚠️ complete 之后的非法事件，停止读取: {}",
                                e
                            );
                            (Attempt::Completed(message), opened)
                        }
                        None => (Attempt::Failed(e), opened),
                    };
                }
            };

            match event {
                StreamEvent::Connected | StreamEvent::Heartbeat => {}
                StreamEvent::Token { token, index } => {
                    listener.on_token(conversation_id, &token, index).await;
                }
                StreamEvent::UserMessage(message) => {
                    listener.on_user_message_echoed(&message).await;
                }
                StreamEvent::Complete { message, sequence } => {
                    listener.on_complete(&message, sequence).await;
                    match mode {
                        Mode::Submit => completed = Some(message),
                        Mode::Subscribe => guard.reset(),
                    }
                }
                StreamEvent::ServerError {
                    code,
                    message,
                    retry_after,
                } => match mode {
                    Mode::Submit => {
                        return (
                            Attempt::Failed(SyncError::Server {
                                code,
                                message,
                                retry_after,
                            }),
                            opened,
                        );
                    }
                    Mode::Subscribe => {
                        warn!(
                            "[Transport] ⚠️ 订阅收到服务器错误: conversationID={}, code={:?}, message={}",
                            conversation_id, code, message
                        );
                        listener.on_error(conversation_id, &message).await;
                        guard.reset();
                    }
                },
                StreamEvent::Replayed(message) => match mode {
                    Mode::Subscribe => listener.on_message_replayed(&message).await,
                    Mode::Submit => debug!("[Transport] 提交流中忽略回放消息: {}", message.id),
                },
                StreamEvent::ReplayComplete {
                    last_sequence,
                    message_count,
                } => {
                    info!(
                        "[Transport] 回放完成: conversationID={}, lastSequence={}, count={}",
                        conversation_id, last_sequence, message_count
                    );
                }
                StreamEvent::Done => match mode {
                    Mode::Submit => {
                        return (completed.map_or(Attempt::Closed, Attempt::Completed), opened);
                    }
                    Mode::Subscribe => guard.reset(),
                },
                StreamEvent::Unknown(name) => {
                    debug!("[Transport] 忽略未知事件: {}", name);
                }
            }
        }
    }

    async fn close_connection(
        &self,
        conversation_id: &str,
        listener: &dyn StreamListener,
        opened: bool,
    ) {
        if opened {
            self.status.connection_closed();
            listener.on_disconnected(conversation_id).await;
        }
    }

    async fn reconcile_quietly(&self, conversation_id: &str) {
        if let Err(e) = self.reconciler.sync(conversation_id).await {
            warn!(
                "[Transport] 补齐失败（游标保持 stale，等待下次触发）: conversationID={}, error={}",
                conversation_id, e
            );
        }
    }

    /// 等待退避时间，期间被取消返回 `false`
    async fn backoff(&self, cancel: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
