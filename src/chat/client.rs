//! 同步控制器
//!
//! 编排本地日志、待发送队列、流式传输和增量补齐：
//! 提交（入队 → 占位 → 发送 → 落库 → 出队）、订阅、定时补发。
//! 只有控制器和补齐器会写本地日志与待发送队列。

use crate::chat::auth::TokenProvider;
use crate::chat::db::create_sqlite_pool_with_tables;
use crate::chat::error::SyncError;
use crate::chat::message::{ConfirmedMessage, CursorStatus, LocalLog, SyncCursor};
use crate::chat::pending::{PendingQueue, PendingStatus, PendingSubmission, PlaceholderMessage};
use crate::chat::reconciler::{Reconciler, SyncReport};
use crate::chat::status::{ClientStatus, StatusBoard};
use crate::chat::stream::{
    ConnectionHandle, ConversationRemote, EmptyStreamListener, HttpConversationApi,
    ReconnectPolicy, StreamListener, StreamTransport,
};
use crate::chat::types::SendMessageRequest;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use sqlx::{Pool, Sqlite};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认模型
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// HTTP API 基础地址，例如 `http://localhost:8080/api/v1`
    pub api_base_url: String,
    /// 本地 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://convo_sync.db?mode=rwc`
    pub db_url: String,
    /// 提交时未指定模型时使用
    pub default_model: String,
    /// 每页拉取条数（服务器上限 100）
    pub page_limit: i64,
    /// 一次补齐最多拉取的页数
    pub max_sync_pages: usize,
    /// 提交最多重试次数，超过后视为永久失败
    pub max_retries: i64,
    /// 定时补发间隔
    pub retry_interval: Duration,
    /// 流式连接重连策略
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(api_base_url: impl Into<String>, db_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            db_url: db_url.into(),
            default_model: DEFAULT_MODEL.to_string(),
            page_limit: 100,
            max_sync_pages: 50,
            max_retries: 3,
            retry_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// 一次提交的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// 回复已确认并写入本地日志
    Delivered {
        local_id: i64,
        message: ConfirmedMessage,
    },
    /// 本次发送失败，提交保留在队列中
    Failed {
        local_id: i64,
        error: String,
        retry_count: i64,
        /// 已达到重试上限，不会再被自动补发
        permanently: bool,
    },
    /// 提交已被其他发送认领（或已出队），本次未发送
    Skipped { local_id: i64 },
}

impl SubmitOutcome {
    pub fn local_id(&self) -> i64 {
        match self {
            SubmitOutcome::Delivered { local_id, .. }
            | SubmitOutcome::Failed { local_id, .. }
            | SubmitOutcome::Skipped { local_id } => *local_id,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, SubmitOutcome::Delivered { .. })
    }
}

/// 提交句柄；丢弃句柄不会取消发送
pub struct SubmitHandle {
    pub local_id: i64,
    pub placeholder: PlaceholderMessage,
    join: JoinHandle<SubmitOutcome>,
}

impl SubmitHandle {
    /// 等待发送结束
    pub async fn outcome(self) -> Result<SubmitOutcome, SyncError> {
        let local_id = self.local_id;
        self.join.await.map_err(|e| SyncError::Submission {
            local_id,
            reason: format!("发送任务异常退出: {}", e),
        })
    }
}

/// 一次补发的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySweepReport {
    /// 本次补发成功的 local_id
    pub delivered: Vec<i64>,
    /// 本次补发失败的 local_id
    pub failed: Vec<i64>,
    /// 已达到重试上限、永久失败的 local_id
    pub exhausted: Vec<i64>,
}

/// 界面渲染用的时间线条目
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineItem {
    Confirmed(ConfirmedMessage),
    Placeholder(PlaceholderMessage),
}

/// 订阅句柄
pub struct Subscription {
    handle: ConnectionHandle,
}

impl Subscription {
    pub fn conversation_id(&self) -> &str {
        self.handle.conversation_id()
    }

    /// 取消订阅
    pub fn unsubscribe(&self) {
        self.handle.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// 等待订阅结束
    pub async fn closed(self) {
        self.handle.closed().await;
    }
}

/// 同步控制器
#[derive(Clone)]
pub struct SyncController {
    config: ClientConfig,
    log: Arc<LocalLog>,
    queue: Arc<PendingQueue>,
    transport: Arc<StreamTransport>,
    reconciler: Arc<Reconciler>,
    status: Arc<StatusBoard>,
    // 提交使用的监听器（可由调用方注册）
    listener: Arc<RwLock<Arc<dyn StreamListener>>>,
    // local_id → 已回显的用户消息 id，回显后占位消息不再出现在时间线中
    echoed: Arc<Mutex<HashMap<i64, String>>>,
    // 同一时刻只有一次补发在进行
    sweep_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SyncController {
    /// 打开本地数据库并连接 HTTP API
    pub async fn open(config: ClientConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        info!(
            "[SyncCtl] 🚀 初始化同步控制器: api={}, db={}",
            config.api_base_url, config.db_url
        );
        let pool = create_sqlite_pool_with_tables(&config.db_url).await?;
        let remote = Arc::new(HttpConversationApi::new(&config.api_base_url, tokens)?);
        Self::with_db_and_remote(config, pool, remote).await
    }

    /// 使用已有连接池和远端实现创建控制器
    pub async fn with_db_and_remote(
        config: ClientConfig,
        pool: Pool<Sqlite>,
        remote: Arc<dyn ConversationRemote>,
    ) -> Result<Self> {
        let status = Arc::new(StatusBoard::new());
        let log = Arc::new(LocalLog::new(pool.clone()));
        let queue = Arc::new(PendingQueue::new(pool));
        let reconciler = Arc::new(Reconciler::new(
            log.clone(),
            remote.clone(),
            status.clone(),
            config.page_limit,
            config.max_sync_pages,
        ));
        let transport = Arc::new(StreamTransport::new(
            remote,
            reconciler.clone(),
            status.clone(),
            config.reconnect,
        ));

        // 上次进程退出时仍在发送中的提交
        queue.recover_interrupted().await?;

        Ok(Self {
            config,
            log,
            queue,
            transport,
            reconciler,
            status,
            listener: Arc::new(RwLock::new(Arc::new(EmptyStreamListener))),
            echoed: Arc::new(Mutex::new(HashMap::new())),
            sweep_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 注册提交/补发使用的监听器
    pub fn set_listener(&self, listener: Arc<dyn StreamListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    fn listener(&self) -> Arc<dyn StreamListener> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn echoed(&self) -> std::sync::MutexGuard<'_, HashMap<i64, String>> {
        self.echoed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 提交一条用户消息
    ///
    /// 入队并回调占位消息后立即返回，发送在后台任务中进行。
    pub async fn submit(
        &self,
        conversation_id: &str,
        content: &str,
        model: Option<&str>,
    ) -> Result<SubmitHandle, SyncError> {
        let model = model.unwrap_or(self.config.default_model.as_str());
        let local_id = self.queue.enqueue(conversation_id, content, model).await?;
        let submission = self
            .queue
            .get(local_id)
            .await?
            .ok_or_else(|| SyncError::Submission {
                local_id,
                reason: "入队后未找到提交".to_string(),
            })?;

        let placeholder = submission.placeholder();
        let listener = self.listener();
        listener.on_placeholder(&placeholder).await;

        let this = self.clone();
        let join = tokio::spawn(async move { this.deliver(submission, listener).await });

        Ok(SubmitHandle {
            local_id,
            placeholder,
            join,
        })
    }

    /// 发送一条提交直到终态：成功则落库后出队，失败则标记 failed
    async fn deliver(
        &self,
        submission: PendingSubmission,
        listener: Arc<dyn StreamListener>,
    ) -> SubmitOutcome {
        let local_id = submission.local_id;
        let conversation_id = submission.conversation_id.clone();

        match self.queue.mark_sending(local_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("[SyncCtl] 提交已被认领或已出队，跳过: localID={}", local_id);
                return SubmitOutcome::Skipped { local_id };
            }
            Err(e) => return self.fail(&submission, e.into(), listener.as_ref()).await,
        }
        info!(
            "[SyncCtl] 📤 发送提交: localID={}, conversationID={}, retryCount={}",
            local_id, conversation_id, submission.retry_count
        );

        let forwarder: Arc<dyn StreamListener> = Arc::new(SubmitForwarder {
            controller: self.clone(),
            local_id,
            inner: listener.clone(),
        });
        let request = SendMessageRequest::streaming(&submission.content, &submission.model);
        let result = self
            .transport
            .send_and_stream(
                &conversation_id,
                request,
                &submission.idempotency_key,
                forwarder,
            )
            .await;

        let outcome = match result {
            Ok(message) => match self.complete_submission(local_id, &message).await {
                Ok(()) => {
                    self.catch_up_if_stale(&conversation_id).await;
                    listener.on_complete(&message, message.sequence).await;
                    SubmitOutcome::Delivered { local_id, message }
                }
                Err(e) => self.fail(&submission, e, listener.as_ref()).await,
            },
            Err(e) => self.fail(&submission, e, listener.as_ref()).await,
        };
        self.echoed().remove(&local_id);
        outcome
    }

    /// 回复落库 → 推进游标 → 出队（出队一定发生在落库之后）
    async fn complete_submission(
        &self,
        local_id: i64,
        message: &ConfirmedMessage,
    ) -> Result<(), SyncError> {
        self.persist_live(message).await?;
        self.queue.dequeue(local_id).await?;
        info!(
            "[SyncCtl] ✅ 提交已确认: localID={}, messageID={}, sequence={}",
            local_id, message.id, message.sequence
        );
        Ok(())
    }

    /// 游标未追平时（例如只通过提交产生过消息的会话）补齐一次，让游标覆盖实时写入的回复
    async fn catch_up_if_stale(&self, conversation_id: &str) {
        match self.log.cursor_for(conversation_id).await {
            Ok(cursor) if cursor.status == CursorStatus::Synced => {}
            Ok(cursor) => {
                debug!(
                    "[SyncCtl] 游标未追平，提交完成后补齐: conversationID={}, lastSequence={}",
                    conversation_id, cursor.last_sequence
                );
                if let Err(e) = self.reconciler.sync(conversation_id).await {
                    warn!(
                        "[SyncCtl] ⚠️ 提交完成后补齐失败: conversationID={}, error={}",
                        conversation_id, e
                    );
                }
            }
            Err(e) => warn!(
                "[SyncCtl] 读取游标失败: conversationID={}, error={:#}",
                conversation_id, e
            ),
        }
    }

    async fn fail(
        &self,
        submission: &PendingSubmission,
        error: SyncError,
        listener: &dyn StreamListener,
    ) -> SubmitOutcome {
        let local_id = submission.local_id;
        let retry_count = match self.queue.mark_failed(local_id).await {
            Ok(count) => count,
            Err(e) => {
                error!(
                    "[SyncCtl] 标记提交失败状态失败: localID={}, error={:#}",
                    local_id, e
                );
                submission.retry_count + 1
            }
        };
        let permanently = retry_count >= self.config.max_retries;
        let wrapped = SyncError::Submission {
            local_id,
            reason: error.to_string(),
        };
        if permanently {
            error!(
                "[SyncCtl] ❌ 提交永久失败（已重试 {} 次）: {}",
                retry_count, wrapped
            );
        } else {
            warn!("[SyncCtl] ⚠️ {}，等待补发", wrapped);
        }
        listener
            .on_error(&submission.conversation_id, &wrapped.to_string())
            .await;

        SubmitOutcome::Failed {
            local_id,
            error: error.to_string(),
            retry_count,
            permanently,
        }
    }

    /// 实时收到的已确认消息：幂等写入；游标已追平时才推进，否则留给补齐
    async fn persist_live(&self, message: &ConfirmedMessage) -> Result<(), SyncError> {
        self.log.append(std::slice::from_ref(message)).await?;
        let cursor = self.log.cursor_for(&message.conversation_id).await?;
        if cursor.status == CursorStatus::Synced {
            self.log
                .advance_cursor(
                    &message.conversation_id,
                    message.sequence,
                    CursorStatus::Synced,
                )
                .await?;
        }
        Ok(())
    }

    /// 补发所有可重试的提交（按创建时间顺序逐条发送）
    ///
    /// 并发调用会排队执行；已在发送中的提交不会被重复发送。
    pub async fn retry_sweep(&self) -> Result<RetrySweepReport, SyncError> {
        let _sweeping = self.sweep_lock.lock().await;
        let retryable = self.queue.list_retryable(self.config.max_retries).await?;
        let mut report = RetrySweepReport::default();
        if !retryable.is_empty() {
            info!("[SyncCtl] 🔄 开始补发，共 {} 条", retryable.len());
        }

        let listener = self.listener();
        for submission in retryable {
            let local_id = submission.local_id;
            match self.deliver(submission, listener.clone()).await {
                SubmitOutcome::Delivered { .. } => report.delivered.push(local_id),
                SubmitOutcome::Failed { .. } => report.failed.push(local_id),
                SubmitOutcome::Skipped { .. } => {}
            }
        }

        report.exhausted = self
            .queue
            .list_exhausted(self.config.max_retries)
            .await?
            .into_iter()
            .map(|s| s.local_id)
            .collect();
        if !report.exhausted.is_empty() {
            warn!(
                "[SyncCtl] ⚠️ {} 条提交已永久失败: {:?}",
                report.exhausted.len(),
                report.exhausted
            );
        }
        Ok(report)
    }

    /// 定时补发（由应用在合适的时候启动，例如网络恢复之后）
    pub fn spawn_retry_timer(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("[SyncCtl] 定时补发已停止");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = this.retry_sweep().await {
                            warn!("[SyncCtl] 定时补发失败: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// 订阅会话：实时回复和回放的消息会先落库再回调
    pub fn subscribe(
        &self,
        conversation_id: &str,
        listener: Arc<dyn StreamListener>,
    ) -> Subscription {
        let wrapper = Arc::new(SubscriptionForwarder {
            controller: self.clone(),
            inner: listener,
        });
        Subscription {
            handle: self.transport.connect(conversation_id, wrapper),
        }
    }

    /// 手动补齐
    pub async fn sync(&self, conversation_id: &str) -> Result<SyncReport, SyncError> {
        self.reconciler.sync(conversation_id).await
    }

    /// 按序号读取已确认消息
    pub fn read_ordered<'a>(
        &'a self,
        conversation_id: &str,
    ) -> BoxStream<'a, Result<ConfirmedMessage>> {
        self.log.read_ordered(conversation_id)
    }

    /// 渲染用时间线：已确认消息按序号，其后是占位消息（按创建时间）
    pub async fn timeline(&self, conversation_id: &str) -> Result<Vec<TimelineItem>, SyncError> {
        let mut items: Vec<TimelineItem> = self
            .log
            .load_ordered(conversation_id)
            .await?
            .into_iter()
            .map(TimelineItem::Confirmed)
            .collect();

        let echoed: HashSet<i64> = self.echoed().keys().copied().collect();
        let pending = self.queue.list_for_conversation(conversation_id).await?;
        items.extend(
            pending
                .into_iter()
                .filter(|s| !echoed.contains(&s.local_id))
                .map(|s| TimelineItem::Placeholder(s.placeholder())),
        );
        Ok(items)
    }

    pub async fn cursor(&self, conversation_id: &str) -> Result<SyncCursor, SyncError> {
        Ok(self.log.cursor_for(conversation_id).await?)
    }

    /// 待发送提交（不指定会话时返回全部）
    pub async fn pending(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<Vec<PendingSubmission>, SyncError> {
        Ok(match conversation_id {
            Some(conv) => self.queue.list_for_conversation(conv).await?,
            None => self.queue.list_all().await?,
        })
    }

    /// 丢弃一条未送达的提交（发送中的不允许丢弃）
    pub async fn discard_pending(&self, local_id: i64) -> Result<bool, SyncError> {
        match self.queue.get(local_id).await? {
            None => Ok(false),
            Some(s) if s.status == PendingStatus::Sending => Err(SyncError::Submission {
                local_id,
                reason: "提交正在发送中，不能丢弃".to_string(),
            }),
            Some(_) => {
                info!("[SyncCtl] 🗑️ 丢弃提交: localID={}", local_id);
                Ok(self.queue.dequeue(local_id).await?)
            }
        }
    }

    /// 用户手动重发：清零重试次数后立即发送
    pub async fn resubmit_pending(&self, local_id: i64) -> Result<SubmitOutcome, SyncError> {
        let submission = match self.queue.get(local_id).await? {
            Some(s) if s.status != PendingStatus::Sending => s,
            Some(_) => {
                return Err(SyncError::Submission {
                    local_id,
                    reason: "提交正在发送中".to_string(),
                })
            }
            None => {
                return Err(SyncError::Submission {
                    local_id,
                    reason: "提交不存在".to_string(),
                })
            }
        };
        if !self.queue.reset_retries(local_id).await? {
            // 检查之后被补发认领
            return Err(SyncError::Submission {
                local_id,
                reason: "提交正在发送中".to_string(),
            });
        }
        let submission = PendingSubmission {
            retry_count: 0,
            status: PendingStatus::Failed,
            ..submission
        };
        Ok(self.deliver(submission, self.listener()).await)
    }

    /// 删除会话的全部本地数据（先断开活动连接）
    pub async fn purge_conversation(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.transport.disconnect(conversation_id);
        self.log.purge(conversation_id).await?;
        Ok(())
    }

    /// 状态观察
    pub fn status(&self) -> watch::Receiver<ClientStatus> {
        self.status.subscribe()
    }

    pub fn is_streaming(&self) -> bool {
        self.status.snapshot().is_streaming()
    }

    pub fn is_syncing(&self) -> bool {
        self.status.snapshot().is_syncing()
    }

    pub fn is_connected(&self) -> bool {
        self.status.snapshot().is_connected()
    }

    /// 断开全部连接
    pub fn shutdown(&self) {
        info!("[SyncCtl] 关闭同步控制器");
        self.transport.disconnect_all();
    }
}

/// 提交流的转发监听器：回显的用户消息先落库，终态由控制器在落库后回调
struct SubmitForwarder {
    controller: SyncController,
    local_id: i64,
    inner: Arc<dyn StreamListener>,
}

#[async_trait]
impl StreamListener for SubmitForwarder {
    async fn on_connected(&self, conversation_id: &str) {
        self.inner.on_connected(conversation_id).await;
    }

    async fn on_disconnected(&self, conversation_id: &str) {
        self.inner.on_disconnected(conversation_id).await;
    }

    async fn on_token(&self, conversation_id: &str, token: &str, index: i64) {
        self.inner.on_token(conversation_id, token, index).await;
    }

    async fn on_user_message_echoed(&self, message: &ConfirmedMessage) {
        match self.controller.persist_live(message).await {
            Ok(()) => {
                self.controller
                    .echoed()
                    .insert(self.local_id, message.id.clone());
            }
            Err(e) => warn!(
                "[SyncCtl] 回显消息落库失败: messageID={}, error={}",
                message.id, e
            ),
        }
        self.inner.on_user_message_echoed(message).await;
    }

    async fn on_complete(&self, _message: &ConfirmedMessage, _sequence: i64) {}

    async fn on_error(&self, _conversation_id: &str, _error: &str) {}

    async fn on_message_replayed(&self, message: &ConfirmedMessage) {
        self.inner.on_message_replayed(message).await;
    }

    async fn on_placeholder(&self, placeholder: &PlaceholderMessage) {
        self.inner.on_placeholder(placeholder).await;
    }
}

/// 订阅流的转发监听器：消息先落库再回调
struct SubscriptionForwarder {
    controller: SyncController,
    inner: Arc<dyn StreamListener>,
}

#[async_trait]
impl StreamListener for SubscriptionForwarder {
    async fn on_connected(&self, conversation_id: &str) {
        self.inner.on_connected(conversation_id).await;
    }

    async fn on_disconnected(&self, conversation_id: &str) {
        self.inner.on_disconnected(conversation_id).await;
    }

    async fn on_token(&self, conversation_id: &str, token: &str, index: i64) {
        self.inner.on_token(conversation_id, token, index).await;
    }

    async fn on_user_message_echoed(&self, message: &ConfirmedMessage) {
        if let Err(e) = self.controller.persist_live(message).await {
            warn!("[SyncCtl] 订阅消息落库失败: {}", e);
        }
        self.inner.on_user_message_echoed(message).await;
    }

    async fn on_complete(&self, message: &ConfirmedMessage, sequence: i64) {
        if let Err(e) = self.controller.persist_live(message).await {
            warn!("[SyncCtl] 订阅消息落库失败: {}", e);
        }
        self.inner.on_complete(message, sequence).await;
    }

    async fn on_error(&self, conversation_id: &str, error: &str) {
        self.inner.on_error(conversation_id, error).await;
    }

    /// 回放按序号连续，落库后直接推进游标
    async fn on_message_replayed(&self, message: &ConfirmedMessage) {
        let log = &self.controller.log;
        let persisted = async {
            log.append(std::slice::from_ref(message)).await?;
            log.advance_cursor(
                &message.conversation_id,
                message.sequence,
                CursorStatus::Synced,
            )
            .await
        };
        if let Err(e) = persisted.await {
            warn!("[SyncCtl] 回放消息落库失败: {:#}", e);
        }
        self.inner.on_message_replayed(message).await;
    }

    async fn on_placeholder(&self, placeholder: &PlaceholderMessage) {
        self.inner.on_placeholder(placeholder).await;
    }
}
