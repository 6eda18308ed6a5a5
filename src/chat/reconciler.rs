//! 增量补齐（gap-fill）
//!
//! 从本地游标之后按页拉取已确认消息，幂等写入本地日志并推进游标。
//! 分页用显式循环加页数上限，拉取失败只把游标标记为 stale，不回退序号。

use crate::chat::error::SyncError;
use crate::chat::message::{CursorStatus, LocalLog};
use crate::chat::status::StatusBoard;
use crate::chat::stream::ConversationRemote;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 一次补齐的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// 本次拉取到的消息条数（含本地已存在的）
    pub fetched: usize,
    pub pages: usize,
    /// 补齐后的游标位置
    pub last_sequence: i64,
    /// 是否已追平服务器
    pub caught_up: bool,
}

pub struct Reconciler {
    log: Arc<LocalLog>,
    remote: Arc<dyn ConversationRemote>,
    status: Arc<StatusBoard>,
    page_limit: i64,
    max_pages: usize,
}

impl Reconciler {
    pub fn new(
        log: Arc<LocalLog>,
        remote: Arc<dyn ConversationRemote>,
        status: Arc<StatusBoard>,
        page_limit: i64,
        max_pages: usize,
    ) -> Self {
        Self {
            log,
            remote,
            status,
            page_limit,
            max_pages,
        }
    }

    /// 补齐一个会话
    pub async fn sync(&self, conversation_id: &str) -> Result<SyncReport, SyncError> {
        self.status.sync_started();
        let result = self.sync_pages(conversation_id).await;
        self.status.sync_finished();

        match &result {
            Ok(report) => info!(
                "[Reconcile] ✅ 补齐完成: conversationID={}, fetched={}, pages={}, lastSequence={}, caughtUp={}",
                conversation_id,
                report.fetched,
                report.pages,
                report.last_sequence,
                report.caught_up
            ),
            Err(e) => warn!(
                "[Reconcile] ⚠️ 补齐失败: conversationID={}, error={}",
                conversation_id, e
            ),
        }
        result
    }

    /// 订阅重连时的续传位置（本地游标）
    pub async fn resume_point(&self, conversation_id: &str) -> Result<i64, SyncError> {
        Ok(self.log.cursor_for(conversation_id).await?.last_sequence)
    }

    async fn sync_pages(&self, conversation_id: &str) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        for _ in 0..self.max_pages {
            let cursor = self.log.cursor_for(conversation_id).await?;
            report.last_sequence = cursor.last_sequence;
            self.log
                .set_cursor_status(conversation_id, CursorStatus::Syncing)
                .await?;

            let resp = match self
                .remote
                .list_messages(conversation_id, cursor.last_sequence, self.page_limit)
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    self.log
                        .set_cursor_status(conversation_id, CursorStatus::Stale)
                        .await?;
                    return Err(SyncError::Reconciliation(e.to_string()));
                }
            };
            report.pages += 1;

            if let Err(e) = self.log.append(&resp.messages).await {
                self.log
                    .set_cursor_status(conversation_id, CursorStatus::Stale)
                    .await?;
                return Err(e.into());
            }
            report.fetched += resp.messages.len();

            let page_max = resp.messages.iter().map(|m| m.sequence).max().unwrap_or(0);
            let target = resp
                .last_sequence
                .max(page_max)
                .max(cursor.last_sequence);
            let stalled = resp.has_more && target <= cursor.last_sequence;
            let status = if resp.has_more {
                CursorStatus::Stale
            } else {
                CursorStatus::Synced
            };

            if !self.log.advance_cursor(conversation_id, target, status).await? {
                self.log.set_cursor_status(conversation_id, status).await?;
            }
            report.last_sequence = self.log.cursor_for(conversation_id).await?.last_sequence;
            debug!(
                "[Reconcile] 第 {} 页: {} 条, cursor {} → {}, hasMore={}",
                report.pages,
                resp.messages.len(),
                cursor.last_sequence,
                report.last_sequence,
                resp.has_more
            );

            if !resp.has_more {
                report.caught_up = true;
                return Ok(report);
            }
            if stalled {
                warn!(
                    "[Reconcile] ⚠️ 服务器声明还有更多消息但游标无法前进: conversationID={}",
                    conversation_id
                );
                return Ok(report);
            }
        }

        warn!(
            "[Reconcile] 达到分页上限 {}，剩余消息留待下次补齐: conversationID={}",
            self.max_pages, conversation_id
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::db::memory_pool;
    use crate::chat::testing::{confirmed, ScriptedRemote};

    async fn setup(remote: Arc<ScriptedRemote>, page_limit: i64) -> (Arc<LocalLog>, Reconciler) {
        let log = Arc::new(LocalLog::new(memory_pool().await));
        let reconciler = Reconciler::new(
            log.clone(),
            remote,
            Arc::new(StatusBoard::new()),
            page_limit,
            50,
        );
        (log, reconciler)
    }

    #[tokio::test]
    async fn cursor_advances_from_10_to_12_and_is_synced() -> anyhow::Result<()> {
        let remote = Arc::new(ScriptedRemote::new());
        let history: Vec<_> = (1..=12).map(|s| confirmed("c1", s, "x")).collect();
        remote.set_history("c1", history.clone());
        let (log, reconciler) = setup(remote.clone(), 100).await;

        log.append(&history[..10]).await?;
        log.advance_cursor("c1", 10, CursorStatus::Synced).await?;

        let report = reconciler.sync("c1").await?;
        assert_eq!(report.fetched, 2);
        assert!(report.caught_up);

        let cursor = log.cursor_for("c1").await?;
        assert_eq!(cursor.last_sequence, 12);
        assert_eq!(cursor.status, CursorStatus::Synced);
        let seqs: Vec<i64> = log.load_ordered("c1").await?.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, (1..=12).collect::<Vec<_>>());
        assert_eq!(remote.list_calls(), vec![("c1".to_string(), 10)]);
        Ok(())
    }

    #[tokio::test]
    async fn gap_fill_is_idempotent() -> anyhow::Result<()> {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_history("c1", (1..=7).map(|s| confirmed("c1", s, "x")).collect());
        let (log, reconciler) = setup(remote.clone(), 100).await;

        reconciler.sync("c1").await?;
        let first = log.load_ordered("c1").await?;
        let first_cursor = log.cursor_for("c1").await?;

        let again = reconciler.sync("c1").await?;
        assert_eq!(again.fetched, 0);
        assert_eq!(log.load_ordered("c1").await?, first);
        assert_eq!(log.cursor_for("c1").await?.last_sequence, first_cursor.last_sequence);
        Ok(())
    }

    #[tokio::test]
    async fn pages_are_followed_until_caught_up() -> anyhow::Result<()> {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_history("c1", (1..=7).map(|s| confirmed("c1", s, "x")).collect());
        let (log, reconciler) = setup(remote.clone(), 3).await;

        let report = reconciler.sync("c1").await?;
        assert_eq!(report.pages, 3);
        assert_eq!(report.last_sequence, 7);
        assert!(report.caught_up);
        assert_eq!(log.count("c1").await?, 7);
        let afters: Vec<i64> = remote.list_calls().into_iter().map(|(_, a)| a).collect();
        assert_eq!(afters, vec![0, 3, 6]);
        Ok(())
    }

    #[tokio::test]
    async fn page_cap_leaves_cursor_stale() -> anyhow::Result<()> {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_history("c1", (1..=10).map(|s| confirmed("c1", s, "x")).collect());
        let log = Arc::new(LocalLog::new(memory_pool().await));
        let reconciler = Reconciler::new(log.clone(), remote, Arc::new(StatusBoard::new()), 2, 2);

        let report = reconciler.sync("c1").await?;
        assert!(!report.caught_up);
        let cursor = log.cursor_for("c1").await?;
        assert_eq!(cursor.last_sequence, 4);
        assert_eq!(cursor.status, CursorStatus::Stale);
        Ok(())
    }

    #[tokio::test]
    async fn fetch_failure_marks_stale_without_regressing() -> anyhow::Result<()> {
        let remote = Arc::new(ScriptedRemote::new());
        let (log, reconciler) = setup(remote.clone(), 100).await;
        log.advance_cursor("c1", 9, CursorStatus::Synced).await?;
        remote.fail_next_lists(1);

        let err = reconciler.sync("c1").await.unwrap_err();
        assert!(matches!(err, SyncError::Reconciliation(_)));
        let cursor = log.cursor_for("c1").await?;
        assert_eq!(cursor.last_sequence, 9);
        assert_eq!(cursor.status, CursorStatus::Stale);
        Ok(())
    }

    #[tokio::test]
    async fn syncing_flag_is_cleared_after_each_outcome() -> anyhow::Result<()> {
        let remote = Arc::new(ScriptedRemote::new());
        let log = Arc::new(LocalLog::new(memory_pool().await));
        let status = Arc::new(StatusBoard::new());
        let reconciler = Reconciler::new(log.clone(), remote.clone(), status.clone(), 100, 50);

        reconciler.sync("c1").await?;
        assert!(!status.snapshot().is_syncing());
        assert_eq!(log.cursor_for("c1").await?.status, CursorStatus::Synced);

        remote.fail_next_lists(1);
        let _ = reconciler.sync("c1").await;
        assert!(!status.snapshot().is_syncing());
        assert_ne!(log.cursor_for("c1").await?.status, CursorStatus::Syncing);
        Ok(())
    }
}
