//! 待发送队列数据访问层（DAO）
//!
//! 用户提交在得到服务器确认之前一直保存在 `pending_messages` 表中，
//! 进程崩溃或断网后都可以从这里恢复并补发。

use crate::chat::pending::models::{PendingStatus, PendingSubmission};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SELECT_COLUMNS: &str = r#"
    SELECT local_id, conversation_id, content, model, idempotency_key,
           status, created_at, retry_count
    FROM pending_messages
"#;

/// 待发送队列
pub struct PendingQueue {
    pool: Pool<Sqlite>,
}

impl PendingQueue {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// 使用共享连接初始化待发送表（静态方法）
    pub async fn init_db_with_connection(db: &Pool<Sqlite>) -> Result<()> {
        info!("[Pending/DB] 初始化待发送表");

        let sql = r#"
            CREATE TABLE IF NOT EXISTS pending_messages (
                local_id        INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                content         TEXT NOT NULL,
                model           TEXT NOT NULL DEFAULT '',
                idempotency_key TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'pending',
                created_at      TEXT NOT NULL,
                retry_count     INTEGER NOT NULL DEFAULT 0
            )
        "#;
        sqlx::query(sql)
            .execute(db)
            .await
            .context("创建待发送表失败")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_messages(status, created_at)",
        )
        .execute(db)
        .await
        .context("创建待发送索引失败")?;

        Ok(())
    }

    /// 新增一条待发送提交，返回 local_id
    pub async fn enqueue(&self, conversation_id: &str, content: &str, model: &str) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO pending_messages (
                conversation_id, content, model, idempotency_key, status, created_at, retry_count
            ) VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(conversation_id)
        .bind(content)
        .bind(model)
        .bind(Uuid::new_v4().to_string())
        .bind(PendingStatus::Pending.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("写入待发送提交失败")?;

        let local_id = res.last_insert_rowid();
        info!(
            "[Pending] 📥 入队: localID={}, conversationID={}",
            local_id, conversation_id
        );
        Ok(local_id)
    }

    /// pending / failed → sending
    ///
    /// 只有空闲的提交才能被认领；已在发送中或不存在时返回 `false`，调用方不得发送。
    pub async fn mark_sending(&self, local_id: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE pending_messages SET status = ? WHERE local_id = ? AND status IN (?, ?)",
        )
        .bind(PendingStatus::Sending.as_str())
        .bind(local_id)
        .bind(PendingStatus::Pending.as_str())
        .bind(PendingStatus::Failed.as_str())
        .execute(&self.pool)
        .await
        .context("更新提交状态失败")?;

        let claimed = res.rows_affected() > 0;
        if claimed {
            debug!("[Pending] 提交进入发送中: localID={}", local_id);
        } else {
            debug!("[Pending] 提交不存在或已在发送中，跳过: localID={}", local_id);
        }
        Ok(claimed)
    }

    /// sending → failed，重试次数 +1，返回新的重试次数
    pub async fn mark_failed(&self, local_id: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE pending_messages
            SET status = ?, retry_count = retry_count + 1
            WHERE local_id = ?
            RETURNING retry_count
            "#,
        )
        .bind(PendingStatus::Failed.as_str())
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await
        .context("标记提交失败状态失败")?;

        let Some(row) = row else {
            anyhow::bail!("待发送提交不存在: localID={}", local_id);
        };
        let retry_count: i64 = row.try_get("retry_count")?;
        warn!(
            "[Pending] ⚠️ 提交发送失败: localID={}, retryCount={}",
            local_id, retry_count
        );
        Ok(retry_count)
    }

    /// 确认消息落库后删除提交
    pub async fn dequeue(&self, local_id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM pending_messages WHERE local_id = ?")
            .bind(local_id)
            .execute(&self.pool)
            .await
            .context("删除待发送提交失败")?;
        let removed = res.rows_affected() > 0;
        if removed {
            debug!("[Pending] 出队: localID={}", local_id);
        }
        Ok(removed)
    }

    pub async fn get(&self, local_id: i64) -> Result<Option<PendingSubmission>> {
        let sql = format!("{} WHERE local_id = ?", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await
            .context("查询待发送提交失败")?;
        row.as_ref().map(Self::row_to_submission).transpose()
    }

    /// 可重试的提交：failed 且重试次数未达上限，按创建时间从早到晚
    pub async fn list_retryable(&self, max_retries: i64) -> Result<Vec<PendingSubmission>> {
        let sql = format!(
            "{} WHERE status = ? AND retry_count < ? ORDER BY created_at ASC, local_id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(PendingStatus::Failed.as_str())
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await
            .context("查询可重试提交失败")?;
        rows.iter().map(Self::row_to_submission).collect()
    }

    /// 已达到重试上限、永久失败的提交（保留在队列中供用户处理）
    pub async fn list_exhausted(&self, max_retries: i64) -> Result<Vec<PendingSubmission>> {
        let sql = format!(
            "{} WHERE status = ? AND retry_count >= ? ORDER BY created_at ASC, local_id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(PendingStatus::Failed.as_str())
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await
            .context("查询永久失败提交失败")?;
        rows.iter().map(Self::row_to_submission).collect()
    }

    /// 某个会话的全部提交（占位消息排序：创建时间，再按 local_id）
    pub async fn list_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<PendingSubmission>> {
        let sql = format!(
            "{} WHERE conversation_id = ? ORDER BY created_at ASC, local_id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .context("查询会话待发送提交失败")?;
        rows.iter().map(Self::row_to_submission).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<PendingSubmission>> {
        let sql = format!("{} ORDER BY created_at ASC, local_id ASC", SELECT_COLUMNS);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("查询待发送提交失败")?;
        rows.iter().map(Self::row_to_submission).collect()
    }

    /// 启动时恢复被中断的提交：pending / sending → failed，计入一次失败
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE pending_messages
            SET status = ?, retry_count = retry_count + 1
            WHERE status IN (?, ?)
            "#,
        )
        .bind(PendingStatus::Failed.as_str())
        .bind(PendingStatus::Pending.as_str())
        .bind(PendingStatus::Sending.as_str())
        .execute(&self.pool)
        .await
        .context("恢复中断提交失败")?;

        let recovered = res.rows_affected();
        if recovered > 0 {
            info!("[Pending] 🔄 恢复上次中断的提交 {} 条", recovered);
        }
        Ok(recovered)
    }

    /// 用户手动重发：清零重试次数，重新进入可重试集合（发送中的不受影响）
    pub async fn reset_retries(&self, local_id: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE pending_messages
            SET status = ?, retry_count = 0
            WHERE local_id = ? AND status != ?
            "#,
        )
        .bind(PendingStatus::Failed.as_str())
        .bind(local_id)
        .bind(PendingStatus::Sending.as_str())
        .execute(&self.pool)
        .await
        .context("重置重试次数失败")?;
        Ok(res.rows_affected() > 0)
    }

    fn row_to_submission(row: &SqliteRow) -> Result<PendingSubmission> {
        let status: String = row.try_get("status")?;
        Ok(PendingSubmission {
            local_id: row.try_get("local_id")?,
            conversation_id: row.try_get("conversation_id")?,
            content: row.try_get("content")?,
            model: row.try_get("model")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            retry_count: row.try_get("retry_count")?,
        })
    }
}
