//! 本地消息日志数据访问层（DAO）
//!
//! 负责已确认消息和同步游标的所有数据库操作。消息按 `(conversation_id, id)`
//! 幂等写入，游标只允许前进，比较发生在 UPSERT 语句内部而不是先读后写。

use crate::chat::message::models::{ConfirmedMessage, CursorStatus, Role, SyncCursor};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};
use tracing::{debug, info, warn};

/// 同一 id 出现不同内容，或同一序号对应了不同 id
///
/// 服务器分配 id 和序号，正常协议下不会出现，一旦观察到即视为逻辑不一致。
#[derive(Debug, thiserror::Error)]
#[error("会话 {conversation_id} 本地日志不一致: {detail}")]
pub struct LogInconsistency {
    pub conversation_id: String,
    pub detail: String,
}

const SELECT_BY_ID: &str = r#"
    SELECT id, conversation_id, role, content, sequence, created_at,
           model, tokens_in, tokens_out, latency_ms, stop_reason
    FROM messages
    WHERE conversation_id = ? AND id = ?
"#;

const SELECT_ORDERED: &str = r#"
    SELECT id, conversation_id, role, content, sequence, created_at,
           model, tokens_in, tokens_out, latency_ms, stop_reason
    FROM messages
    WHERE conversation_id = ?
    ORDER BY sequence ASC
"#;

/// 本地消息日志（按会话有序的已确认消息 + 同步游标）
pub struct LocalLog {
    pool: Pool<Sqlite>,
}

impl LocalLog {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// 使用共享连接初始化消息表和游标表（静态方法）
    pub async fn init_db_with_connection(db: &Pool<Sqlite>) -> Result<()> {
        info!("[LocalLog/DB] 初始化消息表和游标表");

        let sql1 = r#"
            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                role            TEXT NOT NULL,
                content         TEXT NOT NULL DEFAULT '',
                sequence        INTEGER NOT NULL,
                created_at      TEXT NOT NULL,
                model           TEXT,
                tokens_in       INTEGER,
                tokens_out      INTEGER,
                latency_ms      INTEGER,
                stop_reason     TEXT,
                PRIMARY KEY (conversation_id, id)
            )
        "#;
        sqlx::query(sql1)
            .execute(db)
            .await
            .context("创建消息表失败")?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_conv_seq ON messages(conversation_id, sequence)",
        )
        .execute(db)
        .await
        .context("创建消息序号索引失败")?;

        let sql2 = r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                conversation_id TEXT PRIMARY KEY,
                last_sequence   INTEGER NOT NULL DEFAULT 0,
                last_sync_at    TEXT,
                status          TEXT NOT NULL DEFAULT 'stale'
            )
        "#;
        sqlx::query(sql2)
            .execute(db)
            .await
            .context("创建游标表失败")?;

        Ok(())
    }

    /// 幂等写入一批已确认消息，返回实际新增的条数
    ///
    /// 整批在一个事务内完成；任何一条冲突都会回滚整批。
    pub async fn append(&self, messages: &[ConfirmedMessage]) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("开启事务失败")?;
        let mut inserted = 0usize;

        for msg in messages {
            if msg.sequence < 0 {
                return Err(anyhow::Error::new(LogInconsistency {
                    conversation_id: msg.conversation_id.clone(),
                    detail: format!("消息 {} 携带非法序号 {}", msg.id, msg.sequence),
                }));
            }

            let existing = sqlx::query(SELECT_BY_ID)
                .bind(&msg.conversation_id)
                .bind(&msg.id)
                .fetch_optional(&mut *tx)
                .await
                .context("查询已有消息失败")?;

            if let Some(row) = existing {
                let stored = Self::row_to_message(&row)?;
                if stored.same_record(msg) {
                    debug!("[LocalLog] 消息已存在，跳过: id={}", msg.id);
                    continue;
                }
                warn!(
                    "[LocalLog] ❌ 同 id 内容冲突: conversationID={}, id={}",
                    msg.conversation_id, msg.id
                );
                return Err(anyhow::Error::new(LogInconsistency {
                    conversation_id: msg.conversation_id.clone(),
                    detail: format!("消息 {} 已存在且内容不同", msg.id),
                }));
            }

            let taken = sqlx::query(
                "SELECT id FROM messages WHERE conversation_id = ? AND sequence = ?",
            )
            .bind(&msg.conversation_id)
            .bind(msg.sequence)
            .fetch_optional(&mut *tx)
            .await
            .context("查询序号占用失败")?;
            if let Some(row) = taken {
                let other: String = row.try_get("id")?;
                return Err(anyhow::Error::new(LogInconsistency {
                    conversation_id: msg.conversation_id.clone(),
                    detail: format!(
                        "序号 {} 已被消息 {} 占用，拒绝写入 {}",
                        msg.sequence, other, msg.id
                    ),
                }));
            }

            sqlx::query(
                r#"
                INSERT INTO messages (
                    id, conversation_id, role, content, sequence, created_at,
                    model, tokens_in, tokens_out, latency_ms, stop_reason
                ) VALUES (?,?,?,?,?,?,?,?,?,?,?)
                "#,
            )
            .bind(&msg.id)
            .bind(&msg.conversation_id)
            .bind(msg.role.as_str())
            .bind(&msg.content)
            .bind(msg.sequence)
            .bind(msg.created_at)
            .bind(&msg.model)
            .bind(msg.tokens_in)
            .bind(msg.tokens_out)
            .bind(msg.latency_ms)
            .bind(&msg.stop_reason)
            .execute(&mut *tx)
            .await
            .context("写入消息失败")?;
            inserted += 1;
        }

        tx.commit().await.context("提交消息事务失败")?;
        debug!(
            "[LocalLog] 写入消息 {} 条（新增 {} 条）",
            messages.len(),
            inserted
        );
        Ok(inserted)
    }

    /// 按序号升序惰性读取会话消息
    ///
    /// 每次调用都从当前存储状态重新查询，可以重复调用。
    pub fn read_ordered<'a>(
        &'a self,
        conversation_id: &str,
    ) -> BoxStream<'a, Result<ConfirmedMessage>> {
        sqlx::query(SELECT_ORDERED)
            .bind(conversation_id.to_string())
            .fetch(&self.pool)
            .map(|row| {
                row.context("读取消息行失败")
                    .and_then(|r| Self::row_to_message(&r))
            })
            .boxed()
    }

    /// 读取会话全部消息（按序号升序）
    pub async fn load_ordered(&self, conversation_id: &str) -> Result<Vec<ConfirmedMessage>> {
        self.read_ordered(conversation_id).try_collect().await
    }

    /// 按 id 查询单条消息
    pub async fn get(&self, conversation_id: &str, id: &str) -> Result<Option<ConfirmedMessage>> {
        let row = sqlx::query(SELECT_BY_ID)
            .bind(conversation_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("查询消息失败")?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    pub async fn count(&self, conversation_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await
            .context("统计消息数失败")?;
        Ok(row.try_get::<i64, _>("total")?)
    }

    pub async fn max_sequence(&self, conversation_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT IFNULL(MAX(sequence), 0) AS max_seq FROM messages WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await
        .context("查询最大序号失败")?;
        Ok(row.try_get::<i64, _>("max_seq")?)
    }

    /// 读取会话游标，不存在时返回 `{last_sequence: 0, status: stale}`
    pub async fn cursor_for(&self, conversation_id: &str) -> Result<SyncCursor> {
        let row = sqlx::query(
            r#"
            SELECT conversation_id, last_sequence, last_sync_at, status
            FROM sync_state
            WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .context("查询同步游标失败")?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                Ok(SyncCursor {
                    conversation_id: row.try_get("conversation_id")?,
                    last_sequence: row.try_get("last_sequence")?,
                    last_sync_at: row.try_get::<Option<DateTime<Utc>>, _>("last_sync_at")?,
                    status: status.parse()?,
                })
            }
            None => Ok(SyncCursor::initial(conversation_id)),
        }
    }

    /// 推进游标；`new_sequence` 小于已存储值时不做任何修改并返回 `false`
    pub async fn advance_cursor(
        &self,
        conversation_id: &str,
        new_sequence: i64,
        status: CursorStatus,
    ) -> Result<bool> {
        if new_sequence < 0 {
            return Ok(false);
        }

        let res = sqlx::query(
            r#"
            INSERT INTO sync_state (conversation_id, last_sequence, last_sync_at, status)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(conversation_id) DO UPDATE SET
                last_sequence = excluded.last_sequence,
                last_sync_at = excluded.last_sync_at,
                status = excluded.status
            WHERE excluded.last_sequence >= sync_state.last_sequence
            "#,
        )
        .bind(conversation_id)
        .bind(new_sequence)
        .bind(Utc::now())
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("推进同步游标失败")?;

        let advanced = res.rows_affected() > 0;
        if advanced {
            debug!(
                "[LocalLog] 游标推进: conversationID={}, lastSequence={}, status={}",
                conversation_id,
                new_sequence,
                status.as_str()
            );
        } else {
            debug!(
                "[LocalLog] 拒绝回退游标: conversationID={}, 请求序号={}",
                conversation_id, new_sequence
            );
        }
        Ok(advanced)
    }

    /// 只修改游标状态，不动 `last_sequence`
    pub async fn set_cursor_status(
        &self,
        conversation_id: &str,
        status: CursorStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (conversation_id, last_sequence, last_sync_at, status)
            VALUES (?, 0, ?, ?)
            ON CONFLICT(conversation_id) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                status = excluded.status
            "#,
        )
        .bind(conversation_id)
        .bind(Utc::now())
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("更新游标状态失败")?;
        Ok(())
    }

    /// 删除会话的全部消息、游标和待发送提交
    pub async fn purge(&self, conversation_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.context("开启事务失败")?;
        for sql in [
            "DELETE FROM messages WHERE conversation_id = ?",
            "DELETE FROM sync_state WHERE conversation_id = ?",
            "DELETE FROM pending_messages WHERE conversation_id = ?",
        ] {
            sqlx::query(sql)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .context("清理会话数据失败")?;
        }
        tx.commit().await.context("提交清理事务失败")?;
        info!("[LocalLog] 🗑️ 已清理会话本地数据: {}", conversation_id);
        Ok(())
    }

    fn row_to_message(row: &SqliteRow) -> Result<ConfirmedMessage> {
        let role: String = row.try_get("role")?;
        Ok(ConfirmedMessage {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            role: role.parse::<Role>()?,
            content: row.try_get("content")?,
            sequence: row.try_get("sequence")?,
            created_at: row.try_get("created_at")?,
            model: row.try_get("model")?,
            tokens_in: row.try_get("tokens_in")?,
            tokens_out: row.try_get("tokens_out")?,
            latency_ms: row.try_get("latency_ms")?,
            stop_reason: row.try_get("stop_reason")?,
        })
    }
}
