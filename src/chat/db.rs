//! SQLite 数据库工具：统一创建连接池并初始化所有本地表
//!
//! 约定：每个实体一张表（messages / sync_state / pending_messages），
//! 由各自 DAO 的 `init_db_with_connection` 用 `CREATE TABLE IF NOT EXISTS` 建表。

use crate::chat::message::LocalLog;
use crate::chat::pending::PendingQueue;
use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::info;

/// 创建 SQLite 连接池并初始化全部表结构
///
/// `db_url` 例如：`sqlite://convo_sync.db?mode=rwc`
pub async fn create_sqlite_pool_with_tables(db_url: &str) -> Result<Pool<Sqlite>> {
    info!("[DB] 🔗 创建本地数据库连接: {}", db_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context(format!("连接SQLite数据库失败: {}", db_url))?;

    init_tables(&pool).await?;
    Ok(pool)
}

/// 初始化全部表结构（可重复调用）
pub async fn init_tables(pool: &Pool<Sqlite>) -> Result<()> {
    LocalLog::init_db_with_connection(pool).await?;
    PendingQueue::init_db_with_connection(pool).await?;
    info!("[DB] 📋 数据库表初始化完成");
    Ok(())
}

/// 测试用内存数据库：单连接，保证所有查询落在同一个内存库上
#[cfg(test)]
pub(crate) async fn memory_pool() -> Pool<Sqlite> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("创建内存数据库失败");
    init_tables(&pool).await.expect("初始化内存数据库失败");
    pool
}
