//! 会话同步 CLI
//!
//! 非交互式 CLI，用于手动验证提交、订阅、补齐和补发流程。
//! 每个子命令执行完即退出（`watch` 持续运行直到 Ctrl+C 或超时）。

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use convo_sync_core_rust::chat::client::RetrySweepReport;
use convo_sync_core_rust::{
    ClientConfig, ConfirmedMessage, PlaceholderMessage, StaticTokenProvider, StreamListener,
    SubmitOutcome, SyncController, TimelineItem,
};
use std::io::Write;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 会话同步 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "convo-sync-cli")]
#[command(about = "会话同步 CLI - 提交消息、订阅回复、补齐历史", long_about = None)]
struct Args {
    /// HTTP API 基础地址
    #[arg(long, env = "CONVO_API_URL", default_value = "http://localhost:8080/api/v1")]
    api_url: String,

    /// 访问令牌（bearer token）
    #[arg(long, env = "CONVO_TOKEN")]
    token: Option<String>,

    /// 本地数据库 URL
    #[arg(long, env = "CONVO_DB", default_value = "sqlite://convo_sync.db?mode=rwc")]
    db: String,

    /// 日志级别（默认: info,convo_sync_core_rust=debug）
    #[arg(long, default_value = "info,convo_sync_core_rust=debug")]
    log_level: String,

    /// 日志文件（追加模式）
    #[arg(long, default_value = "debug.log")]
    log_file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 提交一条消息并流式输出回复
    Send {
        conversation_id: String,
        content: String,
        /// 模型（默认使用客户端配置）
        #[arg(short, long)]
        model: Option<String>,
    },
    /// 订阅会话的实时回复
    Watch {
        conversation_id: String,
        /// 运行时长（秒），0 表示持续运行
        #[arg(short, long, default_value = "0")]
        duration: u64,
        /// 定时补发间隔（秒），0 表示不补发
        #[arg(long, default_value = "30")]
        retry_interval: u64,
    },
    /// 手动补齐一个会话
    Sync { conversation_id: String },
    /// 补发所有可重试的提交
    Retry,
    /// 显示会话时间线（已确认消息 + 占位消息）
    History {
        conversation_id: String,
        /// 只读本地，不先补齐
        #[arg(long)]
        offline: bool,
    },
    /// 列出待发送提交
    Pending { conversation_id: Option<String> },
    /// 丢弃一条未送达的提交
    Discard { local_id: i64 },
    /// 清零重试次数并立即重发
    Resubmit { local_id: i64 },
    /// 删除会话的全部本地数据
    Purge { conversation_id: String },
}

/// 初始化日志（同时输出到 stderr 和文件，stdout 留给回复内容）
fn init_logger(log_level: &str, log_path: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("无法创建日志文件 {}", log_path))?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: {}", log_path);
    Ok(())
}

/// 把回复 token 直接写到 stdout，其余事件写日志
struct CliListener;

#[async_trait]
impl StreamListener for CliListener {
    async fn on_connected(&self, conversation_id: &str) {
        info!("[CLI/Stream] 🔗 已连接: {}", conversation_id);
    }

    async fn on_disconnected(&self, conversation_id: &str) {
        info!("[CLI/Stream] 🔌 连接关闭: {}", conversation_id);
    }

    async fn on_token(&self, _conversation_id: &str, token: &str, _index: i64) {
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "{}", token);
        let _ = out.flush();
    }

    async fn on_user_message_echoed(&self, message: &ConfirmedMessage) {
        info!(
            "[CLI/Stream] 📨 用户消息已确认: id={}, sequence={}",
            message.id, message.sequence
        );
    }

    async fn on_complete(&self, message: &ConfirmedMessage, sequence: i64) {
        println!();
        info!(
            "[CLI/Stream] ✅ 回复完成: id={}, sequence={}, tokensOut={:?}",
            message.id, sequence, message.tokens_out
        );
    }

    async fn on_error(&self, conversation_id: &str, error: &str) {
        error!("[CLI/Stream] ❌ {}: {}", conversation_id, error);
    }

    async fn on_message_replayed(&self, message: &ConfirmedMessage) {
        println!("{}", format_message(message));
    }

    async fn on_placeholder(&self, placeholder: &PlaceholderMessage) {
        info!(
            "[CLI/Stream] ⏳ 已入队: localID={}, content={}",
            placeholder.local_id, placeholder.content
        );
    }
}

fn format_message(message: &ConfirmedMessage) -> String {
    format!(
        "#{:<5} {:<9} {}",
        message.sequence,
        message.role.as_str(),
        message.content
    )
}

fn print_outcome(outcome: &SubmitOutcome) {
    match outcome {
        SubmitOutcome::Delivered { local_id, message } => info!(
            "[CLI] ✅ 提交 {} 已送达: messageID={}, sequence={}",
            local_id, message.id, message.sequence
        ),
        SubmitOutcome::Failed {
            local_id,
            error,
            retry_count,
            permanently,
        } => warn!(
            "[CLI] ⚠️ 提交 {} 发送失败（retryCount={}, permanently={}）: {}",
            local_id, retry_count, permanently, error
        ),
        SubmitOutcome::Skipped { local_id } => {
            info!("[CLI] 提交 {} 正在发送中，本次跳过", local_id)
        }
    }
}

fn print_sweep(report: &RetrySweepReport) {
    info!(
        "[CLI] 🔄 补发结果: delivered={:?}, failed={:?}, exhausted={:?}",
        report.delivered, report.failed, report.exhausted
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level, &args.log_file)?;

    info!("[CLI] 🚀 会话同步 CLI: api={}, db={}", args.api_url, args.db);

    let config = ClientConfig::new(args.api_url.clone(), args.db.clone());
    let tokens = Arc::new(StaticTokenProvider::new(args.token.clone()));
    let controller = SyncController::open(config, tokens).await?;
    controller.set_listener(Arc::new(CliListener));

    match args.command {
        Command::Send {
            conversation_id,
            content,
            model,
        } => {
            // 先补齐，保证游标追平后回复可以直接推进游标
            if let Err(e) = controller.sync(&conversation_id).await {
                warn!("[CLI] ⚠️ 发送前补齐失败: {}", e);
            }
            let handle = controller
                .submit(&conversation_id, &content, model.as_deref())
                .await?;
            let outcome = handle.outcome().await?;
            print_outcome(&outcome);
        }
        Command::Watch {
            conversation_id,
            duration,
            retry_interval,
        } => {
            let subscription = controller.subscribe(&conversation_id, Arc::new(CliListener));
            let cancel = CancellationToken::new();
            let timer = (retry_interval > 0).then(|| {
                controller.spawn_retry_timer(Duration::from_secs(retry_interval), cancel.clone())
            });

            if duration > 0 {
                info!("[CLI] ⏰ {} 秒后自动退出", duration);
                tokio::select! {
                    _ = sleep(Duration::from_secs(duration)) => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            } else {
                info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
                tokio::signal::ctrl_c()
                    .await
                    .context("监听 Ctrl+C 失败")?;
            }

            cancel.cancel();
            subscription.unsubscribe();
            subscription.closed().await;
            if let Some(timer) = timer {
                let _ = timer.await;
            }
        }
        Command::Sync { conversation_id } => {
            let report = controller.sync(&conversation_id).await?;
            info!(
                "[CLI] ✅ 补齐完成: fetched={}, pages={}, lastSequence={}, caughtUp={}",
                report.fetched, report.pages, report.last_sequence, report.caught_up
            );
        }
        Command::Retry => {
            let report = controller.retry_sweep().await?;
            print_sweep(&report);
        }
        Command::History {
            conversation_id,
            offline,
        } => {
            if !offline {
                if let Err(e) = controller.sync(&conversation_id).await {
                    warn!("[CLI] ⚠️ 补齐失败，显示本地缓存: {}", e);
                }
            }
            let cursor = controller.cursor(&conversation_id).await?;
            info!(
                "[CLI] 📋 游标: lastSequence={}, status={}",
                cursor.last_sequence,
                cursor.status.as_str()
            );
            for item in controller.timeline(&conversation_id).await? {
                match item {
                    TimelineItem::Confirmed(message) => println!("{}", format_message(&message)),
                    TimelineItem::Placeholder(p) => println!(
                        "{:<6} {:<9} {}  [{}，已重试 {} 次]",
                        "…",
                        "user",
                        p.content,
                        if p.is_failed() { "发送失败" } else { "发送中" },
                        p.retry_count
                    ),
                }
            }
        }
        Command::Pending { conversation_id } => {
            let pending = controller.pending(conversation_id.as_deref()).await?;
            info!("[CLI] 📤 待发送提交（共 {} 条）", pending.len());
            for s in pending {
                println!(
                    "{:<5} {:<20} {:<8} retry={} {}",
                    s.local_id,
                    s.conversation_id,
                    s.status.as_str(),
                    s.retry_count,
                    s.content
                );
            }
        }
        Command::Discard { local_id } => {
            if controller.discard_pending(local_id).await? {
                info!("[CLI] 🗑️ 已丢弃提交 {}", local_id);
            } else {
                warn!("[CLI] 提交 {} 不存在", local_id);
            }
        }
        Command::Resubmit { local_id } => {
            let outcome = controller.resubmit_pending(local_id).await?;
            print_outcome(&outcome);
        }
        Command::Purge { conversation_id } => {
            controller.purge_conversation(&conversation_id).await?;
            info!("[CLI] 🗑️ 已删除会话本地数据: {}", conversation_id);
        }
    }

    controller.shutdown();
    info!("[CLI] 👋 程序退出");
    Ok(())
}
