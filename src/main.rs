//! Hive 命令行入口
//!
//! 单次：`hive "How many EUR is 100 USD?"`；不带参数进入交互模式，每行一条消息。
//! 进度事件输出到 stderr，最终回答输出到 stdout。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hive::checkpoint::export_history;
use hive::config::{load_config, AppConfig};
use hive::core::{ConversationState, Orchestrator, Phase};
use hive::events::EventType;
use hive::observability;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "hive", version, about = "Multi-agent orchestrator")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// 会话 ID；同一 ID 的多次调用共享历史（需 sqlite 检查点）
    #[arg(long, default_value = "cli")]
    conversation: String,

    /// 从最新检查点继续被中断的运行
    #[arg(long, conflicts_with = "export")]
    resume: bool,

    /// 导出会话的检查点历史（JSON）后退出
    #[arg(long)]
    export: bool,

    /// 用户消息；为空时进入交互模式
    text: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let orchestrator = Arc::new(
        hive::build_orchestrator(cfg)
            .await
            .context("Failed to build orchestrator")?,
    );

    if cli.export {
        let json = export_history(orchestrator.checkpoints().as_ref(), &cli.conversation)
            .await
            .context("Failed to export checkpoint history")?;
        println!("{}", json);
        return Ok(());
    }

    let printer = spawn_progress_printer(&orchestrator, &cli.conversation);

    if cli.resume {
        let state = orchestrator
            .resume(&cli.conversation)
            .await
            .context("Failed to resume")?;
        print_outcome(&state);
    } else if !cli.text.is_empty() {
        let text = cli.text.join(" ");
        run_turn(&orchestrator, &cli.conversation, &text).await?;
    } else {
        eprintln!("hive: conversation '{}' (type 'exit' to quit)", cli.conversation);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if matches!(line, "exit" | "quit") {
                break;
            }
            run_turn(&orchestrator, &cli.conversation, line).await?;
        }
    }

    orchestrator.events().close(&cli.conversation);
    let _ = printer.await;
    Ok(())
}

/// 跑一轮；Ctrl-C 取消当前运行而不是直接退出
async fn run_turn(orchestrator: &Arc<Orchestrator>, conversation_id: &str, text: &str) -> anyhow::Result<()> {
    let mut run = {
        let orchestrator = Arc::clone(orchestrator);
        let conversation_id = conversation_id.to_string();
        let text = text.to_string();
        tokio::spawn(async move { orchestrator.submit(&conversation_id, &text).await })
    };

    let state = tokio::select! {
        result = &mut run => result.context("Run task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel(conversation_id);
            run.await.context("Run task panicked")?
        }
    }
    .context("Request rejected")?;

    print_outcome(&state);
    Ok(())
}

fn print_outcome(state: &ConversationState) {
    match state.phase {
        Phase::Complete => println!("{}", state.aggregated_result.as_deref().unwrap_or_default()),
        _ => {
            let reason = state
                .error
                .as_ref()
                .map(|e| format!("{} ({:?})", e.message, e.class))
                .unwrap_or_else(|| format!("stopped in phase {}", state.phase));
            eprintln!("run failed: {}", reason);
        }
    }
}

fn spawn_progress_printer(orchestrator: &Orchestrator, conversation_id: &str) -> tokio::task::JoinHandle<()> {
    let mut subscription = orchestrator.events().subscribe(conversation_id, None);
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            match event.event_type {
                EventType::RemoteCall => {
                    let endpoint = event.payload["agent_endpoint"].as_str().unwrap_or("?");
                    let status = event.payload["status"].as_str().unwrap_or("?");
                    eprintln!("  -> {} {}", endpoint, status);
                }
                EventType::Final => {}
                _ => {
                    if let Some(progress) = event.progress() {
                        let marker = if progress.degraded { " (degraded)" } else { "" };
                        eprintln!("[{}] {}{}", progress.phase, progress.message, marker);
                    }
                }
            }
        }
    })
}
