//! Helm 命令行入口
//!
//! - `helm run <goal>`：按配置的模式执行任务，结果以 JSON 打印到 stdout
//! - `helm tools`：列出已注册工具
//! - `helm stats`：查看持久化的工具统计
//!
//! 日志写到 stderr；运行中按 Ctrl+C 取消当前任务。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use helm::config::{load_config, AppConfig};
use helm::react::AgentEvent;
use helm::AgentBuilder;

#[derive(Parser, Debug)]
#[command(name = "helm")]
#[command(about = "Goal-driven agent orchestration engine")]
#[command(version)]
struct Cli {
    /// 额外的配置文件（TOML）
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 执行一个目标
    Run {
        goal: String,

        /// agent 或 workflow，覆盖配置
        #[arg(long)]
        mode: Option<String>,

        /// 工作流定义文件；未指定 --mode 时隐含 workflow 模式
        #[arg(long, value_name = "PATH")]
        workflow: Option<PathBuf>,

        /// 覆盖最大步数
        #[arg(long)]
        max_steps: Option<usize>,

        /// 把执行事件以 JSON 行写到 stderr
        #[arg(long)]
        events: bool,
    },
    /// 列出已注册的工具
    Tools,
    /// 查看工具使用统计
    Stats {
        #[arg(long)]
        tool: Option<String>,
    },
}

fn load(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    load_config(path.map(PathBuf::as_path)).context("Failed to load config")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = load(cli.config.as_ref())?;
    helm::observability::init(&cfg.log);

    match cli.command {
        Command::Run {
            goal,
            mode,
            workflow,
            max_steps,
            events,
        } => {
            if workflow.is_some() && mode.is_none() {
                cfg.agent.mode = "workflow".to_string();
            }
            if let Some(mode) = mode {
                cfg.agent.mode = mode;
            }
            if workflow.is_some() {
                cfg.workflow.path = workflow;
            }
            if let Some(n) = max_steps {
                cfg.agent.max_steps = n;
            }

            let mut builder = AgentBuilder::new(cfg);
            if events {
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<AgentEvent>();
                builder = builder.with_event_tx(tx);
                tokio::spawn(async move {
                    while let Some(ev) = rx.recv().await {
                        if let Ok(line) = serde_json::to_string(&ev) {
                            eprintln!("{line}");
                        }
                    }
                });
            }
            let runtime = Arc::new(builder.build().await.context("Failed to build runtime")?);

            let canceller = runtime.clone();
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Ctrl+C received, cancelling task");
                    canceller.orchestrator.cancel();
                }
            });

            let outcome = runtime.orchestrator.execute(&goal).await;
            ctrl_c.abort();
            runtime.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Command::Tools => {
            cfg.agent.mode = "agent".to_string();
            cfg.memory.backend = "memory".to_string();
            let runtime = AgentBuilder::new(cfg)
                .build()
                .await
                .context("Failed to build runtime")?;
            let descriptors = runtime.registry.descriptors();
            runtime.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
        }
        Command::Stats { tool } => {
            let memory = AgentBuilder::new(cfg)
                .build_memory()
                .context("Failed to open task memory")?;
            let stats = memory
                .get_tool_stats(tool.as_deref())
                .await
                .context("Failed to read tool stats")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
