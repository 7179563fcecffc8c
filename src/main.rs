//! Hive 命令行入口
//!
//! - `hive ask <query>`：单次查询，打印回答（可选打印轨迹）
//! - `hive repl`：交互模式（默认）
//! - `hive agents`：列出已注册的 Agent 与能力

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hive::config::{load_config, AppConfig};
use hive::core::{
    run_with_graceful_shutdown, Hive, HiveBuilder, SessionCleanup, ShutdownCoordinator,
    ShutdownManager,
};
use hive::observability;
use hive::react::{OrchestratorEvent, RunOptions};
use hive::trace::TraceStatus;

/// 观察结果在过程输出中的最大字符数
const PREVIEW_CHARS: usize = 160;

#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(about = "Multi-agent orchestration engine")]
#[command(version)]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 记忆与轨迹中使用的用户 ID
    #[arg(short, long, global = true, default_value = "cli")]
    user: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer a single query and exit
    Ask {
        query: Vec<String>,
        /// Print the full trace as JSON after the answer
        #[arg(long)]
        trace: bool,
        /// Print decisions and tool calls as they happen
        #[arg(short, long)]
        verbose: bool,
        /// Query deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Interactive session (default)
    Repl,
    /// List agents and their capabilities
    Agents,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (cfg, config_err) = match load_config(cli.config.clone()) {
        Ok(cfg) => (cfg, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    observability::init_from_config(&cfg.log);
    if let Some(e) = config_err {
        tracing::warn!("Invalid configuration, using defaults: {}", e);
    }

    let hive = HiveBuilder::new(cfg)
        .build()
        .await
        .context("Failed to start hive")?;

    let manager = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager));
    coordinator.register(SessionCleanup::new(Arc::clone(&hive.sessions)));
    let root = manager.token();

    let mut result = None;
    run_with_graceful_shutdown(&coordinator, async {
        result = Some(match cli.command {
            Some(Commands::Ask {
                query,
                trace,
                verbose,
                timeout,
            }) => {
                let query = query.join(" ");
                ask(&hive, &query, &cli.user, trace, verbose, timeout, root.child_token()).await
            }
            Some(Commands::Agents) => {
                list_agents(&hive).await;
                Ok(())
            }
            Some(Commands::Repl) | None => repl(&hive, &cli.user, &root).await,
        });
    })
    .await;

    result.unwrap_or_else(|| Err(anyhow::anyhow!("interrupted")))
}

async fn ask(
    hive: &Hive,
    query: &str,
    user: &str,
    print_trace: bool,
    verbose: bool,
    timeout: Option<u64>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("query is empty");
    }

    let mut options = RunOptions::default().with_cancel(cancel);
    if let Some(secs) = timeout {
        options = options.with_deadline(Duration::from_secs(secs));
    }
    let printer = if verbose {
        let (tx, rx) = mpsc::unbounded_channel();
        options = options.with_events(tx);
        Some(tokio::spawn(print_events(rx)))
    } else {
        None
    };

    let result = hive.orchestrator.run_query_detached(query, user, options).await;
    if let Some(handle) = printer {
        let _ = handle.await;
    }

    match result {
        Ok(outcome) => {
            println!("{}", outcome.answer);
            if print_trace {
                println!("{}", serde_json::to_string_pretty(&outcome.trace)?);
            }
            Ok(())
        }
        Err(failure) => {
            if print_trace {
                println!("{}", serde_json::to_string_pretty(&failure.trace)?);
            }
            Err(anyhow::anyhow!(failure)).context("Query failed")
        }
    }
}

async fn repl(hive: &Hive, user: &str, root: &CancellationToken) -> anyhow::Result<()> {
    println!("hive: {} capabilities ready. Type /help for commands.", hive.registry.snapshot().await.len());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut verbose = true;
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" | "quit" | "exit" => break,
            "/help" => {
                println!("/agents   list capabilities");
                println!("/refresh  rediscover all agents");
                println!("/verbose  toggle step output");
                println!("/memory   show what is remembered about you");
                println!("/quit     exit");
            }
            "/agents" => list_agents(hive).await,
            "/refresh" => {
                let registry = hive.refresh_registry().await;
                println!("{} capabilities registered", registry.len());
            }
            "/verbose" => {
                verbose = !verbose;
                println!("verbose: {verbose}");
            }
            "/memory" => match hive.memory.get(user).await {
                Ok(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                Err(e) => eprintln!("memory error: {e}"),
            },
            query => {
                let cancel = root.child_token();
                let mut options = RunOptions::default().with_cancel(cancel);
                let printer = if verbose {
                    let (tx, rx) = mpsc::unbounded_channel();
                    options = options.with_events(tx);
                    Some(tokio::spawn(print_events(rx)))
                } else {
                    None
                };
                let result = hive.orchestrator.run_query_detached(query, user, options).await;
                if let Some(handle) = printer {
                    let _ = handle.await;
                }
                match result {
                    Ok(outcome) => println!("{}\n", outcome.answer),
                    Err(failure) => eprintln!(
                        "[{}] {} ({} trace entries)\n",
                        failure.kind,
                        failure.message,
                        failure.trace.len()
                    ),
                }
            }
        }
    }
    Ok(())
}

async fn list_agents(hive: &Hive) {
    let registry = hive.registry.snapshot().await;
    for descriptor in hive.sessions.descriptors() {
        let state = hive
            .sessions
            .state(&descriptor.name)
            .await
            .map(|s| format!("{s:?}"))
            .unwrap_or_default();
        println!("{} [{}]", descriptor.name, state);
        if !descriptor.description.is_empty() {
            println!("  {}", descriptor.description);
        }
        for cap in registry.list_all().iter().filter(|c| c.agent == descriptor.name) {
            let marker = if cap.declared_only { " (declared)" } else { "" };
            println!("  - {}{}: {}", cap.name, marker, cap.description);
        }
    }
    for (agent, reason) in registry.unavailable_agents() {
        println!("! {agent} unavailable: {reason}");
    }
    for c in registry.collisions() {
        println!(
            "! '{}' offered by both {} and {}; using {}",
            c.capability, c.kept_agent, c.dropped_agent, c.kept_agent
        );
    }
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<OrchestratorEvent>) {
    while let Some(ev) = rx.recv().await {
        match ev {
            OrchestratorEvent::CycleStarted { cycle, max_cycles } => {
                eprintln!("-- cycle {cycle}/{max_cycles}");
            }
            OrchestratorEvent::Reasoning { step } => {
                if !step.rationale.is_empty() {
                    eprintln!("thought: {}", step.rationale);
                }
            }
            OrchestratorEvent::ArgumentsBackfilled { capability, keys } => {
                eprintln!("memory: filled {} for {}", keys.join(", "), capability);
            }
            OrchestratorEvent::ToolStarted {
                capability,
                agent,
                arguments,
            } => {
                let agent = agent.unwrap_or_else(|| "?".into());
                eprintln!("call: {capability}@{agent} {arguments}");
            }
            OrchestratorEvent::ToolFinished { step } => {
                let text: String = step.outcome.text().chars().take(PREVIEW_CHARS).collect();
                let status = if step.outcome.is_ok() { "ok" } else { "error" };
                eprintln!("observe ({status}, {}ms): {text}", step.duration_ms);
            }
            OrchestratorEvent::Finished { outcome, .. } => {
                if let TraceStatus::Failed { kind, message } = outcome {
                    eprintln!("failed [{kind}]: {message}");
                }
            }
            OrchestratorEvent::RunStarted { .. } => {}
        }
    }
}
