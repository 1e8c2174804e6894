use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use autopilot_core::domain::Task;
use autopilot_core::domain::events::SYSTEM_ALERT;
use autopilot_core::recorder::{ExecutionRequest, ObservationInput};
use autopilot_core::{Core, CoreBuilder, CoreConfig};

mod demo_source;

use demo_source::DemoSource;

/// Autonomous task runtime
#[derive(Parser)]
#[command(name = "autopilot")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AUTOPILOT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against demo sources until ctrl-c
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        run_for_secs: Option<u64>,
    },

    /// Walk through observe → suggest → approve → execute and one healed failure
    Demo,

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let mut config = CoreConfig::default();
    config.apply_env_overrides();
    config.validate().context("invalid configuration")?;

    match cli.command.unwrap_or(Commands::Run { run_for_secs: None }) {
        Commands::Run { run_for_secs } => run(config, run_for_secs).await,
        Commands::Demo => demo(config).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// デモ source を登録してコアを構築
///
/// durable 配送は config（`AUTOPILOT_DURABLE_BUS` / `AUTOPILOT_DURABLE_BUS_URL`）に従う。
async fn build(config: CoreConfig) -> Result<Core> {
    let core = CoreBuilder::new(config)
        .source(Arc::new(DemoSource::new("crm", &["crm.*"])))?
        .source(Arc::new(DemoSource::new("fallback", &["*"])))?
        .expect_capabilities(&["crm.sync", "report.daily"])
        .build()
        .await?;
    if core.hub.is_degraded() {
        warn!("durable delivery unavailable, events stay in-process");
    }
    Ok(core)
}

async fn run(config: CoreConfig, run_for_secs: Option<u64>) -> Result<()> {
    // (A) コアを構築してループを起動
    let core = build(config).await?;
    core.start()?;

    // (B) 初期タスクと起動時 alert を投入
    for task in [
        Task::new("crm.sync").with_payload(json!({ "widgetId": "pipeline" })),
        Task::new("report.daily").with_base_score(40.0),
    ] {
        core.engine.enqueue(task)?;
    }
    core.hub.publish(SYSTEM_ALERT, json!({ "reason": "startup check" }));

    // (C) 時間切れか ctrl-c まで待つ
    match run_for_secs {
        Some(secs) => {
            tokio::select! {
                _ = sleep(Duration::from_secs(secs)) => info!(secs, "run time elapsed"),
                _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
            info!("ctrl-c received");
        }
    }

    // (D) ループを止めて状態を出力
    core.shutdown().await;
    print_status(&core)?;
    Ok(())
}

async fn demo(config: CoreConfig) -> Result<()> {
    let min_observations = config.min_observations;
    let core = build(config).await?;

    // 同じ task を繰り返すと suggestion が出る
    let params = json!({ "to": "ops@example.com", "format": "pdf" });
    let mut suggestion = None;
    for _ in 0..min_observations {
        let observed = core.recorder.observe_task(ObservationInput {
            task_type: "report.send".to_string(),
            params: params.clone(),
            duration_ms: Some(120),
            success: true,
            ..Default::default()
        });
        suggestion = suggestion.or(observed.suggestion);
    }
    let Some(suggestion_id) = suggestion else {
        warn!("no suggestion after {min_observations} observations");
        return Ok(());
    };

    let request = ExecutionRequest {
        suggestion_id,
        task_type: "report.send".to_string(),
        params: params.clone(),
        requested_by: "scheduler".to_string(),
    };
    let before = core.recorder.request_task_execution(&request);
    info!(approved = before.approved, "execution requested before approval");

    core.recorder.approve_suggestion(suggestion_id, "ops-lead")?;
    let record = core.recorder.authorize(&request)?;
    info!(execution = %record.execution_id, "execution authorized");

    // crm source は 4 回に 1 回接続を落とす。デフォルトの ECONNRESET 戦略が直す
    for _ in 0..4 {
        core.engine.enqueue(Task::new("crm.sync"))?;
    }
    while let Some(log) = core.engine.run_once().await {
        info!(
            task_type = %log.task.task_type,
            success = log.result.success,
            follow_ups = log.follow_ups.len(),
            "demo task done"
        );
    }

    print_status(&core)?;
    Ok(())
}

fn print_status(core: &Core) -> Result<()> {
    let report = json!({
        "engine": core.engine.status(),
        "system": core.healer.system_status(),
        "healing": core.healer.stats(),
        "recorder": core.recorder.stats(),
        "memory": core.memory.stats(),
        "hub": core.hub.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// ログ用の tracing subscriber を初期化
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}
