//! Demo entry point for the Maestro orchestration engine.
//!
//! Runs a scripted plan against scripted workers so the full pipeline
//! (scheduling, streaming execution, aggregation) can be observed without
//! any external worker implementation.

use clap::{Parser, Subcommand};
use maestro_agent::ScriptedBackend;
use maestro_core::{MaestroResult, Priority, SubTaskSpec, TaskPlan, Worker};
use maestro_orchestrator::{EngineConfig, Orchestrator, ReportFormat};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro — sub-agent orchestration engine")]
struct Cli {
    /// Path to a TOML config file; defaults are used when the file is absent.
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted demo plan end to end and print the report.
    Demo {
        /// Task description used for the demo plan.
        #[arg(long, default_value = "ship the demo feature")]
        task: String,
        /// Report format to print when the task settles.
        #[arg(long, default_value = "markdown")]
        format: String,
    },
    /// Parse the config file and print the resolved engine settings.
    Check,
}

fn load_config(path: &PathBuf) -> MaestroResult<EngineConfig> {
    if path.exists() {
        EngineConfig::load(path)
    } else {
        Ok(EngineConfig::default())
    }
}

#[tokio::main]
async fn main() -> MaestroResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Check => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Demo { task, format } => run_demo(config, &task, &format).await,
    }
}

async fn run_demo(config: EngineConfig, task: &str, format: &str) -> MaestroResult<()> {
    let engine = Orchestrator::new(config);

    // Surface the event stream as log lines, the way a transport would.
    if let Some(mut events) = engine.take_events().await {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Ok(json) = serde_json::to_string(&event) {
                    info!(event = %json, "engine event");
                }
            }
        });
    }

    engine
        .register_worker(
            Worker::new("Nova", "researcher").with_skills(vec!["research".into()]),
            Arc::new(
                ScriptedBackend::new(
                    "Prior art reviewed: two similar features exist; both lack streaming.",
                )
                .with_chunk_size(12)
                .with_chunk_delay_ms(20),
            ),
        )
        .await;
    engine
        .register_worker(
            Worker::new("Forge", "implementer").with_skills(vec!["rust".into(), "backend".into()]),
            Arc::new(
                ScriptedBackend::new(
                    "Implementation complete: new module wired behind the existing API.",
                )
                .with_chunk_size(12)
                .with_chunk_delay_ms(20),
            ),
        )
        .await;
    engine
        .register_worker(
            Worker::new("Probe", "tester").with_skills(vec!["testing".into()]),
            Arc::new(
                ScriptedBackend::new("All 14 checks pass, including the failure-path cases.")
                    .with_chunk_size(12)
                    .with_chunk_delay_ms(20),
            ),
        )
        .await;

    let plan = TaskPlan {
        description: task.to_string(),
        sub_tasks: vec![
            SubTaskSpec::new("research", "Survey prior art and constraints")
                .with_skills(vec!["research".into()])
                .with_priority(Priority::High),
            SubTaskSpec::new("implement", "Build the feature")
                .with_skills(vec!["rust".into()])
                .with_depends_on(vec![0]),
            SubTaskSpec::new("verify", "Exercise the feature end to end")
                .with_skills(vec!["testing".into()])
                .with_depends_on(vec![1]),
        ],
    };

    let task_id = engine.submit_task(plan).await?;
    info!(task_id = %task_id, "demo plan submitted");

    loop {
        match engine.task(task_id).await {
            Some(task) if task.status.is_terminal() => break,
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }

    let format = match format {
        "html" => ReportFormat::Html,
        "json" => ReportFormat::Json,
        _ => ReportFormat::Markdown,
    };
    // The settle router aggregates shortly after the task settles.
    for _ in 0..100 {
        if let Some(report) = engine.export_report(task_id, format).await {
            println!("{report}");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let result = engine.aggregate(task_id).await?;
    println!("{}", result.report);
    Ok(())
}
