use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use refinery_core::config::AppConfig;
use refinery_core::event::EventBus;
use refinery_core::types::{RunStatus, StageValue, Task, WorkflowResult};

use refinery_engine::{
    dev_pipeline, export_completed, DelegateSet, JsonFileExporter, RunLogger, TracingSink,
    WorkflowEngine, WorkflowGraph,
};

#[derive(Parser)]
#[command(
    name = "refinery",
    version,
    about = "Design, implement, test, evaluate and refine code through agent delegates"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "refinery.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task through the pipeline
    Run {
        /// What to build
        #[arg(short, long)]
        description: String,
        /// A requirement (repeatable)
        #[arg(short = 'r', long = "requirement")]
        requirements: Vec<String>,
        /// Target language
        #[arg(short, long, default_value = "python")]
        language: String,
        /// Repository the tests run against
        #[arg(long, default_value = ".")]
        repo_path: String,
        /// Override engine.max_iterations
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
        /// Skip writing the result to the export directory
        #[arg(long)]
        no_export: bool,
    },
    /// Build the stage graph and print the stage order
    Validate,
    /// Show resolved configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("refinery=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "refinery", &mut std::io::stdout());
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate => {
            let config = load_config(&cli.config)?;
            let graph = build_graph(&config)?;
            let delegates = build_delegates(&config)?;
            let engine = WorkflowEngine::new(graph, delegates, config.engine.clone())?;
            print_graph(engine.graph(), config.engine.rerun_test_creation);
        }
        Commands::Run {
            description,
            requirements,
            language,
            repo_path,
            max_iterations,
            json,
            no_export,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(n) = max_iterations {
                config.engine.max_iterations = n;
            }
            let task = Task::new(description)
                .with_requirements(requirements)
                .with_language(language)
                .with_repo_path(repo_path);

            let result = run_task(&config, task, !no_export).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
            if result.status == RunStatus::Failed {
                anyhow::bail!("run {} failed", result.run_id);
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    warn!(
        path = %path.display(),
        "No config file found, using static delegates (dry run)"
    );
    Ok(AppConfig::default())
}

fn build_graph(config: &AppConfig) -> anyhow::Result<WorkflowGraph> {
    let graph = match &config.pipeline {
        Some(pipeline) => WorkflowGraph::from_config(pipeline)?,
        None => dev_pipeline()?,
    };
    Ok(graph)
}

fn build_delegates(config: &AppConfig) -> anyhow::Result<DelegateSet> {
    let delegates = DelegateSet::from_config(config, refinery_delegates::from_config)
        .context("building delegates")?;
    Ok(delegates)
}

async fn run_task(config: &AppConfig, task: Task, export: bool) -> anyhow::Result<WorkflowResult> {
    let graph = build_graph(config)?;
    let delegates = build_delegates(config)?;
    let bus = Arc::new(EventBus::default());
    let engine = WorkflowEngine::new(graph, delegates, config.engine.clone())?
        .with_sink(bus.clone())
        .with_sink(Arc::new(TracingSink));

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });

    let logger = config
        .log
        .as_ref()
        .filter(|log| log.enabled)
        .map(|log| RunLogger::from_config(log).start_for_one_run(&bus, cancel.child_token()));

    let result = match engine.run_with_cancel(task, cancel.clone()).await {
        Ok(result) => result,
        Err(e) => {
            cancel.cancel();
            return Err(e.into());
        }
    };

    if let Some(handle) = logger {
        handle.await.ok();
    }

    if export {
        let exporter = JsonFileExporter::from_config(&config.export.clone().unwrap_or_default());
        if export_completed(&exporter, &result).await? {
            println!(
                "Exported to {}",
                exporter.run_dir(&result.run_id).display()
            );
        }
    }

    Ok(result)
}

fn print_graph(graph: &WorkflowGraph, rerun_test_creation: bool) {
    println!("Stages:");
    for (i, stage) in graph.stages().iter().enumerate() {
        println!(
            "  {}. {} [{}] ({}) -> {}",
            i + 1,
            stage.name,
            stage.capability,
            stage.input_keys.join(", "),
            stage.output_key
        );
    }
    if let Some(refiner) = graph.refiner() {
        println!(
            "Refiner: {} [{}] ({}) -> {}",
            refiner.name,
            refiner.capability,
            refiner.input_keys.join(", "),
            refiner.output_key
        );
    }
    let span: Vec<&str> = graph
        .refine_span(rerun_test_creation)
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    println!(
        "Refinement: after '{}', re-run {}",
        graph.evaluate_stage().name,
        span.join(" -> ")
    );
}

fn print_summary(result: &WorkflowResult) {
    println!("Run {}: {:?}", result.run_id, result.status);
    println!(
        "  iterations: {}, elapsed: {}ms",
        result.iterations, result.elapsed_ms
    );
    for entry in &result.history {
        println!(
            "  [{}] {} -> {} ({} attempt{}, {}ms)",
            entry.iteration,
            entry.stage,
            entry.key,
            entry.attempts,
            if entry.attempts == 1 { "" } else { "s" },
            entry.duration_ms
        );
    }
    if let Some(failure) = &result.failure {
        println!(
            "  failed at {} (iteration {}, {}): {}",
            failure.stage, failure.iteration, failure.class, failure.message
        );
    }
    if let Some(report) = result.output("final_report") {
        println!();
        println!("{}", render(report));
    }
}

fn render(value: &StageValue) -> String {
    match value {
        StageValue::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
