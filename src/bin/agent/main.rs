mod brain;
mod dom;
mod face;
mod hands;

use agentic_rpa::{
    AgentConfig, ArtifactStore, DecisionOracle, Orchestrator, PlanReplayOracle, RunEvent,
    RunResult,
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use brain::OpenAiOracle;
use hands::{ChromeConnection, ChromeEngine};

#[derive(Parser)]
#[command(
    name = "agent",
    version,
    about = "Drive a Chrome browser toward a goal, one decided action at a time"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task step by step, asking the model for each action
    Run {
        task: String,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Plan a whole task up front, optionally save and execute it
    Plan {
        task: String,
        /// Write the plan as JSON into the plans directory
        #[arg(long)]
        save: bool,
        /// Execute the plan after printing it
        #[arg(long)]
        execute: bool,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Serve the web UI and run submitted tasks against one browser
    Serve {
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Args, Clone, Default)]
struct Overrides {
    #[arg(long)]
    max_steps: Option<usize>,
    /// Chrome remote-debugging port to attach to (or launch on)
    #[arg(long)]
    debug_port: Option<u16>,
    #[arg(long)]
    headless: bool,
    #[arg(long)]
    model: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(max_steps) = self.max_steps {
            config.orchestrator.max_steps = max_steps;
        }
        if let Some(port) = self.debug_port {
            config.browser.debug_port = port;
        }
        if self.headless {
            config.browser.headless = true;
        }
        if let Some(model) = &self.model {
            config.oracle.model = model.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = AgentConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Run { task, overrides } => {
            overrides.apply(&mut config);
            run(&config, &task).await
        }
        Command::Plan {
            task,
            save,
            execute,
            overrides,
        } => {
            overrides.apply(&mut config);
            plan(&config, &task, save, execute).await
        }
        Command::Serve { port, overrides } => {
            overrides.apply(&mut config);
            serve(&config, port).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)))
        .init();
}

async fn run(config: &AgentConfig, task: &str) -> Result<()> {
    let oracle = OpenAiOracle::new(config.oracle.clone())?;
    let result = execute(config, oracle, task).await?;
    report(config, &result);
    Ok(())
}

async fn plan(config: &AgentConfig, task: &str, save: bool, execute_plan: bool) -> Result<()> {
    let oracle = OpenAiOracle::new(config.oracle.clone())?;
    info!(task, "Generating plan");
    let plan = oracle.plan(task).await?;
    println!("{}", plan.render());

    if save {
        let path = ArtifactStore::new(&config.artifacts)
            .save_plan(&plan)
            .context("saving plan")?;
        println!("Plan saved to {}", path.display());
    }
    if execute_plan {
        let goal = plan.goal.clone();
        let result = execute(config, PlanReplayOracle::new(plan), &goal).await?;
        report(config, &result);
    }
    Ok(())
}

/// One run against a freshly opened browser; Ctrl-C cancels between steps.
async fn execute<O: DecisionOracle>(
    config: &AgentConfig,
    oracle: O,
    task: &str,
) -> Result<RunResult> {
    let connection = ChromeConnection::open(config.browser.clone()).await?;
    let engine = ChromeEngine::new(ArtifactStore::new(&config.artifacts));
    let mut orchestrator =
        Orchestrator::new(oracle, connection, engine, config.orchestrator.clone());

    let cancel = CancellationToken::new();
    orchestrator.set_cancellation(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            cancel.cancel();
        }
    });

    Ok(orchestrator.run(task).await)
}

async fn serve(config: &AgentConfig, port: u16) -> Result<()> {
    let (event_tx, _) = broadcast::channel::<RunEvent>(256);
    let mut cmd_rx = face::start_server(port..port.saturating_add(10), event_tx.clone()).await?;

    let oracle = OpenAiOracle::new(config.oracle.clone())?;
    let connection = ChromeConnection::open(config.browser.clone()).await?;
    let engine = ChromeEngine::new(ArtifactStore::new(&config.artifacts));
    let mut orchestrator =
        Orchestrator::new(oracle, connection, engine, config.orchestrator.clone())
            .with_events(event_tx);
    info!("Ready, waiting for tasks");

    while let Some(task) = cmd_rx.recv().await {
        let result = orchestrator.run(&task).await;
        report(config, &result);
    }
    Ok(())
}

/// Print the step summary and keep the run record on disk.
fn report(config: &AgentConfig, result: &RunResult) {
    for line in result.summary_lines() {
        println!("{line}");
    }
    match ArtifactStore::new(&config.artifacts).save_run(result) {
        Ok(path) => info!(path = %path.display(), "Run record saved"),
        Err(e) => warn!(error = %e, "Could not save run record"),
    }
}
