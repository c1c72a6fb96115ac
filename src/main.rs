mod dryrun;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use qaflow_core::config::AppConfig;
use qaflow_core::types::{SessionId, SessionSnapshot, SessionSummary};
use qaflow_engine::{GraphDescription, QaClient, RunReport, StepRegistry, WorkflowGraph};
use qaflow_store::SqliteSessionStore;

use dryrun::DryRunCapabilities;

#[derive(Parser)]
#[command(name = "qaflow", version, about = "Graph-driven QA runs with resumable sessions")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "qaflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session and run it through a workflow graph
    Run {
        /// Human-readable test name
        #[arg(short, long)]
        label: String,
        #[arg(long)]
        owner: Option<String>,
        /// Objective used to pick the graph (defaults to generator.objective)
        #[arg(long)]
        objective: Option<String>,
        #[command(flatten)]
        sim: SimArgs,
    },
    /// Continue a paused or interrupted session
    Resume {
        id: String,
        #[arg(long)]
        objective: Option<String>,
        #[command(flatten)]
        sim: SimArgs,
    },
    /// List sessions, most recently updated first
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show one session in full
    Show { id: String },
    /// Register a session without running it
    Create {
        #[arg(short, long)]
        label: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Evict old and excess sessions from memory (stored data is kept)
    Cleanup {
        #[arg(long)]
        max_active: Option<usize>,
        #[arg(long)]
        days_old: Option<u64>,
    },
    /// Write a session snapshot as JSON
    Export {
        id: String,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load a session snapshot written by `export`
    Import { file: PathBuf },
    /// Session counts by status
    Stats,
    /// Show the graph that would be used for an objective
    Graph {
        #[arg(long)]
        objective: Option<String>,
        /// Pre-generated graph description to try first
        #[arg(long)]
        graph: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Validate a graph description file
    Validate { file: PathBuf },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Knobs for the simulated browser and graph source.
#[derive(clap::Args)]
struct SimArgs {
    /// Pre-generated graph description to try before the fallback
    #[arg(long)]
    graph: Option<PathBuf>,
    /// Make this action fail every time
    #[arg(long)]
    fail_action: Option<String>,
    /// Simulated latency per action in milliseconds
    #[arg(long, default_value = "50")]
    latency_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("qaflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handled before config loading
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "qaflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate_file(file),
        _ => {}
    }

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            label,
            owner,
            objective,
            sim,
        } => {
            let objective = objective.unwrap_or_else(|| config.generator.objective.clone());
            let client = build_client(&mut config, Some(&sim))?;
            let report = client
                .start(&label, owner, &objective, cancel_on_ctrl_c())
                .await?;
            print_report(&report);
        }
        Commands::Resume { id, objective, sim } => {
            let objective = objective.unwrap_or_else(|| config.generator.objective.clone());
            let client = build_client(&mut config, Some(&sim))?;
            let report = client
                .resume(&SessionId::from(id), &objective, cancel_on_ctrl_c())
                .await?;
            print_report(&report);
        }
        Commands::List { limit, json } => {
            let client = build_client(&mut config, None)?;
            let sessions = client.list_all(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions(&sessions);
            }
        }
        Commands::Show { id } => {
            let client = build_client(&mut config, None)?;
            let session = client.detail(&SessionId::from(id)).await?;
            println!("{}", serde_json::to_string_pretty(&*session)?);
        }
        Commands::Create { label, owner } => {
            let client = build_client(&mut config, None)?;
            let id = client.create(&label, owner);
            // A CLI process is short-lived; persist right away
            client.registry().checkpoint(&id).await?;
            println!("{}", id);
        }
        Commands::Cleanup {
            max_active,
            days_old,
        } => {
            let client = build_client(&mut config, None)?;
            let max_active = max_active.unwrap_or(client.config().registry.max_active);
            let days_old = days_old.unwrap_or(client.config().registry.max_age_days);
            // Load stored sessions so old finished ones get archived on eviction
            for summary in client.list_all(10_000).await? {
                client.detail(&summary.id).await?;
            }
            let report = client.cleanup(max_active, days_old).await;
            println!(
                "Evicted {} session(s) ({} by age, {} by capacity), {} remaining in memory",
                report.evicted(),
                report.evicted_by_age.len(),
                report.evicted_by_capacity.len(),
                report.remaining
            );
            for (id, error) in &report.failed {
                warn!(session_id = %id, error = %error, "Session kept: checkpoint failed");
            }
        }
        Commands::Export { id, output } => {
            let client = build_client(&mut config, None)?;
            let json = client.export(&SessionId::from(id)).await?.to_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "Session exported");
                }
                None => println!("{}", json),
            }
        }
        Commands::Import { file } => {
            let client = build_client(&mut config, None)?;
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let id = client.import(SessionSnapshot::from_json(&json)?).await?;
            println!("{}", id);
        }
        Commands::Stats => {
            let client = build_client(&mut config, None)?;
            let stats = client.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Graph {
            objective,
            graph,
            json,
        } => {
            if graph.is_some() {
                config.generator.graph_file = graph.map(|p| p.display().to_string());
            }
            let objective = objective.unwrap_or_else(|| config.generator.objective.clone());
            let client = build_client(&mut config, None)?;
            let selection = client.prepare_graph(&objective).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "source": selection.source,
                        "summary": selection.graph.summary(),
                    }))?
                );
            } else {
                let summary = selection.graph.summary();
                println!("Graph: {} ({} nodes)", summary.name, summary.node_count);
                println!("Source: {}", serde_json::to_string(&selection.source)?);
                for phase in &summary.phases {
                    println!("  {:<16} {}", phase.name, phase.nodes.join(" -> "));
                }
                println!("Order: {}", summary.order.join(", "));
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } | Commands::Validate { .. } => {
            unreachable!("handled before config load")
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".qaflow").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    Ok(AppConfig::default())
}

fn build_client(config: &mut AppConfig, sim: Option<&SimArgs>) -> anyhow::Result<QaClient> {
    if let Some(graph) = sim.and_then(|s| s.graph.as_ref()) {
        config.generator.graph_file = Some(graph.display().to_string());
    }
    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("creating workspace {}", workspace.display()))?;

    let store = Arc::new(SqliteSessionStore::open(&config.store_path())?);
    let capabilities = Arc::new(match sim {
        Some(sim) => DryRunCapabilities::new(sim.fail_action.clone(), sim.latency_ms),
        None => DryRunCapabilities::new(None, 0),
    });
    Ok(QaClient::builder(store, capabilities)
        .config(config.clone())
        .build()?)
}

/// Cancellation token tripped by Ctrl-C; the run pauses at the next step boundary.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Pausing after the current step...");
        trigger.cancel();
    });
    cancel
}

fn validate_file(path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let desc: GraphDescription = serde_json::from_str(&raw)?;
    let graph = WorkflowGraph::new(desc)?;
    graph.validate_steps(&StepRegistry::with_action_step().names())?;
    let summary = graph.summary();
    println!(
        "OK: {} ({} nodes, {} phases, start {})",
        summary.name,
        summary.node_count,
        summary.phases.len(),
        summary.start
    );
    Ok(())
}

fn print_report(report: &RunReport) {
    let s = &report.session;
    println!("Session:   {}", s.id);
    println!("Status:    {}", report.status);
    println!("Executed:  {}", s.executed_nodes.join(", "));
    if !s.failed_nodes.is_empty() {
        println!("Failed:    {}", s.failed_nodes.join(", "));
    }
    if let Some(node) = &s.current_node {
        println!("Resume at: {}", node);
    }
    println!("Evidence:  {}", s.evidence_count());
    println!("Errors:    {}", s.errors.len());
    println!("Artifacts: {}", s.artifacts_dir.display());
    println!("Elapsed:   {}ms", report.elapsed_ms);
}

fn print_sessions(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }
    println!(
        "{:<44} {:<20} {:<10} {:<14} {:>4} {:>4} {:>4}",
        "ID", "LABEL", "STATUS", "PHASE", "OK", "FAIL", "EVID"
    );
    for s in sessions {
        println!(
            "{:<44} {:<20} {:<10} {:<14} {:>4} {:>4} {:>4}",
            s.id.as_str(),
            truncate(&s.label, 20),
            s.status.as_str(),
            s.current_phase.as_deref().map_or("-", |p| truncate(p, 14)),
            s.executed,
            s.failed,
            s.evidence
        );
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
