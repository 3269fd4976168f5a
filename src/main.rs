use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Reset SIGPIPE to default behavior so piping (e.g. `keel graph | dot`) exits cleanly
/// instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use keel::config::loader;
use keel::config::types::StackConfig;
use keel::dag::resource_graph::ResourceGraph;
use keel::dag::visualizer;
use keel::error::EngineError;
use keel::executor::engine::{self, ApplyOptions};
use keel::executor::outputs;
use keel::output::formatter;
use keel::planner::{self, drift, plan::Plan};
use keel::provider::{self, schema::SchemaRegistry, ProviderCapability};
use keel::state::backend::StateBackend;
use keel::state::lock::{generate_holder_id, StackLease};
use keel::state::sqlite::SqliteBackend;
use keel::state::store::StateStore;

const STATE_DB: &str = "state.db";

/// keel - desired-state reconciliation for declarative infrastructure
#[derive(Parser)]
#[command(name = "keel", version, about, long_about = None)]
struct Cli {
    /// Stack file, or a directory of .yaml files merged into one stack
    #[arg(short, long, global = true, default_value = "stack.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Working directory for state and the local provider's inventory
    #[arg(short, long, global = true, default_value = ".keel")]
    working_dir: PathBuf,

    /// Maximum number of concurrent provider operations
    #[arg(short, long, global = true)]
    parallelism: Option<usize>,

    /// Override a stack variable (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", global = true)]
    vars: Vec<String>,

    /// Stack name for commands that only touch state (defaults to the
    /// name declared in the stack file)
    #[arg(short, long, global = true)]
    stack: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the stack without touching state
    Validate,

    /// Show the ordered execution plan
    Plan,

    /// Plan and apply changes
    Apply {
        /// Skip confirmation prompt
        #[arg(long)]
        auto_approve: bool,
    },

    /// Delete every resource in state, dependents first
    Destroy {
        /// Skip confirmation prompt
        #[arg(long)]
        auto_approve: bool,
    },

    /// Print the dependency graph as DOT
    Graph,

    /// Compare state with what the provider reports
    Drift,

    /// Show stack outputs from the last apply
    Output {
        /// Print a single output's raw value
        name: Option<String>,

        /// Print outputs as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or edit state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Remove a stale lease left by a crashed run
    ForceUnlock,
}

#[derive(Subcommand)]
enum StateCommands {
    /// List all resources in state
    List {
        /// Only show resources of this type
        #[arg(long = "type")]
        resource_type: Option<String>,
    },

    /// Show details for one resource
    Show {
        /// Logical resource ID
        id: String,
    },

    /// Forget a resource without deleting it
    Rm {
        /// Logical resource ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            formatter::print_error(&format!("{:#}", e));
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(cli: &Cli) -> Result<u8> {
    match cli.command {
        Commands::Validate => cmd_validate(cli),
        Commands::Plan => cmd_plan(cli).await,
        Commands::Apply { auto_approve } => cmd_apply(cli, auto_approve).await,
        Commands::Destroy { auto_approve } => cmd_destroy(cli, auto_approve).await,
        Commands::Graph => cmd_graph(cli),
        Commands::Drift => cmd_drift(cli).await,
        Commands::Output { ref name, json } => cmd_output(cli, name.as_deref(), json).await,
        Commands::State { ref command } => cmd_state(cli, command).await,
        Commands::ForceUnlock => cmd_force_unlock(cli).await,
    }
}

/// Engine errors carry their own exit code; anything else is a usage or
/// configuration problem.
fn exit_code_for(e: &anyhow::Error) -> u8 {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
        .map(EngineError::exit_code)
        .unwrap_or(2)
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn load(cli: &Cli) -> Result<StackConfig> {
    let overrides = cli
        .vars
        .iter()
        .map(|raw| loader::parse_var_assignment(raw))
        .collect::<Result<Vec<_>>>()?;
    let mut stack = loader::load_stack(&cli.config, &overrides)?;
    if let Some(parallelism) = cli.parallelism {
        stack.settings.parallelism = parallelism.max(1);
    }
    Ok(stack)
}

async fn open_store(working_dir: &Path, stack: &str) -> Result<StateStore> {
    std::fs::create_dir_all(working_dir).with_context(|| {
        format!("Failed to create working directory: {}", working_dir.display())
    })?;
    let backend = SqliteBackend::open(&working_dir.join(STATE_DB))?;
    backend.initialize().await?;
    Ok(StateStore::new(Arc::new(backend), stack))
}

/// Stack name for state-only commands: `--stack`, else the stack file's.
fn stack_name(cli: &Cli) -> Result<String> {
    match cli.stack {
        Some(ref name) => Ok(name.clone()),
        None => Ok(load(cli)
            .context("Cannot determine the stack name; pass --stack or a valid -c")?
            .name),
    }
}

/// Provider for the stack plus the merged immutability metadata.
fn open_provider(
    cli: &Cli,
    stack: &StackConfig,
) -> Result<(Arc<dyn ProviderCapability>, SchemaRegistry)> {
    std::fs::create_dir_all(&cli.working_dir)?;
    let provider = provider::from_name(&stack.settings.provider, &cli.working_dir)?;
    let mut schemas = provider.schemas();
    schemas.merge(&stack.schemas);
    Ok((provider, schemas))
}

fn confirm(question: &str) -> Result<bool> {
    println!("\n{} Only '{}' will be accepted.", question, "yes".bold());
    print!("  Enter a value: ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim() == "yes")
}

/// Flips to true on Ctrl-C so the walker stops scheduling new operations.
fn cancel_on_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{}",
                "Interrupt received. Waiting for in-flight operations to finish...".yellow()
            );
            let _ = tx.send(true);
        }
    });
    rx
}

// ─── Commands ────────────────────────────────────────────────────────────────

fn cmd_validate(cli: &Cli) -> Result<u8> {
    let stack = load(cli)?;
    let graph = ResourceGraph::build(stack.resources.clone())?;
    formatter::print_success(&format!(
        "Stack '{}' is valid: {} resource(s), {} dependency edge(s), {} output(s).",
        stack.name,
        graph.len(),
        graph.edges().len(),
        stack.outputs.len()
    ));
    Ok(0)
}

async fn cmd_plan(cli: &Cli) -> Result<u8> {
    let stack = load(cli)?;
    let graph = ResourceGraph::build(stack.resources.clone())?;
    let (_, schemas) = open_provider(cli, &stack)?;
    let store = open_store(&cli.working_dir, &stack.name).await?;

    let prior = store.load().await?;
    let plan = planner::plan(&stack.name, &graph, &prior, &schemas)?;
    formatter::print_plan(&plan);
    Ok(0)
}

async fn cmd_apply(cli: &Cli, auto_approve: bool) -> Result<u8> {
    let stack = load(cli)?;
    // Graph errors abort before the lease is taken
    let graph = ResourceGraph::build(stack.resources.clone())?;
    let (provider, schemas) = open_provider(cli, &stack)?;
    let store = open_store(&cli.working_dir, &stack.name).await?;

    let lease = store
        .lock(&generate_holder_id(), "apply", stack.settings.lock_ttl)
        .await?;
    let outcome = async {
        let prior = store.load().await?;
        let plan = planner::plan(&stack.name, &graph, &prior, &schemas)?;
        run_plan(&stack, plan, provider, &lease, auto_approve).await
    }
    .await;
    release(lease).await;
    outcome
}

async fn cmd_destroy(cli: &Cli, auto_approve: bool) -> Result<u8> {
    let stack = load(cli)?;
    let (provider, _) = open_provider(cli, &stack)?;
    let store = open_store(&cli.working_dir, &stack.name).await?;

    let lease = store
        .lock(&generate_holder_id(), "destroy", stack.settings.lock_ttl)
        .await?;
    let outcome = async {
        let prior = store.load().await?;
        let plan = planner::plan_destroy(&stack.name, &prior)?;
        run_plan(&stack, plan, provider, &lease, auto_approve).await
    }
    .await;
    release(lease).await;
    outcome
}

/// Show a plan, confirm it, apply it and refresh outputs.
async fn run_plan(
    stack: &StackConfig,
    plan: Plan,
    provider: Arc<dyn ProviderCapability>,
    lease: &StackLease,
    auto_approve: bool,
) -> Result<u8> {
    let is_destroy = plan.is_destroy;
    formatter::print_plan(&plan);

    if plan.is_empty() {
        if !is_destroy {
            let values = outputs::publish_outputs(lease, &stack.outputs).await?;
            formatter::print_outputs(&values);
        }
        return Ok(0);
    }

    if !auto_approve {
        let question = if is_destroy {
            "Do you really want to destroy all resources?"
        } else {
            "Do you want to perform these actions?"
        };
        if !confirm(question)? {
            let what = if is_destroy { "Destroy" } else { "Apply" };
            println!("\n{}", format!("{} cancelled.", what).yellow());
            return Ok(0);
        }
    }

    let mut options = ApplyOptions::from_settings(&stack.settings);
    options.progress = true;
    options.cancel = Some(cancel_on_interrupt());

    let result = engine::apply(plan, provider, lease, options).await?;
    formatter::print_apply_result(&result);

    if is_destroy {
        if result.is_success() {
            lease.set_outputs(&[]).await?;
        }
    } else if result.succeeded > 0 || result.is_success() {
        let values = outputs::publish_outputs(lease, &stack.outputs).await?;
        formatter::print_outputs(&values);
    }

    Ok(result.exit_code() as u8)
}

async fn release(lease: StackLease) {
    let stack = lease.stack().to_string();
    if let Err(e) = lease.release().await {
        tracing::warn!(stack = %stack, error = %e, "Failed to release lease");
    }
}

fn cmd_graph(cli: &Cli) -> Result<u8> {
    let stack = load(cli)?;
    let graph = ResourceGraph::build(stack.resources.clone())?;
    print!("{}", visualizer::to_dot(&graph, &stack.name));
    Ok(0)
}

async fn cmd_drift(cli: &Cli) -> Result<u8> {
    let stack = load(cli)?;
    let (provider, _) = open_provider(cli, &stack)?;
    let store = open_store(&cli.working_dir, &stack.name).await?;

    let records = store.load().await?;
    let results = drift::detect_drift(&records, provider.as_ref()).await;
    let drifted = formatter::print_drift(&results);
    Ok(u8::from(drifted))
}

async fn cmd_output(cli: &Cli, name: Option<&str>, json: bool) -> Result<u8> {
    let stack = stack_name(cli)?;
    let store = open_store(&cli.working_dir, &stack).await?;
    let values = store.outputs().await?;

    if let Some(name) = name {
        let Some(output) = values.iter().find(|o| o.name == name) else {
            bail!("Output '{}' not found. Run 'keel apply' first.", name);
        };
        match output.value {
            Some(serde_json::Value::String(ref s)) if !json => println!("{}", s),
            Some(ref value) => println!("{}", serde_json::to_string_pretty(value)?),
            None => println!("{}", "(unknown)".dimmed()),
        }
        return Ok(0);
    }

    if json {
        let map: serde_json::Map<String, serde_json::Value> = values
            .iter()
            .map(|o| (o.name.clone(), o.value.clone().unwrap_or(serde_json::Value::Null)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        formatter::print_outputs(&values);
    }
    Ok(0)
}

async fn cmd_state(cli: &Cli, command: &StateCommands) -> Result<u8> {
    let stack = stack_name(cli)?;
    let store = open_store(&cli.working_dir, &stack).await?;

    match command {
        StateCommands::List { resource_type } => {
            let records = store.load().await?;
            formatter::print_resource_list(records.values().filter(|r| {
                resource_type
                    .as_deref()
                    .map(|t| r.resource_type == t)
                    .unwrap_or(true)
            }));
        }
        StateCommands::Show { id } => {
            let record = store
                .get(id)
                .await?
                .with_context(|| format!("Resource '{}' not found in state", id))?;
            formatter::print_resource_detail(&record);
        }
        StateCommands::Rm { id } => {
            let lease = store
                .lock(&generate_holder_id(), "state-rm", std::time::Duration::from_secs(60))
                .await?;
            let removed = lease.remove_record(id).await;
            release(lease).await;
            if !removed? {
                bail!("Resource '{}' not found in state", id);
            }
            formatter::print_success(&format!("Removed '{}' from state.", id));
        }
    }
    Ok(0)
}

async fn cmd_force_unlock(cli: &Cli) -> Result<u8> {
    let stack = stack_name(cli)?;
    let store = open_store(&cli.working_dir, &stack).await?;
    match store.force_unlock().await? {
        Some(lease) => formatter::print_success(&format!(
            "Released lease {} on stack '{}' held by {} ({}).",
            lease.lease_id, lease.stack, lease.holder, lease.operation
        )),
        None => println!("{}", format!("Stack '{}' is not locked.", stack).dimmed()),
    }
    Ok(0)
}
