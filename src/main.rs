//! Cumulus CLI entrypoint.
//!
//! This is the main entrypoint for the cumulus command-line tool.
//!
//! Exit codes: 0 on success, 1 when changes are pending (`plan
//! --detailed-exitcode`) or some changes failed, 2 on fatal errors.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use cumulus::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use cumulus::config::{ConfigParser, ConfigValidator, DeployConfig, StateBackend, find_config_file};
use cumulus::engine::{ApplyOutcome, Engine};
use cumulus::error::Result;
use cumulus::graph::ResourceGraph;
use cumulus::planner::DeploymentPlan;
use cumulus::provider::{self, CloudProvider};
use cumulus::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Everything went as planned.
const EXIT_OK: u8 = 0;
/// Changes are pending, or some changes failed.
const EXIT_CHANGES: u8 = 1;
/// The command could not run.
const EXIT_FATAL: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.output);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", formatter.error(&format!("Error: {e}")));
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Initializes the logging system.
///
/// `--verbose` forces debug; otherwise `RUST_LOG` is honoured.
fn init_logging(verbose: bool, format: OutputFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<u8> {
    let config_path = cli.config.as_ref();
    let yes = cli.yes;

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force, formatter),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, formatter),
        Commands::Plan {
            refresh,
            detailed_exitcode,
        } => cmd_plan(config_path, refresh, detailed_exitcode, formatter).await,
        Commands::Apply { refresh, parallelism } => {
            cmd_apply(config_path, refresh, parallelism, yes, formatter).await
        }
        Commands::Destroy { parallelism } => cmd_destroy(config_path, parallelism, yes, formatter).await,
        Commands::Drift => cmd_drift(config_path, formatter).await,
        Commands::Outputs => cmd_outputs(config_path, formatter).await,
        Commands::Health => cmd_health(config_path, formatter).await,
        Commands::Graph { dot } => cmd_graph(config_path, dot, formatter),
        Commands::State { command } => cmd_state(config_path, command, formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool, formatter: &OutputFormatter) -> Result<u8> {
    info!("Initializing new Cumulus project in: {}", path.display());

    let config_path = path.join("cumulus.deploy.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && config_path.exists() {
        eprintln!(
            "{}",
            formatter.warning(&format!(
                "Configuration file already exists: {}. Use --force to overwrite.",
                config_path.display()
            ))
        );
        return Ok(EXIT_OK);
    }

    // Create directory if needed
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    // Write config template
    let config_template = include_str!("../templates/cumulus.deploy.yaml");
    std::fs::write(&config_path, config_template)?;
    eprintln!("Created: {}", config_path.display());

    // Write .env.example
    let env_template = include_str!("../templates/.env.example");
    std::fs::write(&env_path, env_template)?;
    eprintln!("Created: {}", env_path.display());

    // Write/update .gitignore
    let state_dir = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Cumulus")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(STATE_DIR) {
                writeln!(file, "{state_dir}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_dir}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\n{}", formatter.success("Project initialized successfully!"));
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set your AWS region and credentials");
    eprintln!("  2. Edit cumulus.deploy.yaml with your resources");
    eprintln!("  3. Run 'cumulus validate' to check your configuration");
    eprintln!("  4. Run 'cumulus plan' to see what will be provisioned");
    eprintln!("  5. Run 'cumulus apply' to provision the stack");

    Ok(EXIT_OK)
}

/// Validate configuration.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config, config_file) = load_config(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let result = ConfigValidator::new().validate(&config)?;
    println!("{}", formatter.format_validation(&config, &result, show_warnings));
    Ok(EXIT_OK)
}

/// Show the deployment plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    refresh: bool,
    detailed_exitcode: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let workspace = Workspace::open(config_path).await?;
    let engine = workspace.engine();

    let plan = engine.plan(refresh).await?;
    println!("{}", formatter.format_plan(&plan));

    if detailed_exitcode && !plan.is_empty() {
        return Ok(EXIT_CHANGES);
    }
    Ok(EXIT_OK)
}

/// Apply the configuration.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    refresh: bool,
    parallelism: Option<usize>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let workspace = Workspace::open(config_path).await?;
    let cancel = cancel_on_ctrl_c();
    let mut engine = workspace.engine().with_cancellation(cancel);
    if let Some(parallelism) = parallelism {
        engine = engine.with_parallelism(parallelism);
    }

    let outcome = engine
        .apply(refresh, |plan| {
            confirm(plan, formatter, auto_approve, "Do you want to apply this plan? [y/N]: ", "y")
        })
        .await?;

    println!("{}", formatter.format_outcome(&outcome));
    Ok(exit_code(&outcome))
}

/// Destroy every tracked resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    parallelism: Option<usize>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let workspace = Workspace::open(config_path).await?;
    let cancel = cancel_on_ctrl_c();
    let mut engine = workspace.engine().with_cancellation(cancel);
    if let Some(parallelism) = parallelism {
        engine = engine.with_parallelism(parallelism);
    }

    let outcome = engine
        .destroy(|plan| {
            confirm(
                plan,
                formatter,
                auto_approve,
                "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
                "destroy",
            )
        })
        .await?;

    println!("{}", formatter.format_outcome(&outcome));
    Ok(exit_code(&outcome))
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<u8> {
    let workspace = Workspace::open(config_path).await?;
    let report = workspace.engine().drift().await?;
    println!("{}", formatter.format_drift(&report));
    Ok(EXIT_OK)
}

/// Show stack outputs.
async fn cmd_outputs(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<u8> {
    let workspace = Workspace::open(config_path).await?;
    let outputs = workspace.engine().outputs().await?;
    println!("{}", formatter.format_outputs(&outputs));
    Ok(EXIT_OK)
}

/// Run endpoint health checks.
async fn cmd_health(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<u8> {
    let workspace = Workspace::open(config_path).await?;
    let results = workspace.engine().health().await?;
    println!("{}", formatter.format_health(&results));

    if results.iter().all(|r| r.healthy) {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_CHANGES)
    }
}

/// Show the dependency graph.
fn cmd_graph(config_path: Option<&PathBuf>, dot: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config, _) = load_config(config_path)?;
    ConfigValidator::new().validate(&config)?;
    let graph = ResourceGraph::build(&config.resources)?;

    if dot {
        println!("{}", graph.to_dot());
    } else {
        println!("{}", formatter.format_graph(&graph));
    }
    Ok(EXIT_OK)
}

/// State management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<u8> {
    let workspace = Workspace::open(config_path).await?;
    let store = workspace.store.as_ref();

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                let lock = store.get_lock_info().await?;
                println!("{}", formatter.format_state(&state, lock.as_ref()));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.force_unlock().await? {
                    warn!("Removed lock held by {} for {}", lock.holder, lock.operation);
                    eprintln!("{}", formatter.success("State forcefully unlocked."));
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("{}", formatter.success("State unlocked."));
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(EXIT_FATAL);
            }
        }
    }

    Ok(EXIT_OK)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Configuration, state store and provider of one invocation.
struct Workspace {
    config: DeployConfig,
    store: Box<dyn StateStore>,
    provider: Arc<dyn CloudProvider>,
}

impl Workspace {
    /// Loads and validates the configuration, then connects the backends.
    async fn open(config_path: Option<&PathBuf>) -> Result<Self> {
        let (config, config_file) = load_config(config_path)?;

        let result = ConfigValidator::new().validate(&config)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }

        let store = create_state_store(&config, &config_file).await;
        let provider = provider::from_config(&config.provider).await;
        debug!(
            "Using {} state backend and {} provider",
            store.backend_type(),
            provider.name()
        );

        Ok(Self { config, store, provider })
    }

    fn engine(&self) -> Engine<'_> {
        Engine::new(&self.config, self.store.as_ref(), Arc::clone(&self.provider))
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads `.env` next to the configuration file, then the configuration.
fn load_config(config_path: Option<&PathBuf>) -> Result<(DeployConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, config_file))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Creates the state store selected in the configuration.
async fn create_state_store(config: &DeployConfig, config_file: &Path) -> Box<dyn StateStore> {
    match config.state.backend {
        StateBackend::Local => match &config.state.path {
            Some(path) => Box::new(LocalStateStore::with_state_path(config_dir(config_file).join(path))),
            None => Box::new(LocalStateStore::with_base_dir(
                config_dir(config_file).join(STATE_DIR).join(&config.project.stack),
            )),
        },
        StateBackend::S3 => {
            // The validator guarantees a bucket for this backend.
            let bucket = config.state.bucket.as_deref().unwrap_or_default();
            let prefix = config.state.prefix.clone().unwrap_or_else(|| {
                format!("{}/{}", config.project.name, config.project.stack)
            });
            let region = config.state.region.as_deref().or(config.provider.region.as_deref());
            Box::new(S3StateStore::new(bucket, Some(&prefix), region).await)
        }
    }
}

/// Returns a token cancelled on the first Ctrl-C. A second Ctrl-C exits
/// without waiting; the state lock then stays until it expires.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !interrupt(&token) {
                eprintln!("Interrupted again, exiting now");
                std::process::exit(i32::from(EXIT_FATAL));
            }
        }
    });
    cancel
}

/// Handles one interrupt. Returns false if the run was already cancelled.
fn interrupt(token: &CancellationToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    warn!("Interrupt received, waiting for in-flight changes to finish (Ctrl-C again to exit now)");
    token.cancel();
    true
}

/// Shows the plan and asks for confirmation unless auto-approved.
fn confirm(plan: &DeploymentPlan, formatter: &OutputFormatter, auto_approve: bool, prompt: &str, answer: &str) -> bool {
    println!("{}", formatter.format_plan(plan));
    if auto_approve {
        return true;
    }

    eprint!("{prompt}");
    if std::io::stderr().flush().is_err() {
        return false;
    }
    read_answer(&mut std::io::stdin().lock(), answer)
}

/// Reads one line and compares it with `answer`. The read blocks the
/// current worker, so the runtime is told to move its other tasks away.
fn read_answer(input: &mut impl BufRead, answer: &str) -> bool {
    tokio::task::block_in_place(|| {
        let mut line = String::new();
        input.read_line(&mut line).is_ok() && line.trim().eq_ignore_ascii_case(answer)
    })
}

/// Maps a run outcome to the process exit code.
fn exit_code(outcome: &ApplyOutcome) -> u8 {
    if outcome.is_success() { EXIT_OK } else { EXIT_CHANGES }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_second_interrupt_forces_exit() {
        let token = CancellationToken::new();
        assert!(interrupt(&token));
        assert!(token.is_cancelled());
        assert!(!interrupt(&token));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_answer() {
        assert!(read_answer(&mut Cursor::new("Destroy\n"), "destroy"));
        assert!(read_answer(&mut Cursor::new("  y \n"), "y"));
        assert!(!read_answer(&mut Cursor::new("n\n"), "y"));
        assert!(!read_answer(&mut Cursor::new(""), "y"));
    }
}
