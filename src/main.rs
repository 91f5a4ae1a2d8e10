//! Halldyll CLI entrypoint.
//!
//! This is the main entrypoint for the halldyll command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use halldyll_reconcile::cli::{Cli, Commands, OutputFormatter, StateCommands};
use halldyll_reconcile::config::{
    find_config_file, ConfigParser, ConfigValidator, ReconcileConfig, StateBackend,
    DEFAULT_CONFIG_FILES,
};
use halldyll_reconcile::error::{EngineError, Result};
use halldyll_reconcile::model::ResourceId;
use halldyll_reconcile::provider::ProviderRegistry;
use halldyll_reconcile::reconciler::{EngineSettings, Reconciler};
use halldyll_reconcile::state::{generate_holder_id, LocalStateStore, S3StateStore, StateStore, STATE_DIR};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for a run that did not fully succeed.
const EXIT_INCOMPLETE: u8 = 2;

/// Configuration template written by `init`.
const CONFIG_TEMPLATE: &str = r#"# Halldyll reconciliation configuration.
project:
  name: my-project
  environment: dev

state:
  backend: local
  # path: .halldyll

engine:
  concurrency: 4
  refresh: true
  retry:
    max_attempts: 4
    initial_delay_ms: 200

defaults:
  random_id:
    byte_length: 4

resources:
  - id: suffix
    kind: random_id
    properties:
      prefix: "app-"

  - id: readme
    kind: local_file
    properties:
      path: out/readme.txt
      content: { $ref: "suffix.hex" }
"#;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, concurrency } => cmd_apply(config, yes, concurrency, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Halldyll project in: {}", path.display());

    let config_path = path.join(DEFAULT_CONFIG_FILES[0]);
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, CONFIG_TEMPLATE)?;
    eprintln!("Created: {}", config_path.display());

    let ignored = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Halldyll\n{ignored}")?;
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!("{ignored}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit {} with your resources", DEFAULT_CONFIG_FILES[0]);
    eprintln!("  2. Run 'halldyll validate' to check your configuration");
    eprintln!("  3. Run 'halldyll plan' to see what will change");
    eprintln!("  4. Run 'halldyll apply' to reconcile");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let registry = ProviderRegistry::with_builtin();
    let result = validator_for(&registry).check(&config);

    print_output(&formatter.format_validation(&config, &result, show_warnings))?;
    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the reconciliation plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = load_context(config_path).await?;
    let reconciler = context.reconciler(None);

    let plan = reconciler.plan(context.config.resource_nodes()?).await?;
    print_output(&formatter.format_plan(&plan, detailed))?;

    Ok(ExitCode::SUCCESS)
}

/// Apply the reconciliation plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = load_context(config_path).await?;
    let reconciler = context.reconciler(concurrency);

    let plan = reconciler.plan(context.config.resource_nodes()?).await?;
    if !plan.has_changes() {
        print_output(&formatter.format_plan(&plan, false))?;
        return Ok(ExitCode::SUCCESS);
    }

    if !formatter.is_json() {
        print_output(&formatter.format_plan(&plan, true))?;
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = cancel_on_ctrl_c();
    let report = reconciler.apply(plan, &cancel).await?;
    print_output(&formatter.format_report(&report))?;

    Ok(run_exit_code(report.is_success()))
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = load_context(config_path).await?;
    let reconciler = context.reconciler(None);

    let plan = reconciler.plan_destroy().await?;
    if !plan.has_changes() {
        eprintln!("No resources to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    if !formatter.is_json() {
        print_output(&formatter.format_plan(&plan, false))?;
    }

    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = cancel_on_ctrl_c();
    let report = reconciler.apply(plan, &cancel).await?;
    print_output(&formatter.format_report(&report))?;

    Ok(run_exit_code(report.is_success()))
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let context = load_context(config_path).await?;
    let reconciler = context.reconciler(None);

    let report = reconciler.check_drift(context.config.resource_nodes()?).await?;
    print_output(&formatter.format_drift(&report))?;

    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = load_context(config_path).await?;
    let store = &context.store;

    match command {
        StateCommands::Show => {
            let records = store.list_all().await?;
            let lock = store.get_lock_info().await?;
            print_output(&formatter.format_state(&records, store.backend_type(), lock.as_ref()))?;
        }
        StateCommands::List => {
            let records = store.list_all().await?;
            print_output(&formatter.format_records(&records))?;
        }
        StateCommands::Forget { id } => {
            let id = ResourceId::new(id);
            if store.get(&id).await?.is_none() {
                eprintln!("No record for '{id}'.");
                return Ok(ExitCode::FAILURE);
            }

            let lock = store.acquire_lock(&generate_holder_id()).await?;
            let removed = store.remove(&id).await;
            store.release_lock(&lock.lock_id).await?;
            removed?;
            eprintln!("Forgot '{id}'. The live resource was left untouched.");
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            print_output(&formatter.format_lock(Some(&lock)))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    warn!("Forcefully releasing lock held by {}", lock_info.holder);
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loaded configuration with its state store and adapters.
struct CommandContext {
    config: ReconcileConfig,
    store: Arc<dyn StateStore>,
    registry: ProviderRegistry,
}

impl CommandContext {
    fn reconciler(&self, concurrency: Option<usize>) -> Reconciler<'_> {
        let mut settings: EngineSettings = self.config.engine.settings();
        if let Some(concurrency) = concurrency {
            settings.concurrency = concurrency;
        }
        Reconciler::new(&self.registry, Arc::clone(&self.store), settings)
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory holding the configuration file.
fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn validator_for(registry: &ProviderRegistry) -> ConfigValidator {
    ConfigValidator::new().with_known_kinds(registry.kinds().into_iter().map(|k| k.as_str()))
}

/// Loads and validates configuration, then opens the configured state store.
async fn load_context(config_path: Option<&PathBuf>) -> Result<CommandContext> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let registry = ProviderRegistry::with_builtin();
    let result = validator_for(&registry).validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config.state.path.as_deref().map_or_else(
                || config_dir(&config_file).join(STATE_DIR),
                |p| parser.resolve_path(p),
            );
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| EngineError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Arc::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };
    debug!("Using {} state backend", store.backend_type());

    Ok(CommandContext {
        config,
        store,
        registry,
    })
}

/// Asks for confirmation on stdin.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Returns a token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, letting in-flight operations finish");
            token.cancel();
        }
    });
    cancel
}

fn run_exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCOMPLETE)
    }
}

/// Writes command output to stdout.
fn print_output(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", output.trim_end())?;
    Ok(())
}
