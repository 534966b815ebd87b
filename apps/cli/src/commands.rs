//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use pipehub_core::{Dispatcher, PipelineOutcome, ProgressReporter, register_command_tasks};
use pipehub_probe::ReadinessProber;
use pipehub_queue::MemoryQueue;
use pipehub_registry::TaskRegistry;
use pipehub_shared::{PipehubError, ResolvedConfig, TaskResult, init_config, load_config};
use pipehub_worker::{WorkerPool, WorkerPoolConfig};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// pipehub — dispatch build/harden/docs pipelines with readiness gating.
#[derive(Parser)]
#[command(
    name = "pipehub",
    version,
    about = "Dispatch named task pipelines, gated on dependent services becoming healthy.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a pipeline (dry run unless --apply is given).
    Run {
        /// Pipeline to run (e.g., build, harden, docs).
        #[arg(long)]
        pipeline: String,

        /// Actually submit tasks; without this flag the plan is only reported.
        #[arg(long)]
        apply: bool,
    },

    /// Probe a pipeline's required services and report the verdict.
    Check {
        /// Pipeline whose dependencies to probe.
        #[arg(long)]
        pipeline: String,
    },

    /// List configured pipelines, tasks, and services.
    List,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Tracing targets across the workspace. The binary crate and the library
/// crates are distinct targets, so each needs its own directive.
const LOG_TARGETS: [&str; 7] = [
    "pipehub",
    "pipehub_core",
    "pipehub_worker",
    "pipehub_probe",
    "pipehub_queue",
    "pipehub_registry",
    "pipehub_shared",
];

fn default_directives(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(cli.verbose)));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

/// Map an error to a process exit code: 2 for environment/config problems,
/// 1 for pipeline-level failures.
pub(crate) fn exit_code_for(err: &color_eyre::Report) -> i32 {
    match err.downcast_ref::<PipehubError>() {
        Some(PipehubError::Config { .. })
        | Some(PipehubError::Io { .. })
        | Some(PipehubError::Validation { .. }) => 2,
        _ => 1,
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run { pipeline, apply } => cmd_run(&pipeline, apply).await,
        Command::Check { pipeline } => cmd_check(&pipeline).await,
        Command::List => cmd_list().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Startup context
// ---------------------------------------------------------------------------

/// Everything a command needs, constructed once at startup — no hidden
/// process-wide singletons.
struct AppContext {
    dispatcher: Dispatcher<MemoryQueue>,
    pool: Arc<WorkerPool<MemoryQueue>>,
}

fn load_resolved_config() -> Result<ResolvedConfig> {
    Ok(load_config()?.resolve()?)
}

/// Bootstrap: populate the registry from config, start the worker pool, and
/// wire up the dispatcher.
fn bootstrap(resolved: &ResolvedConfig) -> Result<AppContext> {
    let mut registry = TaskRegistry::new();
    register_command_tasks(&mut registry, &resolved.tasks)?;
    let registry = Arc::new(registry);

    let queue = Arc::new(MemoryQueue::new());
    let pool = Arc::new(WorkerPool::start(
        registry.clone(),
        queue,
        WorkerPoolConfig {
            workers: resolved.workers,
            queue_poll_timeout: resolved.queue_poll_timeout,
            task_timeout: resolved.task_timeout,
            ..WorkerPoolConfig::default()
        },
    ));

    let prober = ReadinessProber::with_poll_interval(resolved.probe_interval)?;
    let dispatcher = Dispatcher::new(
        resolved.pipelines.clone(),
        registry,
        pool.clone(),
        prober,
        resolved.readiness_deadline,
    );

    Ok(AppContext { dispatcher, pool })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(pipeline: &str, apply: bool) -> Result<()> {
    let resolved = load_resolved_config()?;
    let ctx = bootstrap(&resolved)?;

    info!(pipeline, apply, "dispatching pipeline");

    let reporter = CliProgress::new();
    let run_result = ctx.dispatcher.run(pipeline, apply, &reporter).await;
    reporter.clear();
    ctx.pool.shutdown().await;

    let outcome = run_result?;

    println!();
    if outcome.dry_run {
        println!("  Dry run — would execute {} task(s):", outcome.planned.len());
        for (i, task) in outcome.planned.iter().enumerate() {
            println!("    {}. {task}", i + 1);
        }
        println!();
        println!("  Re-run with --apply to execute.");
    } else {
        println!("  Pipeline '{}' completed.", outcome.pipeline);
        for result in &outcome.results {
            println!(
                "    {:<20} {} ({:.1}s)",
                result.task,
                result.status,
                result.duration.as_secs_f64()
            );
        }
        if let Some(verdict) = &outcome.verdict {
            println!(
                "  Readiness: {} service(s) healthy after {:.1}s",
                verdict.services.len(),
                verdict.elapsed.as_secs_f64()
            );
        }
        println!("  Time: {:.1}s", outcome.elapsed.as_secs_f64());
    }
    println!();

    Ok(())
}

async fn cmd_check(pipeline: &str) -> Result<()> {
    let resolved = load_resolved_config()?;
    let ctx = bootstrap(&resolved)?;

    let verdict = ctx.dispatcher.check(pipeline).await;
    ctx.pool.shutdown().await;
    let verdict = verdict?;

    println!();
    if verdict.services.is_empty() {
        println!("  Pipeline '{pipeline}' has no service dependencies.");
    } else {
        for (name, status) in &verdict.services {
            println!("  {name:<20} {status}");
        }
        println!("  Probed for {:.1}s", verdict.elapsed.as_secs_f64());
    }
    println!();

    if !verdict.healthy {
        return Err(PipehubError::DependencyNotReady {
            services: verdict.services,
        }
        .into());
    }
    Ok(())
}

async fn cmd_list() -> Result<()> {
    let resolved = load_resolved_config()?;

    println!();
    println!("  Pipelines:");
    for pipeline in &resolved.pipelines {
        let requires: Vec<&str> = pipeline.requires.iter().map(|t| t.name.as_str()).collect();
        println!(
            "    {:<12} tasks: {}  requires: {}",
            pipeline.name,
            pipeline.tasks.join(" → "),
            if requires.is_empty() {
                "-".to_string()
            } else {
                requires.join(", ")
            }
        );
    }

    println!();
    println!("  Tasks:");
    for task in &resolved.tasks {
        println!("    {:<12} {} {}", task.name, task.command, task.args.join(" "));
    }

    println!();
    println!("  Services:");
    let mut services: Vec<_> = resolved.services.values().collect();
    services.sort_by(|a, b| a.name.cmp(&b.name));
    for service in services {
        println!("    {:<12} {}", service.name, service.url);
    }
    println!();

    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Created default config at {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| PipehubError::config(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn clear(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn task_started(&self, task: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Running [{current}/{total}] {task}"));
    }

    fn task_finished(&self, result: &TaskResult, current: usize, total: usize) {
        self.spinner.set_message(format!(
            "Finished [{current}/{total}] {} ({})",
            result.task, result.status
        ));
    }

    fn done(&self, _outcome: &PipelineOutcome) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_directives_cover_library_crates() {
        let directives = default_directives(0);
        assert!(directives.contains("pipehub=info"));
        assert!(directives.contains("pipehub_worker=info"));
        assert!(directives.contains("pipehub_probe=info"));

        let verbose = default_directives(2);
        assert!(verbose.contains("pipehub_queue=trace"));
    }
}
