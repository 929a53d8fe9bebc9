use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use doomlinux_builder::logs;
use doomlinux_builder::orchestrator::summary_path;
use doomlinux_builder::{
    validate, BuildConfig, BuildError, BuildMode, ConfigError, LintError, Orchestrator,
    SystemRunner, ValidationError, Workspace, WorkspaceError,
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "doomlinux", about = "DoomLinux ISO build pipeline")]
struct Cli {
    /// Workspace root holding rootfs/, staging/, iso/ and the image.
    #[arg(long, global = true, env = "DOOMLINUX_ROOT", default_value = ".")]
    root: PathBuf,

    /// Config file (default: <root>/DoomLinux.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Build mode; overrides DOOMLINUX_TEST_MODE.
    #[arg(long, global = true)]
    mode: Option<BuildMode>,

    /// Emit tracing events as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    /// Show stage-level tracing events.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reset the workspace and run every stage.
    Build,
    /// Remove every build artifact from the workspace.
    Clean,
    /// Check the layout a successful build leaves behind.
    Validate,
    /// Summary log tools.
    #[command(subcommand)]
    Logs(LogsCommand),
}

#[derive(Subcommand)]
enum LogsCommand {
    /// Render a summary as CSV and LaTeX next to it.
    Convert { summary: Option<PathBuf> },
    /// Check a summary for the required markers.
    Lint { log: Option<PathBuf> },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Tracing goes to stderr so stdout stays the progress lines. `RUST_LOG`
/// wins over `--verbose`.
fn init_tracing(cli: &Cli) {
    let level = if cli.verbose { Level::INFO } else { Level::WARN };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mode = cli.mode.unwrap_or_else(BuildMode::from_env);
    let config = load_config(cli)?;
    let ws = Workspace::new(&cli.root, config.image_filename());

    match &cli.command {
        Command::Build => build(ws, config, mode),
        Command::Clean => clean(&ws),
        Command::Validate => {
            validate(&ws, &config)
                .with_context(|| format!("validating workspace '{}'", ws.root().display()))?;
            println!("[doomlinux:{mode}] workspace '{}' is valid", ws.root().display());
            Ok(())
        }
        Command::Logs(LogsCommand::Convert { summary }) => {
            let summary = resolve_summary(summary.as_deref(), &ws, &config, mode);
            let converted = logs::convert(&summary)
                .with_context(|| format!("converting summary '{}'", summary.display()))?;
            println!(
                "[doomlinux:logs] {} row(s) -> {}, {}",
                converted.rows,
                converted.csv.display(),
                converted.tex.display()
            );
            Ok(())
        }
        Command::Logs(LogsCommand::Lint { log }) => {
            let log = resolve_summary(log.as_deref(), &ws, &config, mode);
            let report =
                logs::lint(&log).with_context(|| format!("linting log '{}'", log.display()))?;
            println!(
                "[doomlinux:logs] {} ok ({} event(s))",
                report.path.display(),
                report.events
            );
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<BuildConfig> {
    match &cli.config {
        Some(path) => BuildConfig::load_from(path)
            .with_context(|| format!("loading config '{}'", path.display())),
        None => BuildConfig::load(&cli.root)
            .with_context(|| format!("loading config from root '{}'", cli.root.display())),
    }
}

fn build(ws: Workspace, config: BuildConfig, mode: BuildMode) -> Result<()> {
    let _lock = ws
        .lock()
        .with_context(|| format!("locking workspace '{}'", ws.root().display()))?;
    let root = ws.root().display().to_string();
    println!("[doomlinux:{mode}] building {} in {root}", config.name);

    let runner = SystemRunner;
    let report = Orchestrator::new(ws, config, mode, &runner)
        .and_then(Orchestrator::run)
        .with_context(|| format!("{mode} build in '{root}'"))?;

    println!(
        "[doomlinux:{mode}] image {} ({} bytes, sha256 {})",
        report.image.path.display(),
        report.image.size_bytes,
        report.image.sha256
    );
    println!("[doomlinux:{mode}] summary {}", report.summary.display());
    println!("[doomlinux:{mode}] build log {}", report.build_log.display());
    Ok(())
}

fn clean(ws: &Workspace) -> Result<()> {
    let _lock = ws
        .lock()
        .with_context(|| format!("locking workspace '{}'", ws.root().display()))?;
    ws.reset()
        .with_context(|| format!("resetting workspace '{}'", ws.root().display()))?;
    println!("[doomlinux:clean] workspace '{}' reset", ws.root().display());
    Ok(())
}

fn resolve_summary(
    explicit: Option<&Path>,
    ws: &Workspace,
    config: &BuildConfig,
    mode: BuildMode,
) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| summary_path(ws, config, mode))
}

/// Exit code for the error at the root of `err`.
fn exit_code(err: &anyhow::Error) -> u8 {
    let code = if let Some(build) = err.downcast_ref::<BuildError>() {
        build.exit_code()
    } else if err.downcast_ref::<WorkspaceError>().is_some() {
        3
    } else if err.downcast_ref::<LintError>().is_some() {
        20
    } else if err.downcast_ref::<ValidationError>().is_some() {
        21
    } else if err.downcast_ref::<ConfigError>().is_some() {
        2
    } else {
        1
    };
    u8::try_from(code).unwrap_or(1)
}
