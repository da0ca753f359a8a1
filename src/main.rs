//! `oman-launcher` entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use oman_launcher::{
    commands, logging, AppError, ConfigStore, InstanceLock, LauncherPaths, Orchestrator, Result,
};

#[derive(Debug, Parser)]
#[command(
    name = "oman-launcher",
    version,
    about = "Installs, updates and runs Oman Swiss Army Tool"
)]
struct Cli {
    /// Directory holding the install, settings, lock and log files
    #[arg(long, global = true, env = "OMAN_LAUNCHER_HOME")]
    base_dir: Option<PathBuf>,

    /// Log level for launcher.log (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: log::LevelFilter,

    /// Echo log lines to stdout
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install or update, start the application and keep checking hourly
    Run,
    /// Compare the installed version with the latest release
    Check,
    /// Download and deploy the latest release
    Update {
        /// Reinstall even when already up to date
        #[arg(long)]
        force: bool,
    },
    /// Start the application
    Start,
    /// Stop the application
    Stop,
    /// Show what the launcher knows
    Status,
}

impl Command {
    /// Read-only commands can run next to another launcher.
    fn needs_lock(&self) -> bool {
        !matches!(self, Self::Check | Self::Status)
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn dispatch(orchestrator: &Orchestrator, command: Command) -> Result<()> {
    match command {
        // Runs until Ctrl-C on its own.
        Command::Run => commands::run(orchestrator, ctrl_c()).await,
        Command::Check => commands::check(orchestrator).await,
        Command::Update { force } => commands::update(orchestrator, force).await,
        Command::Start => commands::start(orchestrator).await,
        Command::Stop => commands::stop(orchestrator).await,
        Command::Status => commands::status(orchestrator).await,
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let base = match cli.base_dir {
        Some(dir) => dir,
        None => LauncherPaths::default_base()?,
    };
    let paths = LauncherPaths::from_base(base);
    paths.ensure_dirs()?;
    logging::init(&paths.log_file, cli.log_level, cli.verbose)?;
    log::info!("oman-launcher {} starting ({:?})", env!("CARGO_PKG_VERSION"), cli.command);

    let holds_lock = cli.command.needs_lock();
    let _guard = if holds_lock {
        Some(InstanceLock::new(&paths.lock_file).acquire_guard()?)
    } else {
        None
    };

    let config = ConfigStore::load(&paths)?;
    let orchestrator = Orchestrator::builder(paths, config).build()?;
    let observer = commands::spawn_console_observer(orchestrator.subscribe());

    let result = if matches!(cli.command, Command::Run) {
        dispatch(&orchestrator, cli.command).await
    } else {
        tokio::select! {
            result = dispatch(&orchestrator, cli.command) => result,
            () = ctrl_c() => {
                log::warn!("Interrupted");
                if holds_lock {
                    orchestrator.discard_partial_work();
                }
                Err(AppError::other("interrupted"))
            }
        }
    };

    drop(orchestrator);
    let _ = tokio::time::timeout(Duration::from_millis(300), observer).await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
