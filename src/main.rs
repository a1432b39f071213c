use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use zeus::logging::{init_logging, starting_banner, LogLevel};
use zeus::master::{
    ClientListener, FileMonitor, MasterConfig, SlaveMonitor, Supervisor, CONFIG_FILE, SOCKET_NAME,
};
use zeus::signal::InterruptListener;

/// Preloads an application in slave processes and forks commands from them
#[derive(Debug, Parser)]
#[command(name = "zeus", version, about)]
struct Cli {
    /// Path to the process plan
    #[arg(long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Path of the client socket
    #[arg(long, default_value = SOCKET_NAME)]
    socket: PathBuf,

    /// Disable colored log output
    #[arg(long)]
    no_color: bool,

    /// Log level (overrides ZEUS_LOG)
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() {
    let cli = Cli::parse();

    let log = match init_logging(cli.log_level, !cli.no_color) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("zeus: failed to initialise logging: {:#}", e);
            std::process::exit(1);
        }
    };

    match run(cli, move || log.suppress()) {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli, suppress_logging: impl FnOnce() + Send + 'static) -> Result<i32> {
    println!("{}", starting_banner(!cli.no_color));

    let config = MasterConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let tree = Arc::new(config.tree);

    let listener = ClientListener::bind(&cli.socket, Arc::clone(&tree))?;
    let slaves = SlaveMonitor::new(Arc::clone(&tree), config.command);
    let root = std::env::current_dir().context("failed to read working directory")?;
    let files = FileMonitor::new(root, &config.ignore, |changed| {
        for path in changed {
            info!(path = %path.display(), "file changed");
        }
    })?;

    let supervisor = Supervisor::new()
        .with_subsystem(slaves)
        .with_subsystem(listener)
        .with_subsystem(files)
        .on_shutdown(suppress_logging);

    let interrupts = InterruptListener::spawn(supervisor.exit_handle())?;
    let status = supervisor.run();
    interrupts.close();

    Ok(status)
}
