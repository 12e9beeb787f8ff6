//! Binary entrypoint for the Retrobadge console.
//!
//! Commands:
//! - `run [--port <path>]` - attach to the node and start the terminal console
//! - `history [--limit N]` - print stored history and exit
//! - `init` - write a starter `retrobadge.toml`
//!
//! See the library crate docs for module-level details: `retrobadge::`.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use retrobadge::config::Config;
use retrobadge::console::{format_row, run_terminal, Console};
use retrobadge::context::{Context, Shutdown};
use retrobadge::feed::HistoryFeed;
use retrobadge::ingest::IngestPipeline;
use retrobadge::link::{Supervisor, SupervisorConfig};
use retrobadge::meshtastic::SerialConnector;
use retrobadge::metrics;
use retrobadge::storage::Store;

const CONSOLE_TICK: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "retrobadge")]
#[command(about = "A resilient terminal console for a Meshtastic node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "retrobadge.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to the node and start the console
    Run {
        /// Device path (e.g., /dev/rfcomm0 or /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Print the stored message history
    History {
        /// Number of most recent messages to print
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Write a default configuration file
    Init,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async_main(cli));
    // A pending stdin read holds a blocking thread; don't wait on it at exit.
    runtime.shutdown_timeout(Duration::from_millis(200));
    result
}

async fn async_main(cli: Cli) -> Result<()> {
    if let Commands::Init = cli.command {
        init_logging(None, cli.verbose);
        if Path::new(&cli.config).exists() {
            bail!("{} already exists; refusing to overwrite", cli.config);
        }
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let (mut config, from_file) = match Config::load(&cli.config).await {
        Ok(cfg) => (cfg, true),
        Err(_) if !Path::new(&cli.config).exists() => (Config::default(), false),
        Err(e) => return Err(e),
    };
    config.apply_env_overrides(std::env::vars())?;
    init_logging(Some(&config), cli.verbose);
    if !from_file {
        info!("No config file at {}; using defaults", cli.config);
    }

    match cli.command {
        Commands::Run { port } => {
            if let Some(port) = port {
                config.link.port = port;
            }
            config.validate()?;
            run_console(config).await
        }
        Commands::History { limit } => {
            config.validate()?;
            let store = Store::open_reader(config.storage.resolved_data_dir()?)?;
            for msg in store.load_recent(limit)? {
                println!("{}", format_row(&msg));
            }
            Ok(())
        }
        Commands::Init => Ok(()),
    }
}

async fn run_console(config: Config) -> Result<()> {
    info!("Starting Retrobadge v{}", env!("CARGO_PKG_VERSION"));
    let data_dir = config.storage.resolved_data_dir()?;
    let store = Arc::new(Store::open(&data_dir, config.storage.raw_log)?);
    info!("Message store at {}", store.root().display());

    let max_len = config.storage.max_message_len;
    let ctx = Context::new(store.clone());
    let ch = Context::channels(&config.queues);
    let history = HistoryFeed::load(&store, config.storage.replay_limit, ch.inbox);
    info!("Replayed {} stored messages", history.len());

    let ingest = IngestPipeline::new(store.clone(), ch.inbox_tx, max_len);
    let ingest_task = tokio::spawn(ingest.run(ch.packets_rx, ctx.shutdown.clone()));

    let connector = SerialConnector::new(config.link.baud_rate, config.link.auto_scan);
    let supervisor = Supervisor::new(
        connector,
        SupervisorConfig::from_config(&config),
        &ctx,
        ch.outbox,
        ch.packets_tx,
    );
    let supervisor_task = tokio::spawn(supervisor.run());
    tokio::spawn(shutdown_on_signal(ctx.shutdown.clone()));

    let console = Console::new(history, ch.dispatch, &ctx, max_len);
    let front_end = run_terminal(console, ctx.shutdown.clone(), CONSOLE_TICK).await;
    ctx.shutdown.trigger();

    for (name, task) in [("supervisor", supervisor_task), ("ingest", ingest_task)] {
        match tokio::time::timeout(JOIN_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} task failed: {}", name, e),
            Err(_) => warn!("{} task did not stop within {:?}", name, JOIN_TIMEOUT),
        }
    }
    info!("{}", metrics::snapshot());
    front_end?;
    Ok(())
}

async fn shutdown_on_signal(shutdown: Shutdown) {
    tokio::select! {
        _ = wait_for_signal() => {
            info!("Signal received; shutting down");
            shutdown.trigger();
        }
        _ = shutdown.wait() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let level = match verbosity {
        0 => config
            .map(|c| c.logging.level_filter())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);
    builder.target(env_logger::Target::Stderr);

    let file = config
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    match file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // The console owns the terminal; mirror to stderr only when it is redirected.
            let mirror = !atty::is(atty::Stream::Stderr);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if mirror {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
