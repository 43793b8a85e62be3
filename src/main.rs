mod config;
mod notify;
mod serve;
mod signals;
mod status;
mod supervisor;
mod timer;
mod worker;

use clap::Parser;
use std::path::PathBuf;
use supervisor::{Supervisor, SupervisorSettings};

/// Control plane that supervises a single worker process: start it on
/// request, count down its session, warn before expiry, and kill its whole
/// process group when the session ends or notifications fail.
#[derive(Parser, Debug)]
#[command(name = "watchkeeper", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "watchkeeper.toml")]
    config: PathBuf,

    /// Bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Session duration in seconds (overrides config)
    #[arg(long)]
    timer_duration: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (watchdog ticks, signal delivery)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "watchkeeper=debug,worker=info,tower_http=debug"
    } else {
        "watchkeeper=info,worker=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(duration) = cli.timer_duration {
        config.timer.duration_secs = duration;
    }
    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        std::process::exit(1);
    }

    if cli.dry_run {
        print_resolved(&config);
        return;
    }

    let notifier = notify::from_config(&config.notify);
    tracing::info!(channel = notifier.name(), "notification channel ready");
    let supervisor = Supervisor::new(SupervisorSettings::from_config(&config), notifier);

    tokio::select! {
        result = serve::run(&config.server, std::sync::Arc::clone(&supervisor)) => {
            if let Err(e) = result {
                tracing::error!("control API failed: {e}");
                std::process::exit(1);
            }
        }
        _ = signals::shutdown_signal() => {
            supervisor.announce_shutdown().await;
        }
    }
}

fn print_resolved(config: &config::WatchkeeperConfig) {
    println!("watchkeeper v{}", env!("CARGO_PKG_VERSION"));
    println!("listen:        {}:{}", config.server.bind, config.server.port);
    println!(
        "worker:        {} {}",
        config.worker.command,
        config.worker.args.join(" ")
    );
    if let Some(dir) = &config.worker.working_dir {
        println!("working dir:   {}", dir.display());
    }
    println!(
        "timer:         {} (warning at {}, worker failsafe +{})",
        timer::format_hms(config.timer.duration_secs),
        timer::format_hms(config.timer.warning_secs),
        timer::format_hms(config.timer.failsafe_buffer_secs)
    );
    println!("stop grace:    {}s", config.stop.grace_period_secs);
    println!(
        "notifications: {}",
        if config.notify.is_enabled() {
            "telegram"
        } else {
            "disabled (sessions will be refused)"
        }
    );
}
