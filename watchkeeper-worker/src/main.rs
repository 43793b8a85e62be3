mod env;
mod events;
mod failsafe;
mod notify;
mod probe;
mod retry;
mod runner;

use clap::Parser;
use std::time::Duration;
use tokio::sync::mpsc;

/// Reference worker: runs a probe command in a loop, reports records over
/// Telegram, honours SIGUSR1 failsafe resets and exits on its own once the
/// session plus failsafe buffer has elapsed.
#[derive(Parser, Debug)]
#[command(name = "watchkeeper-worker", version, about)]
struct Cli {
    /// Pause between probe iterations, in milliseconds
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Probe attempts per iteration before giving up on it
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Pause between failed attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    retry_delay_ms: u64,

    /// Probe command and its arguments (after `--`)
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    probe: Vec<String>,
}

#[tokio::main]
async fn main() {
    // First, so a reset or stop arriving during startup is queued instead of
    // hitting the default signal action.
    let (tx, rx) = mpsc::channel(16);
    let listener = events::spawn_signal_listener(tx);

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("watchkeeper_worker=info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = listener {
        tracing::error!(error = %e, "failed to install signal handlers");
        std::process::exit(1);
    }

    let env = match env::WorkerEnv::from_process_env() {
        Ok(env) => env,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    let Some(probe) = probe::CommandProbe::new(&cli.probe) else {
        tracing::error!("no probe command given");
        std::process::exit(1);
    };

    let failsafe = failsafe::Failsafe::new(env.max_runtime());
    tracing::info!(
        email = %env.email,
        max_runtime_secs = failsafe.max_runtime().as_secs(),
        telegram = env.telegram_enabled(),
        probe = ?cli.probe,
        "worker started"
    );

    let runner = runner::Runner::new(
        Box::new(probe),
        Box::new(notify::Telegram::from_env(&env)),
        rx,
        failsafe,
        runner::LoopSettings {
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            max_attempts: cli.max_attempts,
            retry_delay: Duration::from_millis(cli.retry_delay_ms),
        },
    );
    let outcome = runner.run().await;
    tracing::info!(?outcome, "worker exiting");
    std::process::exit(outcome.exit_code());
}
