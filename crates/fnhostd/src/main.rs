//! fnhostd — the function host daemon.
//!
//! Assembles the host subsystems in one process:
//! - CPU sampler for the host process
//! - Health monitor (sandbox counters + host/worker CPU)
//! - Lifecycle controller driving a process-backed runtime
//! - Health-check loop, config hot reload, standby specialization
//! - Supervisor that restarts an offline host with backoff
//!
//! # Usage
//!
//! ```text
//! fnhostd run --config /etc/fnhost/host.toml
//! fnhostd config --config /etc/fnhost/host.toml
//! ```
//!
//! Signals (unix): SIGHUP reloads the configuration, SIGUSR1 specializes a
//! standby host, SIGINT/SIGTERM shut down.

mod process_host;
mod reload;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use fnhost_core::{Environment, SystemEnvironment};
use fnhost_health::{HealthMonitor, ProcessSampler, WorkerStatusSlot};
use fnhost_lifecycle::{AppIdentityCache, LifecycleController, LifecycleDeps, StandbyState};

use crate::process_host::ProcessHostBuilder;
use crate::reload::ConfigChannels;

#[derive(Parser)]
#[command(name = "fnhostd", about = "Function host daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the host until interrupted.
    Run {
        /// Path to host.toml. Defaults apply when omitted.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration as JSON and exit.
    Config {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => run(config).await,
        Command::Config { config } => {
            let config = reload::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fnhostd=debug,fnhost=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = reload::load(config_path.as_deref())?;
    info!(
        workers = config.workers.len(),
        health_enabled = config.health.enabled,
        unhealthy_action = ?config.lifecycle.unhealthy_action,
        "fnhost daemon starting"
    );

    let env: Arc<dyn Environment> = Arc::new(SystemEnvironment::new());
    let channels = Arc::new(ConfigChannels::new(config.clone()));

    // ── Subsystems ─────────────────────────────────────────────

    let sampler = Arc::new(ProcessSampler::for_current_process(&config.sampler));
    sampler.start();

    let workers = WorkerStatusSlot::new();
    let monitor = HealthMonitor::new(env.clone(), channels.health(), sampler.clone(), workers.clone());

    let controller = LifecycleController::new(LifecycleDeps {
        builder: Arc::new(ProcessHostBuilder::new(channels.config())),
        probe: Some(Arc::new(monitor)),
        workers,
        standby: StandbyState::from_env(env.clone()),
        health_options: channels.health(),
        lifecycle_options: channels.lifecycle(),
    });

    let identity = Arc::new(AppIdentityCache::new(env.clone(), controller.subscribe_specialization()));
    let app = identity.get();
    info!(
        site = ?app.site_name,
        slot = ?app.slot_name,
        in_standby = controller.in_standby(),
        "host identity"
    );

    // ── Background tasks ───────────────────────────────────────

    let health_handle = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run_health_checks().await }
    });

    let signal_handle = tokio::spawn(handle_signals(
        config_path,
        channels.clone(),
        controller.clone(),
        identity.clone(),
    ));

    let supervisor_handle = tokio::spawn(supervisor::keep_host_running(controller.clone()));

    // ── Wait for shutdown ──────────────────────────────────────

    let shutdown = controller.shutdown_token();
    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        _ = shutdown.cancelled() => warn!("host initiated shutdown"),
    }
    controller.shutdown().await?;

    sampler.stop();
    let _ = supervisor_handle.await;
    let _ = health_handle.await;
    let _ = signal_handle.await;

    info!(status = ?controller.status(), "fnhost daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn handle_signals(
    config_path: Option<PathBuf>,
    channels: Arc<ConfigChannels>,
    controller: LifecycleController,
    identity: Arc<AppIdentityCache>,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut hangup, mut user1) = match (signal(SignalKind::hangup()), signal(SignalKind::user_defined1())) {
        (Ok(hangup), Ok(user1)) => (hangup, user1),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "failed to install signal handlers, reload and specialization disabled");
            return;
        }
    };
    let shutdown = controller.shutdown_token();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload::reload(config_path.as_ref(), &channels, &controller).await;
            }
            _ = user1.recv() => {
                match controller.specialize().await {
                    Ok(true) => {
                        let app = identity.get();
                        info!(site = ?app.site_name, slot = ?app.slot_name, "host specialized");
                    }
                    Ok(false) => debug!("specialization requested, host is not in standby"),
                    Err(e) => warn!(error = %e, "specialization failed"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn handle_signals(
    _config_path: Option<PathBuf>,
    _channels: Arc<ConfigChannels>,
    controller: LifecycleController,
    _identity: Arc<AppIdentityCache>,
) {
    controller.shutdown_token().cancelled().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => ctrl_c.await,
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
