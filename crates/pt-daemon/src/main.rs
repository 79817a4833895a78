//! persistty daemon: relays WebSocket clients into long-lived tmux sessions.

use anyhow::{Context, Result};
use pt_core::config::{Config, CredentialProvider};
use pt_daemon::daemon::Daemon;
use pt_telemetry::logging::{self, LogFormat};
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Optional; never overrides variables that are already set.
    let dotenv_path = dotenv::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;
    let format = config.general.log_format.parse::<LogFormat>();
    logging::init(
        format.clone().unwrap_or_default(),
        "persistty",
        &config.general.log_level,
    );
    if let Err(e) = format {
        warn!("{e}, falling back to text logs");
    }
    if let Some(path) = dotenv_path {
        info!(path = %path.display(), "loaded environment file");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "persistty daemon starting"
    );

    let token = CredentialProvider::ensure_auth_token(&config.security)
        .context("failed to resolve the relay auth token")?;
    info!(env_var = %config.security.auth_token_env, "auth token ready, authentication enabled");

    let daemon = Daemon::new(config, &token);
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
