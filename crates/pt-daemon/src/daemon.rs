use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use pt_bridge::http_api::{api_router, ApiState};
use pt_core::config::Config;

use crate::reaper::StaleSessionReaper;
use crate::shutdown::ShutdownSignal;

/// The persistty relay daemon.
///
/// Serves the relay WebSocket and the session API, and runs the stale
/// session reaper on its own interval. Shuts down gracefully when the
/// `ShutdownSignal` is triggered: live relay connections detach with close
/// code 1001, the HTTP server drains, the reaper stops. tmux sessions are
/// left running.
pub struct Daemon {
    config: Config,
    api_state: Arc<ApiState>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Create a daemon backed by the real tmux binary.
    pub fn new(config: Config, auth_token: &str) -> Self {
        let api_state = Arc::new(ApiState::new(config.clone(), auth_token));
        Self::with_state(config, api_state)
    }

    /// Create a daemon around prepared API state.
    pub fn with_state(config: Config, api_state: Arc<ApiState>) -> Self {
        Self {
            config,
            api_state,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind to the configured address and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Run using a pre-bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        let router = api_router(self.api_state.clone());

        let reaper_handle = if self.config.reaper.enabled {
            Some(self.spawn_reaper())
        } else {
            info!("stale session reaper disabled");
            None
        };

        let shutdown = self.shutdown.clone();
        let api_state = self.api_state.clone();
        let graceful = async move {
            shutdown.wait().await;
            info!("shutdown signal received, detaching relay connections");
            api_state.begin_shutdown();
        };

        info!(%bind_addr, "relay listening");
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await;

        // The server also returns on an accept error; stop the reaper then too.
        if !self.shutdown.is_shutting_down() {
            self.shutdown.trigger();
        }
        if let Some(handle) = reaper_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "reaper task failed");
            }
        }
        served.context("relay server error")?;
        info!("daemon stopped");
        Ok(())
    }

    fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let reaper = StaleSessionReaper::new(
            self.api_state.tmux.clone(),
            self.api_state.registry.clone(),
            Duration::from_secs(self.config.reaper.session_ttl_secs),
        );
        let interval = Duration::from_secs(self.config.reaper.sweep_interval_secs);
        let shutdown = self.shutdown.clone();
        info!(
            ttl_secs = self.config.reaper.session_ttl_secs,
            sweep_secs = self.config.reaper.sweep_interval_secs,
            "stale session reaper started"
        );
        tokio::spawn(run_reaper(reaper, interval, shutdown))
    }
}

/// Sweep every `interval` until shutdown. The first sweep runs one interval
/// after start.
pub async fn run_reaper(reaper: StaleSessionReaper, interval: Duration, shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut shutdown_rx = shutdown.subscribe();
    if shutdown.is_shutting_down() {
        return;
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = reaper.sweep().await;
                if !report.reaped.is_empty() || report.failed > 0 {
                    info!(
                        examined = report.examined,
                        reaped = report.reaped.len(),
                        failed = report.failed,
                        "reaper sweep"
                    );
                }
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received, stopping reaper");
                break;
            }
        }
    }
}
