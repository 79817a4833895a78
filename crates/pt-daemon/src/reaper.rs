use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use pt_bridge::registry::ConnectionRegistry;
use pt_session::tmux::{SessionInfo, TmuxController};

/// Result of a single reaper sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ReapReport {
    /// Sessions on the server with names this relay could have produced.
    pub examined: usize,
    /// Sessions killed in this sweep.
    pub reaped: Vec<String>,
    /// Idle sessions spared because a connection or tmux client holds them.
    pub skipped_attached: usize,
    /// Kills that failed; retried on the next sweep.
    pub failed: usize,
    pub timestamp: DateTime<Utc>,
}

/// Periodic sweep that kills sessions idle longer than the time-to-live and
/// held by nobody.
pub struct StaleSessionReaper {
    tmux: TmuxController,
    registry: Arc<ConnectionRegistry>,
    ttl: chrono::Duration,
}

impl StaleSessionReaper {
    pub fn new(tmux: TmuxController, registry: Arc<ConnectionRegistry>, ttl: Duration) -> Self {
        Self {
            tmux,
            registry,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub async fn sweep(&self) -> ReapReport {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> ReapReport {
        let sessions = self.tmux.list_all_sessions().await;
        let mut report = ReapReport {
            examined: sessions.len(),
            reaped: Vec::new(),
            skipped_attached: 0,
            failed: 0,
            timestamp: now,
        };

        for info in &sessions {
            if !self.is_expired(info, now) {
                continue;
            }
            if self.is_held(info) {
                debug!(session = %info.name, "idle session is attached, sparing");
                report.skipped_attached += 1;
                continue;
            }
            let idle = now.signed_duration_since(info.last_activity);
            match self.tmux.kill_session(&info.name).await {
                Ok(()) => {
                    info!(session = %info.name, idle_secs = idle.num_seconds(), "reaped stale session");
                    report.reaped.push(info.name.to_string());
                }
                Err(e) => {
                    warn!(session = %info.name, "failed to reap session: {e}");
                    report.failed += 1;
                }
            }
        }

        debug!(
            examined = report.examined,
            reaped = report.reaped.len(),
            skipped_attached = report.skipped_attached,
            "reaper sweep completed"
        );
        report
    }

    fn is_expired(&self, info: &SessionInfo, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(info.last_activity) > self.ttl
    }

    fn is_held(&self, info: &SessionInfo) -> bool {
        self.registry.is_attached(&info.name) || info.attached_clients > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_session::tmux::parse_session_list;

    fn info(line: &str) -> SessionInfo {
        parse_session_list(line).remove(0)
    }

    #[test]
    fn expiry_uses_last_activity() {
        let reaper = StaleSessionReaper::new(
            TmuxController::new(Arc::new(pt_session::testing::FakeTmux::new())),
            Arc::new(ConnectionRegistry::new()),
            Duration::from_secs(100),
        );
        let now = DateTime::from_timestamp(10_000, 0).unwrap();

        // Created long ago but active recently.
        assert!(!reaper.is_expired(&info("0123456789abcdef-a|1000|0|9950"), now));
        // Both old.
        assert!(reaper.is_expired(&info("0123456789abcdef-a|1000|0|9800"), now));
        // No activity field: creation time counts.
        assert!(reaper.is_expired(&info("0123456789abcdef-a|1000|0"), now));
        // Exactly at the limit is not yet expired.
        assert!(!reaper.is_expired(&info("0123456789abcdef-a|9900|0|9900"), now));
    }
}
