//! Attaching a PTY to a named tmux session.

use pt_core::config::TmuxConfig;
use pt_core::env::sanitized_host_env;
use pt_core::naming::SessionName;
use tracing::info;

use crate::bridge::{BridgeCommand, PtyBridge, Result};

/// Produces a [`PtyBridge`] attached to a named session.
pub trait Attacher: Send + Sync {
    fn attach(&self, name: &SessionName, cols: u16, rows: u16) -> Result<PtyBridge>;
}

/// Attaches by running `tmux attach-session` inside a fresh PTY.
#[derive(Debug, Clone)]
pub struct TmuxAttacher {
    binary: String,
    socket_name: Option<String>,
}

impl TmuxAttacher {
    pub fn new(binary: impl Into<String>, socket_name: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            socket_name,
        }
    }

    pub fn from_config(cfg: &TmuxConfig) -> Self {
        Self::new(cfg.binary.clone(), cfg.socket_name.clone())
    }

    /// The subprocess used to attach to `name`, with a sanitized environment.
    pub fn command_for(&self, name: &SessionName) -> BridgeCommand {
        let mut cmd = BridgeCommand::new(&self.binary);
        if let Some(socket) = &self.socket_name {
            cmd = cmd.args(["-L", socket.as_str()]);
        }
        cmd.args(["attach-session", "-t"])
            .arg(format!("={name}"))
            .env(sanitized_host_env())
    }
}

impl Attacher for TmuxAttacher {
    fn attach(&self, name: &SessionName, cols: u16, rows: u16) -> Result<PtyBridge> {
        let bridge = PtyBridge::spawn(self.command_for(name), cols, rows)?;
        info!(session = %name, bridge = %bridge.id(), cols, rows, "attached to tmux session");
        Ok(bridge)
    }
}
