//! Lifecycle commands against the tmux server.
//!
//! Every command addresses its session with an exact-match target
//! (`=name` for sessions, `=name:` for the active pane). A bare `-t name`
//! lets tmux fall back to prefix matching, so `abc` could silently hit
//! `abc-1`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pt_core::config::TmuxConfig;
use pt_core::env::sanitized_host_env;
use pt_core::naming::SessionName;
use thiserror::Error;
use tracing::{debug, info, warn};

const LIST_FORMAT: &str =
    "#{session_name}|#{session_created}|#{session_attached}|#{session_activity}";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("failed to run tmux: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("tmux {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("tmux {command} failed: {stderr}")]
    Failed { command: String, stderr: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("no active pane in session {0}")]
    NoPane(String),
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

/// Raw result of one tmux invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs one tmux command. `args` excludes the binary and socket flags.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<CommandOutput, TmuxError>;
}

/// Runs the real tmux binary with a bounded wait and a sanitized
/// environment (the first command may start the server, whose environment
/// every shell then inherits).
#[derive(Debug, Clone)]
pub struct TmuxRunner {
    binary: String,
    socket_name: Option<String>,
    timeout: Duration,
    env: Vec<(String, String)>,
}

impl TmuxRunner {
    pub fn new(binary: impl Into<String>, socket_name: Option<String>, timeout: Duration) -> Self {
        let mut env = sanitized_host_env();
        env.retain(|(k, _)| k != "TERM");
        env.push(("TERM".into(), "xterm-256color".into()));
        Self {
            binary: binary.into(),
            socket_name,
            timeout,
            env,
        }
    }

    pub fn from_config(cfg: &TmuxConfig) -> Self {
        Self::new(
            cfg.binary.clone(),
            cfg.socket_name.clone(),
            Duration::from_secs(cfg.command_timeout_secs),
        )
    }
}

#[async_trait]
impl CommandRunner for TmuxRunner {
    async fn run(&self, args: &[String]) -> Result<CommandOutput, TmuxError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        if let Some(socket) = &self.socket_name {
            cmd.arg("-L").arg(socket);
        }
        cmd.args(args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TmuxError::Timeout {
                    command: subcommand(args),
                    timeout: self.timeout,
                })
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// The subcommand an invocation is named after: the last one of a
/// `;`-separated command list.
fn subcommand(args: &[String]) -> String {
    args.rsplit(|a| a == ";")
        .next()
        .and_then(|command| command.first())
        .cloned()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// SessionInfo
// ---------------------------------------------------------------------------

/// One session as reported by `list-sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: SessionName,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Number of tmux clients attached right now.
    pub attached_clients: u32,
}

impl SessionInfo {
    /// The caller-chosen id, `None` for a bare-prefix session.
    pub fn session_id(&self) -> Option<&str> {
        self.name.session_id()
    }
}

/// Parse `list-sessions` output produced with [`LIST_FORMAT`]. Sessions not
/// named by this crate's namer, and malformed lines, are skipped.
pub fn parse_session_list(stdout: &str) -> Vec<SessionInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('|');
            let name = SessionName::parse(fields.next()?)?;
            let created = fields.next()?.parse::<i64>().ok()?;
            let attached = fields.next()?.parse::<u32>().unwrap_or(0);
            let activity = fields.next().and_then(|v| v.parse::<i64>().ok());
            let created_at = DateTime::from_timestamp(created, 0)?;
            let last_activity = activity
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
                .unwrap_or(created_at);
            Some(SessionInfo {
                name,
                created_at,
                last_activity,
                attached_clients: attached,
            })
        })
        .collect()
}

/// Whether `name` belongs to `prefix`: either the bare prefix itself or
/// `prefix-<id>`. The separator check keeps a prefix that happens to be a
/// string-prefix of another tenant's prefix from matching its sessions.
pub fn belongs_to_prefix(name: &SessionName, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match name.as_str().strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('-'),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// TmuxController
// ---------------------------------------------------------------------------

/// Issues lifecycle commands for named sessions.
#[derive(Clone)]
pub struct TmuxController {
    runner: Arc<dyn CommandRunner>,
    history_limit: u32,
}

impl TmuxController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            history_limit: TmuxConfig::default().history_limit,
        }
    }

    pub fn with_history_limit(mut self, lines: u32) -> Self {
        self.history_limit = lines;
        self
    }

    /// Controller backed by the real tmux binary.
    pub fn from_config(cfg: &TmuxConfig) -> Self {
        Self::new(Arc::new(TmuxRunner::from_config(cfg))).with_history_limit(cfg.history_limit)
    }

    /// Run a command, turning a non-zero exit into [`TmuxError::Failed`].
    async fn exec(&self, args: Vec<String>) -> Result<CommandOutput, TmuxError> {
        let output = self.runner.run(&args).await?;
        if output.success {
            Ok(output)
        } else {
            Err(TmuxError::Failed {
                command: subcommand(&args),
                stderr: output.stderr,
            })
        }
    }

    /// Whether the session exists. Any probe failure counts as "no".
    pub async fn has_session(&self, name: &SessionName) -> bool {
        match self.exec(args(["has-session", "-t", &session_target(name)])).await {
            Ok(_) => true,
            Err(e) => {
                debug!(session = %name, "has-session: {e}");
                false
            }
        }
    }

    /// Create a detached session, then apply the standard options.
    ///
    /// `history-limit` only reaches panes created after it is set, so it is
    /// set server-wide in the same invocation, ahead of `new-session`.
    /// Callers check [`has_session`](Self::has_session) first; creating an
    /// existing session fails. Failures of the remaining options are logged,
    /// never returned.
    pub async fn create_session(
        &self,
        name: &SessionName,
        cols: u16,
        rows: u16,
        workdir: &Path,
    ) -> Result<(), TmuxError> {
        self.exec(args([
            "set-option",
            "-g",
            "history-limit",
            &self.history_limit.to_string(),
            ";",
            "new-session",
            "-d",
            "-s",
            name.as_str(),
            "-x",
            &cols.to_string(),
            "-y",
            &rows.to_string(),
            "-c",
            &workdir.to_string_lossy(),
        ]))
        .await?;
        info!(session = %name, cols, rows, workdir = %workdir.display(), "tmux session created");

        for option in ["status", "mouse"] {
            if let Err(e) = self.set_option(name, option, "off").await {
                warn!(session = %name, option, "failed to configure tmux session: {e}");
            }
        }
        Ok(())
    }

    async fn set_option(&self, name: &SessionName, option: &str, value: &str) -> Result<(), TmuxError> {
        self.exec(args(["set-option", "-t", &session_target(name), option, value]))
            .await
            .map(|_| ())
    }

    /// Resize the session's window. Best-effort: tmux rejects some no-op
    /// resizes, so callers usually log and drop the error.
    pub async fn resize_session(&self, name: &SessionName, cols: u16, rows: u16) -> Result<(), TmuxError> {
        self.exec(args([
            "resize-window",
            "-t",
            &pane_target(name),
            "-x",
            &cols.to_string(),
            "-y",
            &rows.to_string(),
        ]))
        .await
        .map(|_| ())
    }

    /// Kill the session. A missing session (or server) is not an error;
    /// only a failure to run tmux at all is.
    pub async fn kill_session(&self, name: &SessionName) -> Result<(), TmuxError> {
        let output = self
            .runner
            .run(&args(["kill-session", "-t", &session_target(name)]))
            .await?;
        if output.success {
            info!(session = %name, "tmux session killed");
        } else {
            debug!(session = %name, stderr = %output.stderr, "kill-session: session already gone");
        }
        Ok(())
    }

    /// Every session on the server that this crate could have named.
    /// A failed listing (typically "no server running") yields nothing.
    pub async fn list_all_sessions(&self) -> Vec<SessionInfo> {
        match self.exec(args(["list-sessions", "-F", LIST_FORMAT])).await {
            Ok(output) => parse_session_list(&output.stdout),
            Err(e) => {
                debug!("list-sessions: {e}");
                Vec::new()
            }
        }
    }

    /// Sessions under `prefix` (see [`belongs_to_prefix`]).
    pub async fn list_sessions(&self, prefix: &str) -> Vec<SessionInfo> {
        self.list_all_sessions()
            .await
            .into_iter()
            .filter(|info| belongs_to_prefix(&info.name, prefix))
            .collect()
    }

    /// Rendered contents of the active pane, escape codes included, for the
    /// last `max_lines` lines of history plus the visible screen.
    ///
    /// Reads whatever screen is current and never toggles alternate-screen
    /// mode. Lines are CRLF-joined so the text can be written straight into a
    /// terminal emulator.
    pub async fn capture_scrollback(&self, name: &SessionName, max_lines: u32) -> Result<String, TmuxError> {
        let output = self
            .query(
                name,
                args([
                    "capture-pane",
                    "-p",
                    "-e",
                    "-t",
                    &pane_target(name),
                    "-S",
                    &format!("-{max_lines}"),
                ]),
            )
            .await?;
        let text = output.stdout.trim_end_matches('\n');
        Ok(text.split('\n').collect::<Vec<_>>().join("\r\n"))
    }

    /// Current directory of the active pane.
    pub async fn working_directory(&self, name: &SessionName) -> Result<PathBuf, TmuxError> {
        self.display(name, "#{pane_current_path}").await.map(PathBuf::from)
    }

    /// Command running in the foreground of the active pane.
    pub async fn foreground_command(&self, name: &SessionName) -> Result<String, TmuxError> {
        self.display(name, "#{pane_current_command}").await
    }

    async fn display(&self, name: &SessionName, format: &str) -> Result<String, TmuxError> {
        let output = self
            .query(name, args(["display-message", "-p", "-t", &pane_target(name), format]))
            .await?;
        let value = output.stdout.trim();
        if value.is_empty() {
            Err(TmuxError::NoPane(name.to_string()))
        } else {
            Ok(value.to_string())
        }
    }

    /// Single-session query: a non-zero exit means the session is absent.
    async fn query(&self, name: &SessionName, args: Vec<String>) -> Result<CommandOutput, TmuxError> {
        let output = self.runner.run(&args).await?;
        if output.success {
            Ok(output)
        } else {
            debug!(session = %name, command = %subcommand(&args), stderr = %output.stderr, "tmux query failed");
            Err(TmuxError::SessionNotFound(name.to_string()))
        }
    }
}

impl std::fmt::Debug for TmuxController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmuxController")
            .field("history_limit", &self.history_limit)
            .finish()
    }
}

/// Exact-match session target.
pub fn session_target(name: &SessionName) -> String {
    format!("={name}")
}

/// Active pane of the exact-match session.
pub fn pane_target(name: &SessionName) -> String {
    format!("={name}:")
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
