use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Env var that, when set, points at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "PERSISTTY_CONFIG";

/// Top-level configuration loaded from `~/.persistty/config.toml`.
///
/// **Security**: the shared secret is NEVER stored here. Only the *name* of
/// the env var holding it lives in [`SecurityConfig`]; the value is resolved
/// at runtime by [`CredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl Config {
    /// Load config from `$PERSISTTY_CONFIG` or `~/.persistty/config.toml`,
    /// falling back to defaults when neither file exists.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path);
        if path.exists() {
            Self::load_from(path)
        } else {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tmux.validate()?;
        self.relay.validate()?;
        self.reaper.validate()?;
        Ok(())
    }

    fn default_path() -> PathBuf {
        data_dir().join("config.toml")
    }
}

/// `~/.persistty`, or `./.persistty` when no home directory is known.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".persistty")
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `"text"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
        }
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    7681
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Name of the env var holding the shared secret.
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    /// Origins allowed to open the relay WebSocket. Empty allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            auth_token_env: default_auth_token_env(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_auth_token_env() -> String {
    "PERSISTTY_AUTH_TOKEN".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmuxConfig {
    #[serde(default = "default_tmux_binary")]
    pub binary: String,
    /// Dedicated server socket name (`tmux -L <name>`).
    #[serde(default)]
    pub socket_name: Option<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
    /// Working directory for freshly created sessions; `$HOME` when unset.
    #[serde(default)]
    pub default_workdir: Option<String>,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: default_tmux_binary(),
            socket_name: None,
            command_timeout_secs: default_command_timeout(),
            history_limit: default_history_limit(),
            default_workdir: None,
        }
    }
}

impl TmuxConfig {
    /// The directory new sessions start in.
    pub fn workdir(&self) -> PathBuf {
        match &self.default_workdir {
            Some(dir) if dir.starts_with("~/") => dirs::home_dir()
                .map(|home| home.join(&dir[2..]))
                .unwrap_or_else(|| PathBuf::from(dir)),
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.binary.trim().is_empty() {
            return Err(ConfigError::Validation("tmux.binary must not be empty".into()));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "tmux.command_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_tmux_binary() -> String {
    "tmux".into()
}
fn default_command_timeout() -> u64 {
    5
}
fn default_history_limit() -> u32 {
    50_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Line cap for the history replayed to a freshly attached client.
    #[serde(default = "default_replay_lines")]
    pub scrollback_replay_lines: u32,
    /// Line cap for an explicit `capture-scrollback` request.
    #[serde(default = "default_capture_lines")]
    pub capture_max_lines: u32,
    #[serde(default = "default_high_water")]
    pub high_water_bytes: usize,
    #[serde(default = "default_low_water")]
    pub low_water_bytes: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_eviction_timeout_ms")]
    pub eviction_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_cols: default_cols(),
            default_rows: default_rows(),
            scrollback_replay_lines: default_replay_lines(),
            capture_max_lines: default_capture_lines(),
            high_water_bytes: default_high_water(),
            low_water_bytes: default_low_water(),
            heartbeat_secs: default_heartbeat_secs(),
            eviction_timeout_ms: default_eviction_timeout_ms(),
        }
    }
}

impl RelayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_cols == 0 || self.default_rows == 0 {
            return Err(ConfigError::Validation(
                "relay.default_cols and relay.default_rows must be > 0".into(),
            ));
        }
        if self.low_water_bytes >= self.high_water_bytes {
            return Err(ConfigError::Validation(format!(
                "relay.low_water_bytes ({}) must be below relay.high_water_bytes ({})",
                self.low_water_bytes, self.high_water_bytes
            )));
        }
        if self.heartbeat_secs == 0 {
            return Err(ConfigError::Validation("relay.heartbeat_secs must be > 0".into()));
        }
        Ok(())
    }
}

fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_replay_lines() -> u32 {
    1_000
}
fn default_capture_lines() -> u32 {
    10_000
}
fn default_high_water() -> usize {
    256 * 1024
}
fn default_low_water() -> usize {
    64 * 1024
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_eviction_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Idle time after which an unattached session is killed.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ReaperConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "reaper.sweep_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_session_ttl() -> u64 {
    24 * 60 * 60
}
fn default_sweep_interval() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// CredentialProvider
// ---------------------------------------------------------------------------

/// Resolves the relay's shared secret at runtime.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Read the secret from the configured env var, if set and non-empty.
    pub fn auth_token(security: &SecurityConfig) -> Option<String> {
        std::env::var(&security.auth_token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }

    /// Ensure a secret is available, generating one if needed.
    ///
    /// 1. The configured env var wins when set.
    /// 2. Otherwise `~/.persistty/auth.token` is read, or created with a
    ///    fresh random token and owner-only permissions.
    pub fn ensure_auth_token(security: &SecurityConfig) -> Result<String, ConfigError> {
        if let Some(token) = Self::auth_token(security) {
            return Ok(token);
        }
        Self::read_or_generate(&data_dir().join("auth.token"))
    }

    /// Read the token stored at `path`, creating it first if missing.
    pub fn read_or_generate(path: &Path) -> Result<String, ConfigError> {
        if path.exists() {
            let token = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
            let token = token.trim().to_string();
            if !token.is_empty() {
                return Ok(token);
            }
            tracing::warn!(path = %path.display(), "auth token file is empty, regenerating");
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let token = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        std::fs::write(path, &token).map_err(|e| ConfigError::Io(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        tracing::info!(path = %path.display(), "generated new auth token");
        Ok(token)
    }
}
