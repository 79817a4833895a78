//! A subprocess running in its own pseudo-terminal.
//!
//! Each bridge owns two threads. The reader feeds a bounded output channel
//! and reports the exit status after EOF. The writer drains queued input.

use std::io::{Read as IoRead, Write as IoWrite};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Chunks buffered between the PTY reader thread and the consumer. When
/// full, the reader thread stops reading and the PTY applies backpressure
/// to the attached program.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

const READ_BUFFER_SIZE: usize = 8192;

/// How long the reader thread waits for the child to be reaped after EOF.
const EXIT_POLL_LIMIT: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long `kill` waits for the signalled child to be reaped.
const KILL_REAP_LIMIT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("pty spawn failed: {0}")]
    SpawnFailed(String),

    #[error("pty resize failed: {0}")]
    Resize(String),

    #[error("pty I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

// ---------------------------------------------------------------------------
// Command description
// ---------------------------------------------------------------------------

/// What to run inside the PTY. The environment is exactly `env`; nothing
/// is inherited from the daemon.
#[derive(Debug, Clone, Default)]
pub struct BridgeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl BridgeCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace the environment, then set `TERM` for a colour terminal.
    pub fn env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self.env.retain(|(k, _)| k != "TERM");
        self.env.push(("TERM".into(), "xterm-256color".into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Spawned, no output seen yet.
    Starting,
    /// The subprocess has produced output.
    Attached,
    Exited,
}

const STARTING: u8 = 0;
const ATTACHED: u8 = 1;
const EXITED: u8 = 2;

impl BridgeState {
    fn from_u8(v: u8) -> Self {
        match v {
            STARTING => BridgeState::Starting,
            ATTACHED => BridgeState::Attached,
            _ => BridgeState::Exited,
        }
    }
}

/// How the subprocess ended. `code` is `None` when the child could not be
/// reaped within the poll window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeExit {
    pub code: Option<u32>,
    pub signal: Option<String>,
}

impl BridgeExit {
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl std::fmt::Display for BridgeExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, &self.signal) {
            (_, Some(signal)) => write!(f, "terminated by {signal}"),
            (Some(code), None) => write!(f, "exit code {code}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

// ---------------------------------------------------------------------------
// PtyBridge
// ---------------------------------------------------------------------------

type SharedChild = Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>;

/// A subprocess running in its own PTY.
///
/// Output arrives on [`PtyBridge::output`] in emission order; the channel
/// disconnects once the PTY reaches EOF. The exit status is delivered once
/// through [`PtyBridge::take_exit`]. Dropping the bridge kills the
/// subprocess.
pub struct PtyBridge {
    id: Uuid,
    output: flume::Receiver<Vec<u8>>,
    input: Mutex<Option<flume::Sender<Vec<u8>>>>,
    state: Arc<AtomicU8>,
    child: SharedChild,
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    exit: Option<oneshot::Receiver<BridgeExit>>,
}

impl PtyBridge {
    /// Spawn `command` in a new PTY of the given size.
    pub fn spawn(command: BridgeCommand, cols: u16, rows: u16) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;

        let mut builder = CommandBuilder::new(&command.program);
        builder.args(&command.args);
        builder.env_clear();
        for (k, v) in &command.env {
            builder.env(k, v);
        }
        if let Some(dir) = &command.cwd {
            builder.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;
        // Only the child may hold the slave side, otherwise EOF never arrives.
        drop(pair.slave);

        let id = Uuid::new_v4();
        debug!(%id, program = %command.program, args = ?command.args, "spawned PTY bridge");

        let child: SharedChild = Arc::new(Mutex::new(child));
        let state = Arc::new(AtomicU8::new(STARTING));

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;

        let (out_tx, out_rx) = flume::bounded::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        {
            let child = child.clone();
            let state = state.clone();
            std::thread::Builder::new()
                .name(format!("pty-reader-{}", &id.simple().to_string()[..8]))
                .spawn(move || read_loop(id, reader, out_tx, child, state, exit_tx))?;
        }

        let (in_tx, in_rx) = flume::unbounded::<Vec<u8>>();
        std::thread::Builder::new()
            .name(format!("pty-writer-{}", &id.simple().to_string()[..8]))
            .spawn(move || write_loop(writer, in_rx))?;

        Ok(Self {
            id,
            output: out_rx,
            input: Mutex::new(Some(in_tx)),
            state,
            child,
            master: Mutex::new(pair.master),
            exit: Some(exit_rx),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_alive(&self) -> bool {
        self.state() != BridgeState::Exited
    }

    /// A receiver for subprocess output.
    pub fn output(&self) -> flume::Receiver<Vec<u8>> {
        self.output.clone()
    }

    /// The one-shot exit signal. Returns `None` after the first call.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<BridgeExit>> {
        self.exit.take()
    }

    /// Queue bytes for the subprocess stdin. After exit this is a no-op
    /// returning `false`.
    pub fn write(&self, data: &[u8]) -> bool {
        if !self.is_alive() {
            return false;
        }
        let input = lock_or_recover(&self.input, "input");
        match input.as_ref() {
            Some(tx) => tx.send(data.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Resize the PTY. After exit this is a no-op.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        lock_or_recover(&self.master, "master")
            .resize(pty_size(cols, rows))
            .map_err(|e| BridgeError::Resize(e.to_string()))?;
        debug!(id = %self.id, cols, rows, "PTY resized");
        Ok(())
    }

    /// Current PTY dimensions as `(cols, rows)`.
    pub fn size(&self) -> Result<(u16, u16)> {
        let size = lock_or_recover(&self.master, "master")
            .get_size()
            .map_err(|e| BridgeError::Resize(e.to_string()))?;
        Ok((size.cols, size.rows))
    }

    /// Kill the subprocess, then drop the input side. Idempotent.
    ///
    /// The input side is released only once the child is gone: closing the
    /// PTY writer sends an EOF keystroke, which a live `tmux attach` would
    /// forward to the pane shell.
    pub fn kill(&self) {
        if self.state.swap(EXITED, Ordering::AcqRel) != EXITED {
            let signalled = lock_or_recover(&self.child, "child").kill();
            match signalled {
                Ok(()) => {
                    let exit = wait_for_exit(&self.child, KILL_REAP_LIMIT);
                    debug!(id = %self.id, %exit, "PTY child reaped after kill");
                }
                // The child may already be gone; nothing else to release.
                Err(e) => debug!(id = %self.id, "PTY kill: {e}"),
            }
            info!(id = %self.id, "PTY bridge killed");
        }
        lock_or_recover(&self.input, "input").take();
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        self.kill();
    }
}

impl std::fmt::Debug for PtyBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyBridge")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

fn read_loop(
    id: Uuid,
    mut reader: Box<dyn IoRead + Send>,
    out_tx: flume::Sender<Vec<u8>>,
    child: SharedChild,
    state: Arc<AtomicU8>,
    exit_tx: oneshot::Sender<BridgeExit>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let _ = state.compare_exchange(STARTING, ATTACHED, Ordering::AcqRel, Ordering::Acquire);
                if out_tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the child side closes.
                debug!(%id, "pty reader finished: {e}");
                break;
            }
        }
    }
    drop(out_tx);

    let exit = wait_for_exit(&child, EXIT_POLL_LIMIT);
    state.store(EXITED, Ordering::Release);
    debug!(%id, ?exit, "PTY subprocess exited");
    // The receiver may be gone if nobody is watching any more.
    let _ = exit_tx.send(exit);
}

fn wait_for_exit(child: &SharedChild, limit: Duration) -> BridgeExit {
    let deadline = Instant::now() + limit;
    loop {
        let polled = lock_or_recover(child, "child").try_wait();
        match polled {
            Ok(Some(status)) => {
                return BridgeExit {
                    code: Some(status.exit_code()),
                    signal: status.signal().map(str::to_owned),
                }
            }
            Ok(None) if Instant::now() < deadline => std::thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => {
                warn!("PTY child still running, giving up on exit status");
                return BridgeExit { code: None, signal: None };
            }
            Err(e) => {
                warn!("failed to reap PTY child: {e}");
                return BridgeExit { code: None, signal: None };
            }
        }
    }
}

fn write_loop(mut writer: Box<dyn IoWrite + Send>, in_rx: flume::Receiver<Vec<u8>>) {
    while let Ok(data) = in_rx.recv() {
        if writer.write_all(&data).is_err() {
            break;
        }
        let _ = writer.flush();
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("{what} lock was poisoned, recovering");
        e.into_inner()
    })
}
