//! Test doubles for the tmux seam.
//!
//! [`FakeTmux`] is an in-memory [`CommandRunner`] that understands the
//! handful of commands [`TmuxController`](crate::tmux::TmuxController)
//! issues and records every invocation. [`LocalShellAttacher`] stands in for
//! `tmux attach-session` by spawning an ordinary program in a PTY.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use pt_core::naming::SessionName;

use crate::attach::Attacher;
use crate::bridge::{BridgeCommand, BridgeError, PtyBridge, Result as BridgeResult};
use crate::tmux::{CommandOutput, CommandRunner, TmuxError};

// ---------------------------------------------------------------------------
// FakeTmux
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeSession {
    created: i64,
    activity: i64,
    attached: u32,
    scrollback: String,
    cwd: String,
    command: String,
    size: (u16, u16),
    options: BTreeMap<String, String>,
}

impl FakeSession {
    fn new(cwd: String, size: (u16, u16)) -> Self {
        let now = Utc::now().timestamp();
        Self {
            created: now,
            activity: now,
            attached: 0,
            scrollback: String::new(),
            cwd,
            command: "bash".into(),
            size,
            options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    sessions: BTreeMap<String, FakeSession>,
    global_options: BTreeMap<String, String>,
    calls: Vec<Vec<String>>,
    failing: HashSet<String>,
    failing_once: HashSet<String>,
    failing_options: HashSet<String>,
}

/// In-memory tmux server.
#[derive(Debug, Clone, Default)]
pub struct FakeTmux {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTmux {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every future invocation of `subcommand` exit non-zero.
    pub fn fail_command(&self, subcommand: &str) {
        self.lock().failing.insert(subcommand.to_string());
    }

    /// Make only the next invocation of `subcommand` exit non-zero.
    pub fn fail_next(&self, subcommand: &str) {
        self.lock().failing_once.insert(subcommand.to_string());
    }

    /// Make `set-option` fail for one option name.
    pub fn fail_option(&self, option: &str) {
        self.lock().failing_options.insert(option.to_string());
    }

    /// Seed a session as if it had been created earlier.
    pub fn insert_session(&self, name: &str, created: i64, attached: u32) {
        let mut session = FakeSession::new("/".into(), (80, 24));
        session.created = created;
        session.activity = created;
        session.attached = attached;
        self.lock().sessions.insert(name.to_string(), session);
    }

    pub fn set_attached(&self, name: &str, attached: u32) {
        if let Some(s) = self.lock().sessions.get_mut(name) {
            s.attached = attached;
        }
    }

    pub fn set_activity(&self, name: &str, activity: i64) {
        if let Some(s) = self.lock().sessions.get_mut(name) {
            s.activity = activity;
        }
    }

    pub fn set_scrollback(&self, name: &str, text: &str) {
        if let Some(s) = self.lock().sessions.get_mut(name) {
            s.scrollback = text.to_string();
        }
    }

    pub fn set_foreground(&self, name: &str, cwd: &str, command: &str) {
        if let Some(s) = self.lock().sessions.get_mut(name) {
            s.cwd = cwd.to_string();
            s.command = command.to_string();
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.lock().sessions.contains_key(name)
    }

    pub fn session_names(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    /// Window size last applied to `name`.
    pub fn size_of(&self, name: &str) -> Option<(u16, u16)> {
        self.lock().sessions.get(name).map(|s| s.size)
    }

    pub fn option(&self, name: &str, option: &str) -> Option<String> {
        self.lock()
            .sessions
            .get(name)
            .and_then(|s| s.options.get(option).cloned())
    }

    /// Every command so far, in order. A `;`-separated command list counts
    /// as one command per element.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock().calls.clone()
    }

    /// Invocations of one subcommand.
    pub fn calls_for(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some(subcommand))
            .cloned()
            .collect()
    }

    fn handle(state: &mut FakeState, args: &[String]) -> CommandOutput {
        let sub = args.first().map(String::as_str).unwrap_or_default();
        if state.failing.contains(sub) || state.failing_once.remove(sub) {
            return failure(format!("{sub}: forced failure"));
        }
        let target = flag(args, "-t").map(strip_target);

        match sub {
            "has-session" => match target {
                Some(t) if state.sessions.contains_key(t) => ok(""),
                Some(t) => failure(format!("can't find session: {t}")),
                None => failure("no target".into()),
            },
            "new-session" => {
                let Some(name) = flag(args, "-s") else {
                    return failure("missing -s".into());
                };
                if state.sessions.contains_key(name) {
                    return failure(format!("duplicate session: {name}"));
                }
                let cols = flag(args, "-x").and_then(|v| v.parse().ok()).unwrap_or(80);
                let rows = flag(args, "-y").and_then(|v| v.parse().ok()).unwrap_or(24);
                let cwd = flag(args, "-c").unwrap_or("/").to_string();
                let mut session = FakeSession::new(cwd, (cols, rows));
                session.options = state.global_options.clone();
                state.sessions.insert(name.to_string(), session);
                ok("")
            }
            "set-option" if args.get(1).map(String::as_str) == Some("-g") => {
                let (Some(option), Some(value)) = (args.get(2), args.get(3)) else {
                    return failure("bad set-option".into());
                };
                if state.failing_options.contains(option) {
                    return failure(format!("{option}: forced failure"));
                }
                state.global_options.insert(option.clone(), value.clone());
                ok("")
            }
            "set-option" => {
                let (Some(t), Some(option), Some(value)) = (target, args.get(3), args.get(4)) else {
                    return failure("bad set-option".into());
                };
                if state.failing_options.contains(option) {
                    return failure(format!("{option}: forced failure"));
                }
                match state.sessions.get_mut(t) {
                    Some(s) => {
                        s.options.insert(option.clone(), value.clone());
                        ok("")
                    }
                    None => failure(format!("can't find session: {t}")),
                }
            }
            "resize-window" => {
                let cols = flag(args, "-x").and_then(|v| v.parse().ok());
                let rows = flag(args, "-y").and_then(|v| v.parse().ok());
                match (target.and_then(|t| state.sessions.get_mut(t)), cols, rows) {
                    (Some(s), Some(c), Some(r)) => {
                        s.size = (c, r);
                        ok("")
                    }
                    _ => failure("can't find window".into()),
                }
            }
            "kill-session" => match target.and_then(|t| state.sessions.remove(t)) {
                Some(_) => ok(""),
                None => failure("can't find session".into()),
            },
            "list-sessions" => {
                if state.sessions.is_empty() {
                    return failure("no server running".into());
                }
                let lines: Vec<String> = state
                    .sessions
                    .iter()
                    .map(|(name, s)| format!("{name}|{}|{}|{}", s.created, s.attached, s.activity))
                    .collect();
                ok(&(lines.join("\n") + "\n"))
            }
            "capture-pane" => match target.and_then(|t| state.sessions.get(t)) {
                Some(s) => ok(&format!("{}\n", s.scrollback)),
                None => failure("can't find pane".into()),
            },
            "display-message" => {
                let format = args.last().map(String::as_str).unwrap_or_default();
                match target.and_then(|t| state.sessions.get(t)) {
                    Some(s) => {
                        let value = format
                            .replace("#{pane_current_path}", &s.cwd)
                            .replace("#{pane_current_command}", &s.command);
                        ok(&format!("{value}\n"))
                    }
                    None => failure("can't find pane".into()),
                }
            }
            other => failure(format!("unknown command: {other}")),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeTmux {
    async fn run(&self, args: &[String]) -> Result<CommandOutput, TmuxError> {
        let mut state = self.lock();
        let mut output = ok("");
        // A command list stops at the first failing command, as tmux does.
        for command in args.split(|a| a == ";") {
            state.calls.push(command.to_vec());
            output = Self::handle(&mut state, command);
            if !output.success {
                break;
            }
        }
        Ok(output)
    }
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn strip_target(target: &str) -> &str {
    let t = target.strip_prefix('=').unwrap_or(target);
    t.strip_suffix(':').unwrap_or(t)
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        success: true,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failure(stderr: String) -> CommandOutput {
    CommandOutput {
        success: false,
        stdout: String::new(),
        stderr,
    }
}

// ---------------------------------------------------------------------------
// LocalShellAttacher
// ---------------------------------------------------------------------------

/// Attaches by running a local program instead of `tmux attach-session`.
#[derive(Debug, Clone)]
pub struct LocalShellAttacher {
    program: String,
    args: Vec<String>,
    fail: bool,
    attaches: Arc<Mutex<Vec<SessionName>>>,
}

impl LocalShellAttacher {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            fail: false,
            attaches: Arc::default(),
        }
    }

    /// `cat`, which echoes input back until killed.
    pub fn cat() -> Self {
        Self::new("cat", Vec::<String>::new())
    }

    /// An attacher whose every attach fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::cat()
        }
    }

    /// Sessions attached so far, in order.
    pub fn attaches(&self) -> Vec<SessionName> {
        self.attaches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Attacher for LocalShellAttacher {
    fn attach(&self, name: &SessionName, cols: u16, rows: u16) -> BridgeResult<PtyBridge> {
        if self.fail {
            return Err(BridgeError::SpawnFailed(format!("attach to {name} refused")));
        }
        self.attaches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name.clone());
        let env = vec![("PATH".to_string(), std::env::var("PATH").unwrap_or_default())];
        PtyBridge::spawn(
            BridgeCommand::new(self.program.clone())
                .args(self.args.clone())
                .env(env),
            cols,
            rows,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn fake_tracks_session_lifecycle() {
        let fake = FakeTmux::new();
        let out = fake.run(&s(&["has-session", "-t", "=abc"])).await.unwrap();
        assert!(!out.success);

        fake.run(&s(&["new-session", "-d", "-s", "abc", "-x", "100", "-y", "30", "-c", "/tmp"]))
            .await
            .unwrap();
        assert!(fake.has("abc"));
        assert_eq!(fake.size_of("abc"), Some((100, 30)));

        let out = fake.run(&s(&["has-session", "-t", "=abc"])).await.unwrap();
        assert!(out.success);

        fake.run(&s(&["kill-session", "-t", "=abc"])).await.unwrap();
        assert!(!fake.has("abc"));
        assert_eq!(fake.calls().len(), 4);
    }

    #[tokio::test]
    async fn forced_failures_apply_per_subcommand() {
        let fake = FakeTmux::new();
        fake.insert_session("abc", 1, 0);
        fake.fail_command("resize-window");
        let out = fake
            .run(&s(&["resize-window", "-t", "=abc:", "-x", "1", "-y", "1"]))
            .await
            .unwrap();
        assert!(!out.success);
        let out = fake.run(&s(&["has-session", "-t", "=abc"])).await.unwrap();
        assert!(out.success);
    }

    #[tokio::test]
    async fn command_list_stops_at_first_failure() {
        let fake = FakeTmux::new();
        fake.fail_next("set-option");
        let out = fake
            .run(&s(&["set-option", "-g", "history-limit", "10", ";", "new-session", "-d", "-s", "abc"]))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(!fake.has("abc"));
        assert_eq!(fake.calls().len(), 1);

        fake.run(&s(&["set-option", "-g", "history-limit", "10", ";", "new-session", "-d", "-s", "abc"]))
            .await
            .unwrap();
        assert_eq!(fake.option("abc", "history-limit").as_deref(), Some("10"));
        assert_eq!(fake.calls().len(), 3);
    }
}
