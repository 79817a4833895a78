//! Multiplexer sessions and the local PTY bridge that attaches to them.
//!
//! A tmux session outlives any viewer; this crate is the only place that
//! talks to tmux or spawns processes.
//!
//! Key components:
//! - [`tmux`]: lifecycle commands against the tmux server, behind the
//!   [`tmux::CommandRunner`] seam
//! - [`bridge`]: a PTY subprocess exposing an output channel, a write/resize
//!   handle and a one-shot exit signal
//! - [`attach`]: builds the `tmux attach-session` subprocess for a session
//! - `testing` (feature `testing`): in-memory tmux double and a local-shell
//!   attacher

pub mod attach;
pub mod bridge;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tmux;
