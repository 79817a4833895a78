//! Background daemon for the persistty relay.
//!
//! Hosts the relay and session API server, runs the stale session reaper,
//! and coordinates graceful shutdown.

pub mod daemon;
pub mod reaper;
pub mod shutdown;
