//! Shared primitives for persistty.
//!
//! - [`config`]: TOML configuration and runtime credential resolution
//! - [`naming`]: derivation of multiplexer session names from a credential
//! - [`env`]: environment scrubbing applied before spawning anything that
//!   ends up running user shells

pub mod config;
pub mod env;
pub mod naming;
