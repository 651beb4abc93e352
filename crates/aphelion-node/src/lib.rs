//! # aphelion-node
//!
//! Runtime layer around the `aphelion-ltp` engines: UDP transport to
//! one peer, the AOS tick clock, TOML configuration and the worker
//! thread that owns all session state. The `aphelion-ltpd` binary is a
//! thin CLI over [`runtime::NodeRuntime`].

pub mod clock;
pub mod config;
pub mod runtime;
