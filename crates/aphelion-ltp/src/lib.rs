//! # aphelion-ltp
//!
//! Licklider Transmission Protocol session and segment engine.
//!
//! Reliable block delivery over an unreliable datagram link: red data
//! is checkpointed, reported and retransmitted until the peer claims
//! every byte, green data goes out best effort. The crate is pure
//! protocol logic — no sockets, no threads, no wall-clock; the node
//! layer feeds decoded segments and AOS ticks in and carries the
//! resulting segments and delivery events out.
//!
//! ## Crate structure
//!
//! - [`sdnv`] — self-delimiting numeric value (varint) codec
//! - [`wire`] — segment model and byte-exact codec for all five variants
//! - [`reassembly`] — per-color segment map with overlap trimming
//! - [`report`] — report claim generation under a size budget
//! - [`session`] — per-transfer bookkeeping for both roles
//! - [`timer`] — slab-backed timer wheel on the AOS tick counter
//! - [`registry`] — bounded table of live sessions
//! - [`receiver`] — receiving engine state machine
//! - [`sender`] — sending engine state machine
//! - [`stats`] — per-engine counters
//! - [`auth`] — optional segment authentication seam

pub mod auth;
pub mod reassembly;
pub mod receiver;
pub mod registry;
pub mod report;
pub mod sdnv;
pub mod sender;
pub mod session;
pub mod stats;
pub mod timer;
pub mod wire;
