//! Node configuration, loaded from TOML.
//!
//! The raw [`NodeConfigInput`] mirrors the file layout with everything
//! optional; [`NodeConfigInput::resolve`] fills defaults, validates and
//! produces the engine configurations the runtime consumes.

use std::net::SocketAddr;

use aphelion_ltp::receiver::ReceiverConfig;
use aphelion_ltp::sender::SenderConfig;
use serde::Deserialize;

/// Smallest usable data-segment budget. Anything below this cannot fit
/// a segment header plus one claim.
pub const MIN_SEG_SIZE: usize = 64;

/// Largest data-segment budget; one segment must fit one UDP datagram.
pub const MAX_SEG_SIZE: usize = 65000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfigInput {
    pub engine_id: Option<u64>,
    pub bind: String,
    pub peer: String,
    pub seg_size: Option<usize>,
    pub agg_size: Option<usize>,
    pub agg_time_ms: Option<u64>,
    pub retran_interval_s: Option<u64>,
    pub retran_retries: Option<u32>,
    pub inactivity_interval_s: Option<u64>,
    pub max_sessions: Option<usize>,
    pub delivery_quota: Option<u64>,
}

/// Validated node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind: SocketAddr,
    pub peer: SocketAddr,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

impl NodeConfigInput {
    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| format!("config parse error: {e}"))
    }

    pub fn resolve(self) -> Result<NodeConfig, String> {
        let bind: SocketAddr = self
            .bind
            .trim()
            .parse()
            .map_err(|_| format!("invalid bind address {:?}", self.bind))?;
        let peer: SocketAddr = self
            .peer
            .trim()
            .parse()
            .map_err(|_| format!("invalid peer address {:?}", self.peer))?;

        let engine_id = self.engine_id.ok_or("engine_id is required")?;
        if engine_id == 0 {
            return Err("engine_id must be nonzero".into());
        }

        let sender_defaults = SenderConfig::default();
        let receiver_defaults = ReceiverConfig::default();

        let seg_size = self.seg_size.unwrap_or(sender_defaults.seg_size);
        if !(MIN_SEG_SIZE..=MAX_SEG_SIZE).contains(&seg_size) {
            return Err(format!(
                "seg_size {seg_size} outside {MIN_SEG_SIZE}..={MAX_SEG_SIZE}"
            ));
        }

        let retran_interval =
            self.retran_interval_s.unwrap_or(receiver_defaults.retran_interval);
        if retran_interval == 0 {
            return Err("retran_interval_s must be nonzero".into());
        }
        let inactivity_interval = self
            .inactivity_interval_s
            .unwrap_or(receiver_defaults.inactivity_interval);
        if inactivity_interval == 0 {
            return Err("inactivity_interval_s must be nonzero".into());
        }
        let retran_retries = self.retran_retries.unwrap_or(receiver_defaults.retran_retries);
        let max_sessions = self.max_sessions.unwrap_or(receiver_defaults.max_sessions).max(1);

        let sender = SenderConfig {
            engine_id,
            seg_size,
            agg_size: self.agg_size.unwrap_or(sender_defaults.agg_size).max(1),
            agg_time_ms: self.agg_time_ms.unwrap_or(sender_defaults.agg_time_ms),
            retran_interval,
            retran_retries,
            max_sessions,
        };
        let receiver = ReceiverConfig {
            seg_size,
            retran_interval,
            retran_retries,
            inactivity_interval,
            max_sessions,
            delivery_quota: self.delivery_quota,
        };

        Ok(NodeConfig { bind, peer, sender, receiver })
    }
}
