//! # Engine Statistics
//!
//! Counters kept by the receiver and sender engines. All stats are
//! plain fields, cheap to update inline and ready for JSON export.

use serde::Serialize;

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Aggregate receiving-engine statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Data segments processed (including duplicates).
    pub data_segments: u64,
    /// Checkpoint data segments accepted.
    pub data_checkpoints: u64,
    /// Data segments discarded as duplicates of stored spans.
    pub data_duplicates: u64,
    /// Data segments that arrived after reports went out.
    pub data_resends: u64,
    /// Checkpoints that did not newly complete the block.
    pub checkpoint_reruns: u64,
    /// Reception reports transmitted (first copies).
    pub reports_sent: u64,
    /// Reception reports retransmitted on timeout.
    pub report_resends: u64,
    /// Report acks received.
    pub report_acks: u64,
    /// Cancels received from block senders.
    pub cancels_received: u64,
    /// Cancel acks transmitted.
    pub cancel_acks_sent: u64,
    /// Cancels transmitted by this engine.
    pub cancels_sent: u64,
    /// Cancels retransmitted on timeout.
    pub cancel_resends: u64,
    /// Blocks handed to the client.
    pub blocks_delivered: u64,
    /// Payload bytes handed to the client.
    pub bytes_delivered: u64,
    /// Sessions opened by inbound data.
    pub sessions_started: u64,
    /// Sessions that delivered and closed cleanly.
    pub sessions_completed: u64,
    /// Sessions torn down by a cancel from either side.
    pub sessions_cancelled: u64,
    /// Sessions refused at the concurrency cap.
    pub sessions_refused: u64,
    /// Segments dropped for an unusable service id or wrong origin.
    pub invalid_segments: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of data segments that duplicated stored spans.
    pub fn duplicate_ratio(&self) -> f64 {
        if self.data_segments == 0 {
            0.0
        } else {
            self.data_duplicates as f64 / self.data_segments as f64
        }
    }
}

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Aggregate sending-engine statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Red SDUs accepted for aggregation.
    pub sdus_queued: u64,
    /// Red blocks sealed and put on the wire.
    pub blocks_queued: u64,
    /// Green blocks sent fire-and-forget.
    pub green_blocks_sent: u64,
    /// Red blocks fully claimed by the peer.
    pub blocks_completed: u64,
    /// Red blocks abandoned after cancellation.
    pub blocks_failed: u64,
    /// Data segments transmitted (first copies).
    pub data_segments_sent: u64,
    /// Checkpoint segments transmitted.
    pub checkpoints_sent: u64,
    /// Checkpoints retransmitted on timeout.
    pub checkpoint_resends: u64,
    /// Data segments retransmitted after reports showed gaps.
    pub segment_resends: u64,
    /// Reception reports received.
    pub reports_received: u64,
    /// Report acks transmitted.
    pub report_acks_sent: u64,
    /// Cancels transmitted by this engine.
    pub cancels_sent: u64,
    /// Cancels retransmitted on timeout.
    pub cancel_resends: u64,
    /// Cancels received from block receivers.
    pub cancels_received: u64,
    /// Cancel acks transmitted.
    pub cancel_acks_sent: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retransmission overhead relative to first-copy traffic.
    pub fn resend_ratio(&self) -> f64 {
        if self.data_segments_sent == 0 {
            0.0
        } else {
            let resent = self.segment_resends + self.checkpoint_resends;
            resent as f64 / self.data_segments_sent as f64
        }
    }

    /// Fraction of queued red blocks that completed.
    pub fn completion_ratio(&self) -> f64 {
        if self.blocks_queued == 0 {
            0.0
        } else {
            self.blocks_completed as f64 / self.blocks_queued as f64
        }
    }
}
