//! # Sending Engine
//!
//! Pure logic, no I/O. Accepts service data units from the client,
//! builds and transmits blocks, and drives each red block through the
//! report/retransmit cycle until the peer has claimed every byte.
//!
//! ## Responsibilities
//!
//! 1. **Aggregation**: batch red SDUs into a loading block until the
//!    size or age threshold seals it
//! 2. **Segmentation**: split a sealed block into data segments, the
//!    tail one a checkpoint (red) or plain end of block (green)
//! 3. **Claims**: remove reported byte ranges and retransmit the
//!    rest, promoting the tail to a fresh checkpoint
//! 4. **Cancellation**: both directions of the cancel handshake
//! 5. **Timeouts**: checkpoint and cancel retransmit limits
//!
//! Green blocks go out fire-and-forget; no session is kept for them.
//! `now_ms` is a wall-clock millisecond reading for aggregation age;
//! `now` is the AOS tick counter shared with the timer wheel.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error, info, trace, warn};

use crate::reassembly::ClaimOutcome;
use crate::registry::{SessionRegistry, StateCounts};
use crate::session::{random_serial, Session, SessionRole, SessionState};
use crate::stats::SenderStats;
use crate::timer::{TimerKind, TimerWheel};
use crate::wire::{
    CancelAckSegment, CancelReason, CancelSegment, CancelSide, Color, DataSegment,
    ReportAckSegment, ReportSegment, Segment, SessionId, SERVICE_ID_AGGREGATE, SERVICE_ID_SINGLE,
};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Sending engine parameters. `agg_time_ms` is wall-clock; the other
/// intervals are AOS ticks.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Engine number stamped into outbound session ids.
    pub engine_id: u64,
    /// Payload bytes per data segment.
    pub seg_size: usize,
    /// Aggregated bytes that seal the loading block immediately.
    pub agg_size: usize,
    /// Age in milliseconds after which a loading block is sealed.
    pub agg_time_ms: u64,
    /// Ticks between retransmissions of an unanswered checkpoint or
    /// unacked cancel.
    pub retran_interval: u64,
    /// Retransmissions allowed before the block is failed.
    pub retran_retries: u32,
    /// Concurrent sending sessions.
    pub max_sessions: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            engine_id: 0,
            seg_size: 1400,
            agg_size: 100_000,
            agg_time_ms: 1000,
            retran_interval: 3,
            retran_retries: 3,
            max_sessions: 100,
        }
    }
}

// ─── Sender Events ──────────────────────────────────────────────────────────

/// Events the sending engine generates for the node layer.
#[derive(Debug)]
pub enum SenderEvent {
    /// A segment should be encoded and sent to the peer.
    Transmit(Segment),
    /// Every byte of the red block was claimed by the peer.
    BlockCompleted { session: SessionId },
    /// The block was abandoned, by the peer or by this engine.
    BlockFailed { session: SessionId, reason: CancelReason, by_peer: bool },
    /// The session is gone; no further events will reference it.
    SessionClosed { session: SessionId },
}

/// Red SDUs accumulating toward one block.
struct LoadingBlock {
    session: SessionId,
    sdus: Vec<Bytes>,
    bytes: usize,
    started_ms: u64,
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// Sending engine state machine.
pub struct Sender {
    config: SenderConfig,
    sessions: SessionRegistry,
    timers: TimerWheel,
    events: Vec<SenderEvent>,
    stats: SenderStats,
    session_counter: u64,
    loading: Option<LoadingBlock>,
}

impl Sender {
    pub fn new(config: SenderConfig) -> Self {
        let sessions = SessionRegistry::new(config.max_sessions);
        Sender {
            config,
            sessions,
            timers: TimerWheel::new(),
            events: Vec::new(),
            stats: SenderStats::default(),
            session_counter: random_serial(),
            loading: None,
        }
    }

    fn next_session_id(&mut self) -> SessionId {
        let id = SessionId::new(self.config.engine_id, self.session_counter);
        self.session_counter += 1;
        id
    }

    /// Queue one SDU for transmission. Green data leaves immediately;
    /// red data aggregates until a threshold seals the block. Returns
    /// false when the SDU cannot be accepted right now.
    pub fn queue_sdu(&mut self, data: Bytes, color: Color, now_ms: u64, now: u64) -> bool {
        if data.is_empty() {
            warn!("empty SDU rejected");
            return false;
        }
        match color {
            Color::Green => {
                self.send_green_block(data);
                true
            }
            Color::Red => {
                if self.loading.is_none() {
                    if self.sessions.is_full() {
                        warn!(limit = self.config.max_sessions, "session limit reached, rejecting SDU");
                        return false;
                    }
                    let session = self.next_session_id();
                    trace!(session = %session, "opened loading block");
                    self.loading = Some(LoadingBlock {
                        session,
                        sdus: Vec::new(),
                        bytes: 0,
                        started_ms: now_ms,
                    });
                }
                if let Some(loading) = self.loading.as_mut() {
                    loading.bytes += data.len();
                    loading.sdus.push(data);
                    self.stats.sdus_queued += 1;
                    if loading.bytes >= self.config.agg_size {
                        self.seal_loading(now);
                    }
                }
                true
            }
        }
    }

    /// Seal the loading block once it has aged past `agg_time_ms`.
    /// Call from the node's service loop.
    pub fn poll_aggregation(&mut self, now_ms: u64, now: u64) {
        let due = self
            .loading
            .as_ref()
            .is_some_and(|block| now_ms.saturating_sub(block.started_ms) >= self.config.agg_time_ms);
        if due {
            self.seal_loading(now);
        }
    }

    fn send_green_block(&mut self, data: Bytes) {
        let sid = self.next_session_id();
        let total = data.len();
        let mut offset = 0usize;
        while offset < total {
            let end = (offset + self.config.seg_size).min(total);
            let mut ds = DataSegment::new(
                sid,
                SERVICE_ID_SINGLE,
                Color::Green,
                offset as u64,
                data.slice(offset..end),
            );
            if end == total {
                ds = ds.with_end_of_block();
            }
            self.events.push(SenderEvent::Transmit(Segment::Data(ds)));
            self.stats.data_segments_sent += 1;
            offset = end;
        }
        self.stats.green_blocks_sent += 1;
        debug!(session = %sid, bytes = total, "green block sent fire-and-forget");
    }

    fn seal_loading(&mut self, now: u64) {
        let Some(block) = self.loading.take() else { return };
        let LoadingBlock { session: sid, sdus, bytes, .. } = block;
        let sdu_count = sdus.len();
        if sdu_count == 0 {
            return;
        }

        // several SDUs share a block under the aggregate service id,
        // each preceded by a one-byte 0x01 marker
        let multi = sdu_count > 1;
        let service_id = if multi { SERVICE_ID_AGGREGATE } else { SERVICE_ID_SINGLE };
        let payload: Bytes = if multi {
            let mut buf = BytesMut::with_capacity(bytes + sdu_count);
            for sdu in &sdus {
                buf.put_u8(0x01);
                buf.put_slice(sdu);
            }
            buf.freeze()
        } else {
            let Some(only) = sdus.into_iter().next() else { return };
            only
        };

        let mut session = Session::new(sid, SessionRole::Sender, now);
        session.set_state(SessionState::Transfer);
        let checkpoint_id = session.next_checkpoint_id();

        let mut segments = Vec::new();
        let mut offset = 0usize;
        while offset < payload.len() {
            let end = (offset + self.config.seg_size).min(payload.len());
            let mut ds = DataSegment::new(
                sid,
                service_id,
                Color::Red,
                offset as u64,
                payload.slice(offset..end),
            );
            if end == payload.len() {
                ds = ds.with_checkpoint(checkpoint_id, 0).with_end_of_block();
            }
            session.red_mut().insert_unchecked(ds.clone());
            segments.push(ds);
            offset = end;
        }
        let Some(last) = segments.last() else { return };
        let last_start = last.start_byte();
        let handle = self.timers.schedule(
            now + self.config.retran_interval,
            TimerKind::CheckpointRetransmit { session: sid, start_byte: last_start },
        );
        session.arm_checkpoint(last_start, handle);

        if !self.sessions.insert(session) {
            self.timers.cancel(handle);
            error!(session = %sid, "session table full at seal, failing block");
            self.stats.blocks_failed += 1;
            self.events.push(SenderEvent::BlockFailed {
                session: sid,
                reason: CancelReason::SystemCancelled,
                by_peer: false,
            });
            return;
        }

        let count = segments.len() as u64;
        info!(session = %sid, bytes = payload.len(), segments = count, sdus = sdu_count, "red block sealed");
        for ds in segments {
            self.events.push(SenderEvent::Transmit(Segment::Data(ds)));
        }
        self.stats.data_segments_sent += count;
        self.stats.checkpoints_sent += 1;
        self.stats.blocks_queued += 1;
    }

    /// Process one decoded segment. `now` is the current AOS tick.
    pub fn handle_segment(&mut self, segment: Segment, now: u64) {
        match segment {
            Segment::Report(rs) => self.handle_report(rs, now),
            Segment::Cancel(cs) if cs.by == CancelSide::BlockReceiver => self.handle_cancel(cs),
            Segment::CancelAck(cas) if cas.by == CancelSide::BlockSender => {
                self.handle_cancel_ack(cas)
            }
            other => {
                debug!(
                    session = %other.session(),
                    kind = other.kind_str(),
                    "segment is not addressed to a block sender"
                );
            }
        }
    }

    /// The ack goes out before any session processing, even for
    /// sessions this engine no longer tracks.
    fn handle_report(&mut self, rs: ReportSegment, now: u64) {
        self.stats.reports_received += 1;
        let sid = rs.header.session;
        self.events.push(SenderEvent::Transmit(Segment::ReportAck(ReportAckSegment::new(
            sid,
            rs.report_serial,
        ))));
        self.stats.report_acks_sent += 1;

        let (transmit, completed) = {
            let Some(session) = self.sessions.get_mut(sid) else {
                debug!(session = %sid, "report for unknown session, acked anyway");
                return;
            };
            if session.is_cancelling() {
                return;
            }

            let mut checkpoint_claimed = false;
            for claim in &rs.claims {
                match session.claim_red(claim.offset, claim.length) {
                    ClaimOutcome::Removed { claimed_checkpoint } => {
                        checkpoint_claimed |= claimed_checkpoint;
                    }
                    ClaimOutcome::Mismatch => debug!(
                        session = %sid,
                        offset = claim.offset,
                        length = claim.length,
                        "claim straddles stored segments"
                    ),
                    ClaimOutcome::NotFound => {
                        trace!(session = %sid, offset = claim.offset, "claim for bytes no longer stored")
                    }
                }
            }
            for handle in session.stale_checkpoint_timers() {
                self.timers.cancel(handle);
            }
            if !checkpoint_claimed {
                return;
            }

            if session.red().is_empty() {
                (Vec::new(), true)
            } else {
                // resend what is left, promoting the tail to a fresh
                // checkpoint answering this report
                let starts: Vec<u64> = session.red().segments().map(|s| s.start_byte()).collect();
                let Some(&last_start) = starts.last() else { return };
                let already_checkpoint =
                    session.red().get(last_start).is_some_and(|s| s.checkpoint);
                if !already_checkpoint {
                    let checkpoint_id = session.next_checkpoint_id();
                    if let Some(seg) = session.red_mut().get_mut(last_start) {
                        seg.checkpoint = true;
                        seg.checkpoint_id = checkpoint_id;
                        seg.report_serial = rs.report_serial;
                    }
                    self.stats.checkpoints_sent += 1;
                }
                let handle = self.timers.schedule(
                    now + self.config.retran_interval,
                    TimerKind::CheckpointRetransmit { session: sid, start_byte: last_start },
                );
                session.arm_checkpoint(last_start, handle);
                if let Some(status) = session.checkpoint_status_mut(last_start) {
                    status.retries = 0;
                }
                (session.red().segments().cloned().collect(), false)
            }
        };

        if completed {
            info!(session = %sid, "block fully claimed");
            self.stats.blocks_completed += 1;
            self.events.push(SenderEvent::BlockCompleted { session: sid });
            self.finish_session(sid);
        } else {
            let count = transmit.len() as u64;
            debug!(session = %sid, segments = count, "report shows gaps, retransmitting");
            self.stats.segment_resends += count;
            for ds in transmit {
                self.events.push(SenderEvent::Transmit(Segment::Data(ds)));
            }
        }
    }

    /// Cancel from the block receiver. Acked even for sessions this
    /// engine has never heard of.
    fn handle_cancel(&mut self, cs: CancelSegment) {
        self.stats.cancels_received += 1;
        let sid = cs.header.session;

        self.events.push(SenderEvent::Transmit(Segment::CancelAck(CancelAckSegment::new(
            sid,
            CancelSide::BlockReceiver,
        ))));
        self.stats.cancel_acks_sent += 1;

        if self.sessions.contains(sid) {
            info!(session = %sid, reason = ?cs.reason, "block receiver cancelled session");
            self.evict_session(sid);
            self.stats.blocks_failed += 1;
            self.events.push(SenderEvent::BlockFailed {
                session: sid,
                reason: cs.reason,
                by_peer: true,
            });
            self.events.push(SenderEvent::SessionClosed { session: sid });
        } else {
            debug!(session = %sid, "cancel for unknown session, acked anyway");
        }
    }

    fn handle_cancel_ack(&mut self, cas: CancelAckSegment) {
        let sid = cas.header.session;
        let Some(session) = self.sessions.get(sid) else {
            trace!(session = %sid, "cancel ack for unknown session");
            return;
        };
        if session.is_cancelling() {
            debug!(session = %sid, "cancel acknowledged");
            self.finish_session(sid);
        }
    }

    /// Service due timers. Call on every AOS tick.
    pub fn service_timers(&mut self, now: u64) {
        for kind in self.timers.expire(now) {
            match kind {
                TimerKind::CheckpointRetransmit { session, start_byte } => {
                    self.on_checkpoint_timeout(session, start_byte, now)
                }
                TimerKind::CancelRetransmit { session } => self.on_cancel_timeout(session, now),
                TimerKind::Inactivity { session } | TimerKind::ReportRetransmit { session, .. } => {
                    trace!(%session, "timer does not belong to a block sender")
                }
            }
        }
    }

    fn on_checkpoint_timeout(&mut self, sid: SessionId, start_byte: u64, now: u64) {
        let (resend, give_up) = {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            if session.is_cancelling() {
                return;
            }
            let retran_retries = self.config.retran_retries;
            let mut give_up = false;
            {
                let Some(status) = session.checkpoint_status_mut(start_byte) else { return };
                status.timer = None;
                if status.retries < retran_retries {
                    status.retries += 1;
                    let handle = self.timers.schedule(
                        now + self.config.retran_interval,
                        TimerKind::CheckpointRetransmit { session: sid, start_byte },
                    );
                    status.timer = Some(handle);
                } else {
                    give_up = true;
                }
            }
            let resend = if give_up { None } else { session.red().get(start_byte).cloned() };
            (resend, give_up)
        };

        if give_up {
            warn!(session = %sid, "checkpoint retransmit limit reached, failing block");
            self.start_cancel(sid, CancelReason::RetransmitCycleLimit, now);
        } else if let Some(ds) = resend {
            debug!(session = %sid, start_byte, "checkpoint unanswered, retransmitting");
            self.stats.checkpoint_resends += 1;
            self.events.push(SenderEvent::Transmit(Segment::Data(ds)));
        }
    }

    fn on_cancel_timeout(&mut self, sid: SessionId, now: u64) {
        let resend = {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            let retran_retries = self.config.retran_retries;
            let Some(status) = session.cancel_status_mut() else { return };
            status.timer = None;
            if status.retries < retran_retries {
                status.retries += 1;
                let handle = self.timers.schedule(
                    now + self.config.retran_interval,
                    TimerKind::CancelRetransmit { session: sid },
                );
                status.timer = Some(handle);
                Some(status.segment.clone())
            } else {
                None
            }
        };
        match resend {
            Some(segment) => {
                self.stats.cancel_resends += 1;
                self.events.push(SenderEvent::Transmit(Segment::Cancel(segment)));
            }
            None => {
                warn!(session = %sid, "cancel never acknowledged, dropping session");
                self.finish_session(sid);
            }
        }
    }

    /// Abandons a block from this side: release pending timers, fail
    /// the block upward and run the cancel handshake.
    fn start_cancel(&mut self, sid: SessionId, reason: CancelReason, now: u64) {
        let segment = {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            if session.is_cancelling() {
                return;
            }
            for handle in session.release_timers() {
                self.timers.cancel(handle);
            }
            let segment = CancelSegment::new(sid, CancelSide::BlockSender, reason);
            session.start_cancel(segment.clone());
            let handle = self.timers.schedule(
                now + self.config.retran_interval,
                TimerKind::CancelRetransmit { session: sid },
            );
            if let Some(status) = session.cancel_status_mut() {
                status.timer = Some(handle);
            }
            segment
        };
        self.stats.cancels_sent += 1;
        self.stats.blocks_failed += 1;
        self.events.push(SenderEvent::Transmit(Segment::Cancel(segment)));
        self.events.push(SenderEvent::BlockFailed { session: sid, reason, by_peer: false });
    }

    fn evict_session(&mut self, sid: SessionId) {
        if let Some(mut session) = self.sessions.remove(sid) {
            for handle in session.release_timers() {
                self.timers.cancel(handle);
            }
        }
    }

    fn finish_session(&mut self, sid: SessionId) {
        if self.sessions.contains(sid) {
            self.evict_session(sid);
            self.events.push(SenderEvent::SessionClosed { session: sid });
        }
    }

    /// Drain all pending events.
    pub fn drain_events(&mut self) -> impl Iterator<Item = SenderEvent> + '_ {
        self.events.drain(..)
    }

    /// Peek at the number of pending events.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Current sender statistics.
    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn state_counts(&self) -> StateCounts {
        self.sessions.state_counts()
    }
}
