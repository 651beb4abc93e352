//! # Receiving Engine
//!
//! Pure logic, no I/O. Consumes decoded segments from the block sender
//! plus timer expiries, and produces outbound segments and delivery
//! events for the node layer to act on.
//!
//! ## Responsibilities
//!
//! 1. **Session tracking**: open a session per inbound block, bounded
//!    by the configured concurrency cap
//! 2. **Reassembly**: insert data segments into the per-color maps,
//!    resolving overlap and duplicates
//! 3. **Reporting**: answer checkpoints with reception reports and
//!    retransmit them until acked
//! 4. **Delivery**: hand each color of a block upward exactly once
//! 5. **Cancellation**: run the cancel handshake for either side and
//!    tear the session down
//! 6. **Timeouts**: inactivity closeout and report/cancel retransmit
//!    limits
//!
//! The engine does not manage sockets or clocks. `now` is the AOS
//! tick counter maintained by the caller.

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::reassembly::InsertOutcome;
use crate::registry::{SessionRegistry, StateCounts};
use crate::session::{Session, SessionRole, SessionState};
use crate::stats::ReceiverStats;
use crate::timer::{TimerKind, TimerWheel};
use crate::wire::{
    CancelAckSegment, CancelReason, CancelSegment, CancelSide, Color, DataSegment,
    ReportAckSegment, Segment, SessionId, SERVICE_ID_AGGREGATE, SERVICE_ID_SINGLE,
};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Receiving engine parameters. Intervals are in AOS ticks.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Size budget for one encoded report segment.
    pub seg_size: usize,
    /// Ticks between retransmissions of an unacked report or cancel.
    pub retran_interval: u64,
    /// Retransmissions allowed before the session is cancelled.
    pub retran_retries: u32,
    /// Ticks without traffic before a session is abandoned.
    pub inactivity_interval: u64,
    /// Concurrent receiving sessions accepted.
    pub max_sessions: usize,
    /// Undelivered-byte budget; blocks pushing past it cancel their
    /// session. `None` means unbounded.
    pub delivery_quota: Option<u64>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            seg_size: 1400,
            retran_interval: 3,
            retran_retries: 3,
            inactivity_interval: 30,
            max_sessions: 100,
            delivery_quota: None,
        }
    }
}

// ─── Delivered Block ────────────────────────────────────────────────────────

/// One color of a block handed to the client layer.
#[derive(Debug, Clone)]
pub struct DeliveredBlock {
    pub session: SessionId,
    /// Client service id from the data segments.
    pub service_id: u64,
    pub color: Color,
    /// Reassembled block bytes. For a multi-SDU block each SDU is
    /// preceded by a one-byte 0x01 marker; the client splits.
    pub data: Bytes,
}

impl DeliveredBlock {
    /// Whether the block aggregates several SDUs.
    pub fn multi_sdu(&self) -> bool {
        self.service_id == SERVICE_ID_AGGREGATE
    }
}

// ─── Receiver Events ────────────────────────────────────────────────────────

/// Events the receiving engine generates for the node layer.
#[derive(Debug)]
pub enum ReceiverEvent {
    /// A segment should be encoded and sent to the peer.
    Transmit(Segment),
    /// Block data is ready for the client.
    Deliver(DeliveredBlock),
    /// The session was aborted, by the peer or by this engine.
    SessionCancelled { session: SessionId, reason: CancelReason, by_peer: bool },
    /// The session is gone; no further events will reference it.
    SessionClosed { session: SessionId },
}

// ─── Receiver ───────────────────────────────────────────────────────────────

/// Receiving engine state machine.
pub struct Receiver {
    config: ReceiverConfig,
    sessions: SessionRegistry,
    timers: TimerWheel,
    events: Vec<ReceiverEvent>,
    stats: ReceiverStats,
    quota_used: u64,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        let sessions = SessionRegistry::new(config.max_sessions);
        Receiver {
            config,
            sessions,
            timers: TimerWheel::new(),
            events: Vec::new(),
            stats: ReceiverStats::default(),
            quota_used: 0,
        }
    }

    /// Process one decoded segment. `now` is the current AOS tick.
    pub fn handle_segment(&mut self, segment: Segment, now: u64) {
        match segment {
            Segment::Data(ds) => self.handle_data(ds, now),
            Segment::ReportAck(ras) => self.handle_report_ack(ras, now),
            Segment::Cancel(cs) if cs.by == CancelSide::BlockSender => self.handle_cancel(cs),
            Segment::CancelAck(cas) if cas.by == CancelSide::BlockReceiver => {
                self.handle_cancel_ack(cas)
            }
            other => {
                debug!(
                    session = %other.session(),
                    kind = other.kind_str(),
                    "segment is not addressed to a block receiver"
                );
                self.stats.invalid_segments += 1;
            }
        }
    }

    fn handle_data(&mut self, ds: DataSegment, now: u64) {
        self.stats.data_segments += 1;
        let sid = ds.header.session;

        if !self.sessions.contains(sid) {
            if self.sessions.is_full() {
                warn!(
                    session = %sid,
                    limit = self.config.max_sessions,
                    "session limit reached, refusing new block"
                );
                self.stats.sessions_refused += 1;
                self.transmit_one_shot_cancel(sid, CancelReason::SystemCancelled);
                return;
            }
            let mut session = Session::new(sid, SessionRole::Receiver, now);
            session.set_state(SessionState::Transfer);
            self.sessions.insert(session);
            self.stats.sessions_started += 1;
            debug!(session = %sid, "new receiving session");
        }

        if ds.service_id != SERVICE_ID_SINGLE && ds.service_id != SERVICE_ID_AGGREGATE {
            warn!(session = %sid, service_id = ds.service_id, "unusable client service id");
            self.stats.invalid_segments += 1;
            match ds.color {
                Color::Red => self.start_cancel(sid, CancelReason::Unreachable, now),
                Color::Green => self.evict_session(sid),
            }
            return;
        }

        let checkpoint = ds.checkpoint;
        let checkpoint_id = ds.checkpoint_id;
        let report_serial = ds.report_serial;
        let chkpt_upper_bounds = ds.stop_byte() + 1;
        let color = ds.color;
        let service_id = ds.service_id;

        let (red_ready, green_ready) = {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            if session.is_cancelling() {
                trace!(session = %sid, "data for cancelling session dropped");
                return;
            }
            session.set_state(SessionState::Transfer);
            session.touch(now);

            if session.insert_data(ds) == InsertOutcome::Duplicate {
                trace!(session = %sid, "duplicate data segment discarded");
                self.stats.data_duplicates += 1;
                return;
            }
            if session.inactivity_timer().is_none() {
                let handle = self.timers.schedule(
                    now + self.config.inactivity_interval,
                    TimerKind::Inactivity { session: sid },
                );
                session.set_inactivity_timer(Some(handle));
            }
            if session.report_batches() > 0 {
                self.stats.data_resends += 1;
            }
            (session.red_full(), session.green_full())
        };

        // quota check before anything is delivered or reported
        if let (Some(bytes), Some(quota)) = (red_ready, self.config.delivery_quota) {
            if self.quota_used + bytes > quota {
                warn!(session = %sid, bytes, quota, "delivery quota exhausted, cancelling");
                self.start_cancel(sid, CancelReason::SystemCancelled, now);
                return;
            }
        }

        if checkpoint {
            self.stats.data_checkpoints += 1;
            if let Some(session) = self.sessions.get_mut(sid) {
                session.set_state(SessionState::Reporting);
            }
            self.send_reports(sid, checkpoint_id, report_serial, chkpt_upper_bounds, now);
        }

        if let Some(bytes) = red_ready {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            let data = session.take_red_block();
            self.quota_used += bytes;
            self.stats.blocks_delivered += 1;
            self.stats.bytes_delivered += bytes;
            info!(session = %sid, bytes, "red block complete");
            self.events.push(ReceiverEvent::Deliver(DeliveredBlock {
                session: sid,
                service_id,
                color: Color::Red,
                data,
            }));
        } else if checkpoint {
            self.stats.checkpoint_reruns += 1;
        }

        if let Some(bytes) = green_ready {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            let data = session.take_green_block();
            self.stats.blocks_delivered += 1;
            self.stats.bytes_delivered += bytes;
            info!(session = %sid, bytes, "green block complete");
            self.events.push(ReceiverEvent::Deliver(DeliveredBlock {
                session: sid,
                service_id,
                color: Color::Green,
                data,
            }));
            // an all-green session has nothing left to ack
            if color == Color::Green {
                self.stats.sessions_completed += 1;
                self.finish_session(sid);
            }
        }
    }

    /// Answers a checkpoint: resend the unacked reports already
    /// covering it, or generate fresh ones. A checkpoint answering a
    /// superseded report regenerates from that report's lower bounds.
    fn send_reports(
        &mut self,
        sid: SessionId,
        checkpoint_id: u64,
        report_serial: u64,
        chkpt_upper_bounds: u64,
        now: u64,
    ) {
        let (serials, regenerated) = {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            let existing = session.reports_for_checkpoint(checkpoint_id);
            if !existing.is_empty() {
                (existing, false)
            } else {
                let lower_bounds = if report_serial != 0 {
                    session.lower_bound_for_report_serial(report_serial).unwrap_or(0)
                } else {
                    0
                };
                let fresh = session.generate_reports(
                    checkpoint_id,
                    lower_bounds,
                    chkpt_upper_bounds,
                    self.config.seg_size,
                );
                (fresh, true)
            }
        };

        let count = serials.len() as u64;
        debug!(session = %sid, checkpoint_id, reports = count, regenerated, "answering checkpoint");
        for serial in serials {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            let Some(status) = session.report_mut(serial) else { continue };
            if let Some(old) = status.timer.take() {
                self.timers.cancel(old);
            }
            let handle = self.timers.schedule(
                now + self.config.retran_interval,
                TimerKind::ReportRetransmit { session: sid, report_serial: serial },
            );
            status.timer = Some(handle);
            let segment = status.segment.clone();
            self.events.push(ReceiverEvent::Transmit(Segment::Report(segment)));
        }
        if regenerated {
            self.stats.reports_sent += count;
        } else {
            self.stats.report_resends += count;
        }
    }

    fn handle_report_ack(&mut self, ras: ReportAckSegment, now: u64) {
        self.stats.report_acks += 1;
        let sid = ras.header.session;

        let done = {
            let Some(session) = self.sessions.get_mut(sid) else {
                trace!(session = %sid, "report ack for unknown session");
                return;
            };
            match session.ack_report(ras.report_serial) {
                Some(Some(handle)) => {
                    self.timers.cancel(handle);
                }
                Some(None) => {}
                None => {
                    trace!(session = %sid, serial = ras.report_serial, "ack without matching report")
                }
            }
            if session.data_processed() {
                true
            } else {
                if let Some(handle) = session.inactivity_timer() {
                    self.timers.cancel(handle);
                }
                let handle = self.timers.schedule(
                    now + self.config.inactivity_interval,
                    TimerKind::Inactivity { session: sid },
                );
                session.set_inactivity_timer(Some(handle));
                false
            }
        };
        if done {
            debug!(session = %sid, "delivered block acknowledged, closing");
            self.stats.sessions_completed += 1;
            self.finish_session(sid);
        }
    }

    /// Cancel from the block sender. The ack goes out even for
    /// sessions this engine has never heard of.
    fn handle_cancel(&mut self, cs: CancelSegment) {
        self.stats.cancels_received += 1;
        let sid = cs.header.session;

        self.events.push(ReceiverEvent::Transmit(Segment::CancelAck(CancelAckSegment::new(
            sid,
            CancelSide::BlockSender,
        ))));
        self.stats.cancel_acks_sent += 1;

        if self.sessions.contains(sid) {
            info!(session = %sid, reason = ?cs.reason, "block sender cancelled session");
            self.evict_session(sid);
            self.stats.sessions_cancelled += 1;
            self.events.push(ReceiverEvent::SessionCancelled {
                session: sid,
                reason: cs.reason,
                by_peer: true,
            });
            self.events.push(ReceiverEvent::SessionClosed { session: sid });
        } else {
            debug!(session = %sid, "cancel for unknown session, acked anyway");
        }
    }

    /// Cancel ack answering this engine's own cancel.
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
                TimerKind::Inactivity { session } => self.on_inactivity(session, now),
                TimerKind::ReportRetransmit { session, report_serial } => {
                    self.on_report_timeout(session, report_serial, now)
                }
                TimerKind::CancelRetransmit { session } => self.on_cancel_timeout(session, now),
                TimerKind::CheckpointRetransmit { session, .. } => {
                    trace!(%session, "checkpoint timer does not belong to a block receiver")
                }
            }
        }
    }

    /// The inactivity deadline is measured from the last touch, so a
    /// timer armed before recent traffic re-arms for the remainder.
    fn on_inactivity(&mut self, sid: SessionId, now: u64) {
        let expired = {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            session.set_inactivity_timer(None);
            let deadline = session.last_activity() + self.config.inactivity_interval;
            if deadline > now {
                let handle =
                    self.timers.schedule(deadline, TimerKind::Inactivity { session: sid });
                session.set_inactivity_timer(Some(handle));
                false
            } else {
                warn!(session = %sid, idle = now - session.last_activity(), "session inactive, giving up");
                session.clear_segments();
                true
            }
        };
        if expired {
            self.start_cancel(sid, CancelReason::RetransmitCycleLimit, now);
        }
    }

    fn on_report_timeout(&mut self, sid: SessionId, serial: u64, now: u64) {
        let resend = {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            if session.is_cancelling() {
                return;
            }
            let retran_retries = self.config.retran_retries;
            let Some(status) = session.report_mut(serial) else { return };
            status.timer = None;
            if status.retries < retran_retries {
                status.retries += 1;
                let handle = self.timers.schedule(
                    now + self.config.retran_interval,
                    TimerKind::ReportRetransmit { session: sid, report_serial: serial },
                );
                status.timer = Some(handle);
                Some(status.segment.clone())
            } else {
                None
            }
        };
        match resend {
            Some(segment) => {
                debug!(session = %sid, serial, "report unacked, retransmitting");
                self.stats.report_resends += 1;
                self.events.push(ReceiverEvent::Transmit(Segment::Report(segment)));
            }
            None => {
                warn!(session = %sid, serial, "report retransmit limit reached, cancelling");
                self.start_cancel(sid, CancelReason::RetransmitLimit, now);
            }
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
                self.events.push(ReceiverEvent::Transmit(Segment::Cancel(segment)));
            }
            None => {
                warn!(session = %sid, "cancel never acknowledged, dropping session");
                self.finish_session(sid);
            }
        }
    }

    /// Aborts a session from this side: release every pending timer,
    /// send the cancel and keep resending it until acked.
    fn start_cancel(&mut self, sid: SessionId, reason: CancelReason, now: u64) {
        let segment = {
            let Some(session) = self.sessions.get_mut(sid) else { return };
            if session.is_cancelling() {
                return;
            }
            for handle in session.release_timers() {
                self.timers.cancel(handle);
            }
            let segment = CancelSegment::new(sid, CancelSide::BlockReceiver, reason);
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
        self.stats.sessions_cancelled += 1;
        self.events.push(ReceiverEvent::Transmit(Segment::Cancel(segment)));
        self.events.push(ReceiverEvent::SessionCancelled { session: sid, reason, by_peer: false });
    }

    /// One-shot cancel for a session never admitted to the registry.
    fn transmit_one_shot_cancel(&mut self, sid: SessionId, reason: CancelReason) {
        self.events.push(ReceiverEvent::Transmit(Segment::Cancel(CancelSegment::new(
            sid,
            CancelSide::BlockReceiver,
            reason,
        ))));
        self.stats.cancels_sent += 1;
    }

    /// Removes a session and cancels its timers without telling the
    /// client anything.
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
            self.events.push(ReceiverEvent::SessionClosed { session: sid });
        }
    }

    /// Returns quota to the pool once the client consumed a delivery.
    pub fn credit_delivery(&mut self, bytes: u64) {
        self.quota_used = self.quota_used.saturating_sub(bytes);
    }

    /// Drain all pending events.
    pub fn drain_events(&mut self) -> impl Iterator<Item = ReceiverEvent> + '_ {
        self.events.drain(..)
    }

    /// Peek at the number of pending events.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Current receiver statistics.
    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn state_counts(&self) -> StateCounts {
        self.sessions.state_counts()
    }
}
