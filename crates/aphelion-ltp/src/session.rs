//! Per-transfer state shared by the two engines.
//!
//! A session tracks one block: segment maps for both colors, expected
//! lengths, outstanding reports or checkpoints and any cancel in
//! flight. The engines own all protocol decisions; the session only
//! keeps their books.

use crate::reassembly::{ClaimOutcome, InsertOutcome, SegmentMap};
use crate::report::{plan_full, plan_reports};
use crate::timer::TimerHandle;
use crate::wire::{CancelSegment, Color, DataSegment, ReportSegment, SegmentHeader, SessionId};
use bytes::Bytes;
use rand::RngExt;
use std::collections::BTreeMap;

/// Serial numbers and checkpoint ids start at a random value that
/// fits in 14 bits so they stay small on the wire.
pub fn random_serial() -> u64 {
    rand::rng().random_range(1..=0x3FFF)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Undefined,
    Transfer,
    Reporting,
    Cancelling,
}

/// A reception report waiting for its ack.
#[derive(Debug)]
pub struct ReportStatus {
    pub segment: ReportSegment,
    pub retries: u32,
    pub timer: Option<TimerHandle>,
}

/// A transmitted checkpoint waiting to be claimed.
#[derive(Debug, Default)]
pub struct CheckpointStatus {
    pub retries: u32,
    pub timer: Option<TimerHandle>,
}

/// A cancel we transmitted and still expect an ack for.
#[derive(Debug)]
pub struct CancelStatus {
    pub segment: CancelSegment,
    pub retries: u32,
    pub timer: Option<TimerHandle>,
}

pub struct Session {
    id: SessionId,
    role: SessionRole,
    state: SessionState,
    last_activity: u64,

    red: SegmentMap,
    green: SegmentMap,
    expected_red: u64,
    expected_green: u64,
    red_complete: bool,
    green_complete: bool,
    red_processed: bool,
    green_processed: bool,

    // receiver bookkeeping, keyed by report serial
    reports: BTreeMap<u64, ReportStatus>,
    report_batches: u32,
    next_report_serial: u64,

    // sender bookkeeping, keyed by checkpoint segment start byte
    checkpoints: BTreeMap<u64, CheckpointStatus>,
    next_checkpoint_id: u64,

    cancel: Option<CancelStatus>,
    inactivity_timer: Option<TimerHandle>,
}

impl Session {
    pub fn new(id: SessionId, role: SessionRole, now: u64) -> Self {
        Self {
            id,
            role,
            state: SessionState::Undefined,
            last_activity: now,
            red: SegmentMap::new(),
            green: SegmentMap::new(),
            expected_red: 0,
            expected_green: 0,
            red_complete: false,
            green_complete: false,
            red_processed: false,
            green_processed: false,
            reports: BTreeMap::new(),
            report_batches: 0,
            next_report_serial: random_serial(),
            checkpoints: BTreeMap::new(),
            next_checkpoint_id: random_serial(),
            cancel: None,
            inactivity_timer: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn is_cancelling(&self) -> bool {
        self.state == SessionState::Cancelling
    }

    pub fn touch(&mut self, now: u64) {
        self.last_activity = now;
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    // ── reception ──

    /// Stores an arriving data segment, updating the expected length.
    /// An end-of-block segment pins the expected length to its own
    /// stop byte even if overlap trimming shortened the stored copy.
    pub fn insert_data(&mut self, seg: DataSegment) -> InsertOutcome {
        let color = seg.color;
        let stop = seg.stop_byte();
        let eob = seg.end_of_block;

        let outcome = match color {
            Color::Red => self.red.insert(seg),
            Color::Green => self.green.insert(seg),
        };
        if outcome == InsertOutcome::Inserted {
            match color {
                Color::Red => {
                    self.expected_red = self.expected_red.max(self.red.highest_seen());
                    if eob {
                        self.red_complete = true;
                        self.expected_red = stop + 1;
                    }
                }
                Color::Green => {
                    self.expected_green = self.expected_green.max(self.green.highest_seen());
                    if eob {
                        self.green_complete = true;
                        self.expected_green = stop + 1;
                    }
                }
            }
        }
        outcome
    }

    pub fn red(&self) -> &SegmentMap {
        &self.red
    }

    pub fn red_mut(&mut self) -> &mut SegmentMap {
        &mut self.red
    }

    pub fn green(&self) -> &SegmentMap {
        &self.green
    }

    pub fn expected_red(&self) -> u64 {
        self.expected_red
    }

    pub fn expected_green(&self) -> u64 {
        self.expected_green
    }

    pub fn red_complete(&self) -> bool {
        self.red_complete
    }

    /// Bytes ready for delivery, once. `None` until the red part is
    /// complete and again after it was taken.
    pub fn red_full(&self) -> Option<u64> {
        if self.red_complete && !self.red_processed && self.red.bytes_received() == self.expected_red {
            Some(self.expected_red)
        } else {
            None
        }
    }

    pub fn green_full(&self) -> Option<u64> {
        if self.green_complete
            && !self.green_processed
            && self.green.bytes_received() == self.expected_green
        {
            Some(self.expected_green)
        } else {
            None
        }
    }

    /// Assembles the red part and marks it delivered. The stored
    /// segments stay behind for later report regeneration.
    pub fn take_red_block(&mut self) -> Bytes {
        debug_assert!(self.red_full().is_some());
        self.red_processed = true;
        self.red.assemble()
    }

    pub fn take_green_block(&mut self) -> Bytes {
        debug_assert!(self.green_full().is_some());
        self.green_processed = true;
        self.green.assemble()
    }

    pub fn data_processed(&self) -> bool {
        self.red_processed || self.green_processed
    }

    /// Drops all stored segments. Used when a session is abandoned.
    pub fn clear_segments(&mut self) {
        self.red.clear();
        self.green.clear();
    }

    // ── reporting ──

    /// Builds the reports answering a checkpoint and returns their
    /// serials in transmission order. Takes the single-claim shortcut
    /// when the red part is fully on hand.
    pub fn generate_reports(
        &mut self,
        checkpoint_id: u64,
        lower_bounds: u64,
        chkpt_upper_bounds: u64,
        segsize: usize,
    ) -> Vec<u64> {
        let plans = if self.red_complete && self.red.bytes_received() == self.expected_red {
            vec![plan_full(self.red.bytes_received())]
        } else {
            plan_reports(&self.red, lower_bounds, chkpt_upper_bounds, segsize)
        };

        let mut serials = Vec::with_capacity(plans.len());
        for plan in plans {
            let serial = self.next_report_serial;
            self.next_report_serial += 1;
            let segment = ReportSegment {
                header: SegmentHeader::new(self.id),
                report_serial: serial,
                checkpoint_id,
                upper_bounds: plan.upper_bounds,
                lower_bounds: plan.lower_bounds,
                claims: plan.claims,
            };
            self.reports.insert(serial, ReportStatus { segment, retries: 0, timer: None });
            serials.push(serial);
        }
        if !serials.is_empty() {
            self.report_batches += 1;
        }
        serials
    }

    /// How many report batches went out. Nonzero means data arriving
    /// now is a retransmission.
    pub fn report_batches(&self) -> u32 {
        self.report_batches
    }

    pub fn report(&self, serial: u64) -> Option<&ReportStatus> {
        self.reports.get(&serial)
    }

    pub fn report_mut(&mut self, serial: u64) -> Option<&mut ReportStatus> {
        self.reports.get_mut(&serial)
    }

    /// Serials of unacked reports answering the given checkpoint.
    pub fn reports_for_checkpoint(&self, checkpoint_id: u64) -> Vec<u64> {
        self.reports
            .values()
            .filter(|r| r.segment.checkpoint_id == checkpoint_id)
            .map(|r| r.segment.report_serial)
            .collect()
    }

    /// Lower bounds of the unacked report with this serial, for
    /// regenerating a superseded report over the same span.
    pub fn lower_bound_for_report_serial(&self, serial: u64) -> Option<u64> {
        self.reports.get(&serial).map(|r| r.segment.lower_bounds)
    }

    /// Removes an acked report, yielding its retransmit timer.
    pub fn ack_report(&mut self, serial: u64) -> Option<Option<TimerHandle>> {
        self.reports.remove(&serial).map(|status| status.timer)
    }

    pub fn has_unacked_reports(&self) -> bool {
        !self.reports.is_empty()
    }

    // ── checkpointing ──

    pub fn next_checkpoint_id(&mut self) -> u64 {
        let id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        id
    }

    pub fn arm_checkpoint(&mut self, start_byte: u64, timer: TimerHandle) {
        let status = self.checkpoints.entry(start_byte).or_default();
        status.timer = Some(timer);
    }

    pub fn checkpoint_status_mut(&mut self, start_byte: u64) -> Option<&mut CheckpointStatus> {
        self.checkpoints.get_mut(&start_byte)
    }

    /// Removes a claim's worth of outbound red data.
    pub fn claim_red(&mut self, offset: u64, length: u64) -> ClaimOutcome {
        self.red.remove_claim(offset, length)
    }

    /// Drops checkpoint bookkeeping for segments no longer stored,
    /// yielding the timers that must be cancelled.
    pub fn stale_checkpoint_timers(&mut self) -> Vec<TimerHandle> {
        let gone: Vec<u64> = self
            .checkpoints
            .keys()
            .copied()
            .filter(|start| self.red.get(*start).is_none())
            .collect();
        let mut handles = Vec::new();
        for start in gone {
            if let Some(status) = self.checkpoints.remove(&start) {
                handles.extend(status.timer);
            }
        }
        handles
    }

    // ── cancelling ──

    pub fn start_cancel(&mut self, segment: CancelSegment) {
        self.state = SessionState::Cancelling;
        self.cancel = Some(CancelStatus { segment, retries: 0, timer: None });
    }

    pub fn cancel_status(&self) -> Option<&CancelStatus> {
        self.cancel.as_ref()
    }

    pub fn cancel_status_mut(&mut self) -> Option<&mut CancelStatus> {
        self.cancel.as_mut()
    }

    // ── timers ──

    pub fn inactivity_timer(&self) -> Option<TimerHandle> {
        self.inactivity_timer
    }

    pub fn set_inactivity_timer(&mut self, timer: Option<TimerHandle>) {
        self.inactivity_timer = timer;
    }

    /// Hands back every timer the session still references. Callers
    /// cancel them before dropping the session.
    pub fn release_timers(&mut self) -> Vec<TimerHandle> {
        let mut handles = Vec::new();
        handles.extend(self.inactivity_timer.take());
        for status in self.reports.values_mut() {
            handles.extend(status.timer.take());
        }
        for status in self.checkpoints.values_mut() {
            handles.extend(status.timer.take());
        }
        if let Some(cancel) = self.cancel.as_mut() {
            handles.extend(cancel.timer.take());
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ReportClaim, SERVICE_ID_SINGLE};

    fn sid() -> SessionId {
        SessionId::new(3, 9)
    }

    fn data(offset: u64, len: usize) -> DataSegment {
        DataSegment::new(sid(), SERVICE_ID_SINGLE, Color::Red, offset, Bytes::from(vec![0x11; len]))
    }

    #[test]
    fn expected_length_follows_highest_insert_until_eob() {
        let mut s = Session::new(sid(), SessionRole::Receiver, 0);
        s.insert_data(data(0, 10));
        assert_eq!(s.expected_red(), 10);
        s.insert_data(data(20, 10));
        assert_eq!(s.expected_red(), 30);

        let eob = data(10, 10).with_checkpoint(1, 0).with_end_of_block();
        s.insert_data(eob);
        assert_eq!(s.expected_red(), 30);
        assert!(s.red_complete());
    }

    #[test]
    fn red_block_delivered_once() {
        let mut s = Session::new(sid(), SessionRole::Receiver, 0);
        s.insert_data(data(0, 10));
        assert_eq!(s.red_full(), None);

        let eob = data(10, 5).with_checkpoint(1, 0).with_end_of_block();
        s.insert_data(eob);
        assert_eq!(s.red_full(), Some(15));

        let block = s.take_red_block();
        assert_eq!(block.len(), 15);
        assert!(s.data_processed());
        assert_eq!(s.red_full(), None);

        // segments stay behind for later reports
        assert_eq!(s.red().len(), 2);
    }

    #[test]
    fn report_serials_start_random_and_increment() {
        let mut s = Session::new(sid(), SessionRole::Receiver, 0);
        s.insert_data(data(0, 10));
        let first = s.generate_reports(5, 0, 10, 1400);
        assert_eq!(first.len(), 1);
        assert!((1..=0x3FFF).contains(&first[0]));

        s.insert_data(data(20, 10));
        let second = s.generate_reports(6, 0, 30, 1400);
        assert_eq!(second[0], first[0] + 1);
        assert_eq!(s.report_batches(), 2);
    }

    #[test]
    fn full_red_part_takes_single_claim_shortcut() {
        let mut s = Session::new(sid(), SessionRole::Receiver, 0);
        s.insert_data(data(0, 10));
        s.insert_data(data(10, 10).with_checkpoint(1, 0).with_end_of_block());

        let serials = s.generate_reports(1, 0, 20, 1400);
        assert_eq!(serials.len(), 1);
        let status = s.report(serials[0]).expect("report should be tracked");
        assert_eq!(status.segment.claims, vec![ReportClaim::new(0, 20)]);
        assert_eq!(status.segment.upper_bounds, 20);
    }

    #[test]
    fn reports_tracked_until_acked() {
        let mut s = Session::new(sid(), SessionRole::Receiver, 0);
        s.insert_data(data(0, 10));
        let serials = s.generate_reports(7, 0, 10, 1400);
        let serial = serials[0];

        assert_eq!(s.reports_for_checkpoint(7), vec![serial]);
        assert_eq!(s.lower_bound_for_report_serial(serial), Some(0));
        assert!(s.has_unacked_reports());

        assert!(s.ack_report(serial).is_some());
        assert!(!s.has_unacked_reports());
        assert_eq!(s.ack_report(serial), None);
    }

    #[test]
    fn checkpoint_ids_increment() {
        let mut s = Session::new(sid(), SessionRole::Sender, 0);
        let a = s.next_checkpoint_id();
        let b = s.next_checkpoint_id();
        assert_eq!(b, a + 1);
        assert!((1..=0x3FFF).contains(&a));
    }

    #[test]
    fn stale_checkpoint_bookkeeping_released_after_claim() {
        let mut s = Session::new(sid(), SessionRole::Sender, 0);
        let mut cp = data(10, 10);
        cp.checkpoint = true;
        s.red_mut().insert_unchecked(data(0, 10));
        s.red_mut().insert_unchecked(cp);

        assert_eq!(
            s.claim_red(10, 10),
            ClaimOutcome::Removed { claimed_checkpoint: true }
        );
        // bookkeeping without a timer still gets dropped
        s.checkpoints.insert(10, CheckpointStatus::default());
        assert!(s.stale_checkpoint_timers().is_empty());
        assert!(s.checkpoints.is_empty());
    }
}
