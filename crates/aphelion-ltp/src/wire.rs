//! Segment model and codec.
//!
//! Every datagram carries exactly one segment. The first octet splits
//! into a version nibble (always zero) and a control nibble that
//! selects the variant and its flags:
//!
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 ...
//! +-------+-------+----------------+----------------+--------+-----
//! | vers  | ctrl  | engine id SDNV | session # SDNV | exts   | body
//! +-------+-------+----------------+----------------+--------+-----
//!                                                    ^ header count
//!                                                      in the high
//!                                                      nibble, trailer
//!                                                      count in the low
//! ```
//!
//! Control nibbles 0..=7 are data segments. The EXC bit (0x4) selects
//! green; for red data the low bits mark checkpoint and end of block,
//! for green only 0x7 (end of block) is meaningful. 0x8 is a report,
//! 0x9 a report ack, 0xC/0xE cancels from the block sender and block
//! receiver, 0xD/0xF the matching cancel acks. 0xA, 0xB and the green
//! nibbles 0x5, 0x6 are reserved and rejected.
//!
//! All decoders return `None` on truncated or malformed input and
//! never panic on foreign bytes.

use crate::sdnv::Sdnv;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Protocol version carried in the high nibble of the first octet.
pub const LTP_VERSION: u8 = 0;

/// Extension tag for the authentication header and trailer.
pub const EXT_TAG_AUTH: u8 = 0x00;

/// Client service id for a block holding a single SDU.
pub const SERVICE_ID_SINGLE: u64 = 1;

/// Client service id for an aggregate block holding several SDUs.
pub const SERVICE_ID_AGGREGATE: u64 = 2;

/// Sanity bound on decoded report claims. Generation never comes
/// close to this; anything above it is a malformed segment.
pub const MAX_REPORT_CLAIMS: usize = 4096;

// ─── Session Identity ───────────────────────────────────────────────────────

/// Identifies one block transfer: the originating engine's number and
/// a session number unique within that engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub engine_id: u64,
    pub session_id: u64,
}

impl SessionId {
    pub fn new(engine_id: u64, session_id: u64) -> Self {
        Self { engine_id, session_id }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.engine_id, self.session_id)
    }
}

// ─── Colors, Cancel Codes, Sides ────────────────────────────────────────────

/// Transmission color. Red data is acknowledged and retransmitted,
/// green data is best effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Green,
}

/// Reason code carried in a cancel segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CancelReason {
    UserCancelled = 0,
    Unreachable = 1,
    RetransmitLimit = 2,
    Miscolored = 3,
    SystemCancelled = 4,
    RetransmitCycleLimit = 5,
}

impl CancelReason {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::UserCancelled),
            1 => Some(Self::Unreachable),
            2 => Some(Self::RetransmitLimit),
            3 => Some(Self::Miscolored),
            4 => Some(Self::SystemCancelled),
            5 => Some(Self::RetransmitCycleLimit),
            _ => None,
        }
    }
}

/// Which side of the transfer a cancel originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSide {
    BlockSender,
    BlockReceiver,
}

// ─── Header and Extensions ──────────────────────────────────────────────────

/// Authentication parameters from header extension 0x00.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthParams {
    pub cipher_suite: u8,
    pub key_id: Option<u64>,
}

/// Opaque tag/value pair from the trailer extension block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailerExtension {
    pub tag: u8,
    pub data: Bytes,
}

/// Fields common to every segment variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub session: SessionId,
    pub auth: Option<AuthParams>,
    pub trailer: Vec<TrailerExtension>,
}

impl SegmentHeader {
    pub fn new(session: SessionId) -> Self {
        Self { session, auth: None, trailer: Vec::new() }
    }

    /// Octets the trailer block occupies at the end of the encoded
    /// segment. Lets a caller locate the signed span of a datagram.
    pub fn trailer_len(&self) -> usize {
        self.trailer
            .iter()
            .map(|e| 1 + Sdnv::new(e.data.len() as u64).encoded_len() + e.data.len())
            .sum()
    }

    fn encode(&self, ctrl: u8, buf: &mut BytesMut) {
        buf.put_u8((LTP_VERSION << 4) | (ctrl & 0x0F));
        Sdnv::new(self.session.engine_id).encode(buf);
        Sdnv::new(self.session.session_id).encode(buf);
        let header_count = u8::from(self.auth.is_some());
        buf.put_u8((header_count << 4) | (self.trailer.len() as u8 & 0x0F));
        if let Some(auth) = &self.auth {
            buf.put_u8(EXT_TAG_AUTH);
            let body_len = 1 + auth.key_id.map_or(0, |id| Sdnv::new(id).encoded_len());
            Sdnv::new(body_len as u64).encode(buf);
            buf.put_u8(auth.cipher_suite);
            if let Some(id) = auth.key_id {
                Sdnv::new(id).encode(buf);
            }
        }
    }

    fn encode_trailer(&self, buf: &mut BytesMut) {
        for ext in &self.trailer {
            buf.put_u8(ext.tag);
            Sdnv::new(ext.data.len() as u64).encode(buf);
            buf.put_slice(&ext.data);
        }
    }

    /// Parses the version octet, session ids and header extensions.
    /// Returns the header, the control nibble and the trailer
    /// extension count for the caller to consume after the body.
    fn decode(buf: &mut impl Buf) -> Option<(Self, u8, usize)> {
        if !buf.has_remaining() {
            return None;
        }
        let first = buf.get_u8();
        if first >> 4 != LTP_VERSION {
            return None;
        }
        let ctrl = first & 0x0F;

        let engine_id = Sdnv::decode(buf)?.value();
        let session_id = Sdnv::decode(buf)?.value();

        if !buf.has_remaining() {
            return None;
        }
        let ext_counts = buf.get_u8();
        let header_count = (ext_counts >> 4) as usize;
        let trailer_count = (ext_counts & 0x0F) as usize;

        let mut auth = None;
        for _ in 0..header_count {
            if !buf.has_remaining() {
                return None;
            }
            let tag = buf.get_u8();
            let len = Sdnv::decode(buf)?.value();
            if len > buf.remaining() as u64 {
                return None;
            }
            let len = len as usize;
            if tag == EXT_TAG_AUTH && len >= 1 {
                let mut body = buf.copy_to_bytes(len);
                let cipher_suite = body.get_u8();
                let key_id = if body.has_remaining() {
                    Some(Sdnv::decode(&mut body)?.value())
                } else {
                    None
                };
                auth = Some(AuthParams { cipher_suite, key_id });
            } else {
                // unknown extension, skip its length octets
                buf.advance(len);
            }
        }

        let header = SegmentHeader {
            session: SessionId::new(engine_id, session_id),
            auth,
            trailer: Vec::new(),
        };
        Some((header, ctrl, trailer_count))
    }

    fn decode_trailer(&mut self, buf: &mut impl Buf, count: usize) -> Option<()> {
        for _ in 0..count {
            if !buf.has_remaining() {
                return None;
            }
            let tag = buf.get_u8();
            let len = Sdnv::decode(buf)?.value();
            if len > buf.remaining() as u64 {
                return None;
            }
            self.trailer.push(TrailerExtension { tag, data: buf.copy_to_bytes(len as usize) });
        }
        Some(())
    }
}

// ─── Data Segment ───────────────────────────────────────────────────────────

/// One contiguous run of block bytes.
///
/// The payload is never empty. For red data the checkpoint flag makes
/// `checkpoint_id` and `report_serial` meaningful: the serial names
/// the report that solicited this (re)transmission, zero for an
/// unsolicited checkpoint. Green data carries neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub header: SegmentHeader,
    pub service_id: u64,
    pub color: Color,
    pub checkpoint: bool,
    pub end_of_block: bool,
    pub offset: u64,
    pub checkpoint_id: u64,
    pub report_serial: u64,
    pub payload: Bytes,
}

impl DataSegment {
    pub fn new(session: SessionId, service_id: u64, color: Color, offset: u64, payload: Bytes) -> Self {
        debug_assert!(!payload.is_empty());
        Self {
            header: SegmentHeader::new(session),
            service_id,
            color,
            checkpoint: false,
            end_of_block: false,
            offset,
            checkpoint_id: 0,
            report_serial: 0,
            payload,
        }
    }

    /// Marks a red segment as a checkpoint soliciting a report.
    pub fn with_checkpoint(mut self, checkpoint_id: u64, report_serial: u64) -> Self {
        self.checkpoint = true;
        self.checkpoint_id = checkpoint_id;
        self.report_serial = report_serial;
        self
    }

    /// Marks the block's last segment. A red end of block is always a
    /// checkpoint on the wire, so the flag is normalized here.
    pub fn with_end_of_block(mut self) -> Self {
        self.end_of_block = true;
        if self.color == Color::Red {
            self.checkpoint = true;
        }
        self
    }

    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn start_byte(&self) -> u64 {
        self.offset
    }

    /// Offset of the last payload byte. The payload is non-empty and
    /// decoding rejects extents past `u64::MAX`, so this cannot wrap.
    pub fn stop_byte(&self) -> u64 {
        self.offset + self.payload.len() as u64 - 1
    }

    fn ctrl(&self) -> u8 {
        match self.color {
            Color::Red => {
                if self.end_of_block {
                    0x3
                } else if self.checkpoint {
                    0x1
                } else {
                    0x0
                }
            }
            Color::Green => {
                if self.end_of_block {
                    0x7
                } else {
                    0x4
                }
            }
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(self.ctrl(), buf);
        Sdnv::new(self.service_id).encode(buf);
        Sdnv::new(self.offset).encode(buf);
        Sdnv::new(self.payload.len() as u64).encode(buf);
        if self.color == Color::Red && self.checkpoint {
            Sdnv::new(self.checkpoint_id).encode(buf);
            Sdnv::new(self.report_serial).encode(buf);
        }
        buf.put_slice(&self.payload);
        self.header.encode_trailer(buf);
    }

    fn decode_body(header: SegmentHeader, ctrl: u8, buf: &mut impl Buf) -> Option<Self> {
        let (color, checkpoint, end_of_block) = match ctrl {
            0x0 => (Color::Red, false, false),
            // 0x2 is checkpoint plus end of red part without end of block
            0x1 | 0x2 => (Color::Red, true, false),
            0x3 => (Color::Red, true, true),
            0x4 => (Color::Green, false, false),
            0x7 => (Color::Green, false, true),
            _ => return None,
        };

        let service_id = Sdnv::decode(buf)?.value();
        let offset = Sdnv::decode(buf)?.value();
        let length = Sdnv::decode(buf)?.value();
        if length == 0 {
            return None;
        }
        // the segment's extent must stay inside the block offset space
        offset.checked_add(length)?;
        let (checkpoint_id, report_serial) = if checkpoint {
            (Sdnv::decode(buf)?.value(), Sdnv::decode(buf)?.value())
        } else {
            (0, 0)
        };
        if length > buf.remaining() as u64 {
            return None;
        }
        let payload = buf.copy_to_bytes(length as usize);

        Some(DataSegment {
            header,
            service_id,
            color,
            checkpoint,
            end_of_block,
            offset,
            checkpoint_id,
            report_serial,
            payload,
        })
    }
}

// ─── Report Segment ─────────────────────────────────────────────────────────

/// One claimed byte range. Offsets are absolute block offsets in
/// memory and relative to the report's lower bounds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportClaim {
    pub offset: u64,
    pub length: u64,
}

impl ReportClaim {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// First byte past the claim.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Reception report answering a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSegment {
    pub header: SegmentHeader,
    pub report_serial: u64,
    pub checkpoint_id: u64,
    pub upper_bounds: u64,
    pub lower_bounds: u64,
    pub claims: Vec<ReportClaim>,
}

impl ReportSegment {
    pub fn claimed_bytes(&self) -> u64 {
        self.claims.iter().map(|c| c.length).sum()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(0x8, buf);
        Sdnv::new(self.report_serial).encode(buf);
        Sdnv::new(self.checkpoint_id).encode(buf);
        Sdnv::new(self.upper_bounds).encode(buf);
        Sdnv::new(self.lower_bounds).encode(buf);
        Sdnv::new(self.claims.len() as u64).encode(buf);
        for claim in &self.claims {
            debug_assert!(claim.offset >= self.lower_bounds);
            Sdnv::new(claim.offset - self.lower_bounds).encode(buf);
            Sdnv::new(claim.length).encode(buf);
        }
        self.header.encode_trailer(buf);
    }

    fn decode_body(header: SegmentHeader, buf: &mut impl Buf) -> Option<Self> {
        let report_serial = Sdnv::decode(buf)?.value();
        let checkpoint_id = Sdnv::decode(buf)?.value();
        let upper_bounds = Sdnv::decode(buf)?.value();
        let lower_bounds = Sdnv::decode(buf)?.value();
        let count = Sdnv::decode(buf)?.value();
        if count as usize > MAX_REPORT_CLAIMS {
            return None;
        }
        let mut claims = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let relative = Sdnv::decode(buf)?.value();
            let length = Sdnv::decode(buf)?.value();
            claims.push(ReportClaim::new(lower_bounds + relative, length));
        }
        Some(ReportSegment { header, report_serial, checkpoint_id, upper_bounds, lower_bounds, claims })
    }
}

// ─── Report Ack, Cancel, Cancel Ack ─────────────────────────────────────────

/// Acknowledges one reception report by serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportAckSegment {
    pub header: SegmentHeader,
    pub report_serial: u64,
}

impl ReportAckSegment {
    pub fn new(session: SessionId, report_serial: u64) -> Self {
        Self { header: SegmentHeader::new(session), report_serial }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(0x9, buf);
        Sdnv::new(self.report_serial).encode(buf);
        self.header.encode_trailer(buf);
    }

    fn decode_body(header: SegmentHeader, buf: &mut impl Buf) -> Option<Self> {
        let report_serial = Sdnv::decode(buf)?.value();
        Some(ReportAckSegment { header, report_serial })
    }
}

/// Aborts a session. `by` names the side giving up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelSegment {
    pub header: SegmentHeader,
    pub by: CancelSide,
    pub reason: CancelReason,
}

impl CancelSegment {
    pub fn new(session: SessionId, by: CancelSide, reason: CancelReason) -> Self {
        Self { header: SegmentHeader::new(session), by, reason }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let ctrl = match self.by {
            CancelSide::BlockSender => 0xC,
            CancelSide::BlockReceiver => 0xE,
        };
        self.header.encode(ctrl, buf);
        buf.put_u8(self.reason as u8);
        self.header.encode_trailer(buf);
    }

    fn decode_body(header: SegmentHeader, by: CancelSide, buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let reason = CancelReason::from_byte(buf.get_u8())?;
        Some(CancelSegment { header, by, reason })
    }
}

/// Acknowledges a cancel. `by` names the side whose cancel this
/// answers, so the ack travels toward that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelAckSegment {
    pub header: SegmentHeader,
    pub by: CancelSide,
}

impl CancelAckSegment {
    pub fn new(session: SessionId, by: CancelSide) -> Self {
        Self { header: SegmentHeader::new(session), by }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let ctrl = match self.by {
            CancelSide::BlockSender => 0xD,
            CancelSide::BlockReceiver => 0xF,
        };
        self.header.encode(ctrl, buf);
        self.header.encode_trailer(buf);
    }
}

// ─── Segment ────────────────────────────────────────────────────────────────

/// Any segment the codec understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Data(DataSegment),
    Report(ReportSegment),
    ReportAck(ReportAckSegment),
    Cancel(CancelSegment),
    CancelAck(CancelAckSegment),
}

impl Segment {
    /// Parses one segment from `buf`, trailer extensions included.
    pub fn decode(buf: &mut impl Buf) -> Option<Segment> {
        let (header, ctrl, trailer_count) = SegmentHeader::decode(buf)?;
        let mut segment = match ctrl {
            0x0..=0x7 => Segment::Data(DataSegment::decode_body(header, ctrl, buf)?),
            0x8 => Segment::Report(ReportSegment::decode_body(header, buf)?),
            0x9 => Segment::ReportAck(ReportAckSegment::decode_body(header, buf)?),
            0xC => Segment::Cancel(CancelSegment::decode_body(header, CancelSide::BlockSender, buf)?),
            0xD => Segment::CancelAck(CancelAckSegment { header, by: CancelSide::BlockSender }),
            0xE => Segment::Cancel(CancelSegment::decode_body(header, CancelSide::BlockReceiver, buf)?),
            0xF => Segment::CancelAck(CancelAckSegment { header, by: CancelSide::BlockReceiver }),
            // 0xA and 0xB are reserved
            _ => return None,
        };
        segment.header_mut().decode_trailer(buf, trailer_count)?;
        Some(segment)
    }

    /// Encodes into a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = match self {
            Segment::Data(ds) => BytesMut::with_capacity(64 + ds.payload.len()),
            _ => BytesMut::with_capacity(64),
        };
        match self {
            Segment::Data(ds) => ds.encode(&mut buf),
            Segment::Report(rs) => rs.encode(&mut buf),
            Segment::ReportAck(ras) => ras.encode(&mut buf),
            Segment::Cancel(cs) => cs.encode(&mut buf),
            Segment::CancelAck(cas) => cas.encode(&mut buf),
        }
        buf
    }

    pub fn session(&self) -> SessionId {
        self.header().session
    }

    pub fn header(&self) -> &SegmentHeader {
        match self {
            Segment::Data(ds) => &ds.header,
            Segment::Report(rs) => &rs.header,
            Segment::ReportAck(ras) => &ras.header,
            Segment::Cancel(cs) => &cs.header,
            Segment::CancelAck(cas) => &cas.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut SegmentHeader {
        match self {
            Segment::Data(ds) => &mut ds.header,
            Segment::Report(rs) => &mut rs.header,
            Segment::ReportAck(ras) => &mut ras.header,
            Segment::Cancel(cs) => &mut cs.header,
            Segment::CancelAck(cas) => &mut cas.header,
        }
    }

    /// Short name for log lines.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Segment::Data(_) => "DS",
            Segment::Report(_) => "RS",
            Segment::ReportAck(_) => "RAS",
            Segment::Cancel(cs) => match cs.by {
                CancelSide::BlockSender => "CS-sender",
                CancelSide::BlockReceiver => "CS-receiver",
            },
            Segment::CancelAck(cas) => match cas.by {
                CancelSide::BlockSender => "CAS-sender",
                CancelSide::BlockReceiver => "CAS-receiver",
            },
        }
    }

    /// True when the segment was emitted by the block sender's side
    /// of the session, which means the receiving engine handles it.
    pub fn from_block_sender(&self) -> bool {
        match self {
            Segment::Data(_) => true,
            Segment::Report(_) => false,
            Segment::ReportAck(_) => true,
            Segment::Cancel(cs) => cs.by == CancelSide::BlockSender,
            Segment::CancelAck(cas) => cas.by == CancelSide::BlockReceiver,
        }
    }
}
