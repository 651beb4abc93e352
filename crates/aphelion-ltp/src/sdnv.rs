//! Self-Delimiting Numeric Values, the variable-length integer encoding
//! behind every multi-byte field in the segment wire format.
//!
//! Each octet carries seven value bits, most significant group first.
//! Bit 7 is the continuation flag, set on every octet except the last:
//!
//! ```text
//!   4660 (0x1234)
//!   ┌─────────────┬─────────────┐
//!   │ 1  0100100  │ 0  0110100  │   =>  0xA4 0x34
//!   └─────────────┴─────────────┘
//!     ^ continue     ^ last octet
//! ```
//!
//! A `u64` never needs more than ten octets. Decoding rejects runs
//! longer than that and values that would overflow 64 bits.

use bytes::{Buf, BufMut};
use std::fmt;

/// Longest legal encoding of a single value.
pub const MAX_SDNV_LEN: usize = 10;

/// A number carried on the wire as an SDNV.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sdnv(u64);

impl Sdnv {
    pub fn new(value: u64) -> Self {
        Sdnv(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of octets `encode` will write.
    pub fn encoded_len(self) -> usize {
        let bits = 64 - self.0.leading_zeros() as usize;
        bits.div_ceil(7).max(1)
    }

    /// Appends the encoding to `buf`.
    pub fn encode(self, buf: &mut impl BufMut) {
        let mut groups = self.encoded_len();
        while groups > 1 {
            groups -= 1;
            buf.put_u8(0x80 | ((self.0 >> (groups * 7)) as u8 & 0x7F));
        }
        buf.put_u8(self.0 as u8 & 0x7F);
    }

    /// Reads one value. Returns `None` on truncation, on a run past
    /// [`MAX_SDNV_LEN`] octets and on 64-bit overflow.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let mut value: u64 = 0;
        for _ in 0..MAX_SDNV_LEN {
            if !buf.has_remaining() {
                return None;
            }
            let octet = buf.get_u8();
            if value > u64::MAX >> 7 {
                return None;
            }
            value = (value << 7) | u64::from(octet & 0x7F);
            if octet & 0x80 == 0 {
                return Some(Sdnv(value));
            }
        }
        None
    }
}

impl fmt::Debug for Sdnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sdnv({})", self.0)
    }
}

impl fmt::Display for Sdnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for Sdnv {
    fn from(v: u64) -> Self {
        Sdnv(v)
    }
}

impl From<u32> for Sdnv {
    fn from(v: u32) -> Self {
        Sdnv(u64::from(v))
    }
}

impl From<Sdnv> for u64 {
    fn from(s: Sdnv) -> u64 {
        s.0
    }
}
