//! Segment authentication.
//!
//! An authenticated segment carries its cipher suite and key id in
//! header extension 0x00 and the signature as the final trailer
//! extension, so the signed span is the whole datagram up to the
//! signature octets. The engines stay unaware of authentication; the
//! node seals outbound datagrams after encoding and verifies inbound
//! ones right after decoding.

use crate::wire::{AuthParams, Segment, TrailerExtension, EXT_TAG_AUTH};
use bytes::{Bytes, BytesMut};

/// Ciphersuite byte for HMAC-SHA1.
pub const SUITE_HMAC_SHA1: u8 = 0;
/// Ciphersuite byte for RSA-SHA256.
pub const SUITE_RSA_SHA256: u8 = 1;
/// Ciphersuite byte for the null suite.
pub const SUITE_NULL: u8 = 255;

/// Signs and checks segment bytes. Implementations supply the wire
/// identifiers and the signature primitive; framing is handled here.
pub trait Authenticator: Send {
    fn cipher_suite(&self) -> u8;

    fn key_id(&self) -> Option<u64>;

    /// Signature length in octets. Fixed per suite and key.
    fn signature_len(&self) -> usize;

    fn sign(&self, signed: &[u8]) -> Vec<u8>;

    fn verify(&self, signed: &[u8], signature: &[u8]) -> bool {
        self.sign(signed) == signature
    }
}

/// Null suite. The signature is a single zero octet, giving the
/// framing without any cryptographic protection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuth;

impl Authenticator for NullAuth {
    fn cipher_suite(&self) -> u8 {
        SUITE_NULL
    }

    fn key_id(&self) -> Option<u64> {
        None
    }

    fn signature_len(&self) -> usize {
        1
    }

    fn sign(&self, _signed: &[u8]) -> Vec<u8> {
        vec![0]
    }
}

/// Encodes `segment` with authentication extensions and returns the
/// sealed datagram. The segment is updated in place so it matches the
/// bytes on the wire.
pub fn seal(segment: &mut Segment, auth: &dyn Authenticator) -> BytesMut {
    let header = segment.header_mut();
    header.auth = Some(AuthParams { cipher_suite: auth.cipher_suite(), key_id: auth.key_id() });
    header.trailer.retain(|ext| ext.tag != EXT_TAG_AUTH);
    header.trailer.push(TrailerExtension {
        tag: EXT_TAG_AUTH,
        data: Bytes::from(vec![0u8; auth.signature_len()]),
    });

    let mut buf = segment.encode();
    let signed_end = buf.len() - auth.signature_len();
    let signature = auth.sign(&buf[..signed_end]);
    debug_assert_eq!(signature.len(), auth.signature_len());
    buf[signed_end..].copy_from_slice(&signature);

    if let Some(ext) = segment.header_mut().trailer.last_mut() {
        ext.data = Bytes::from(signature);
    }
    buf
}

/// Checks a decoded segment against the raw datagram it came from.
/// Fails when the auth trailer is missing, the advertised suite does
/// not match, or the signature does not check out.
pub fn verify(raw: &[u8], segment: &Segment, auth: &dyn Authenticator) -> bool {
    if segment.header().auth.map(|params| params.cipher_suite) != Some(auth.cipher_suite()) {
        return false;
    }
    let Some(ext) = segment.header().trailer.iter().rev().find(|ext| ext.tag == EXT_TAG_AUTH)
    else {
        return false;
    };
    if ext.data.len() != auth.signature_len() || raw.len() < ext.data.len() {
        return false;
    }
    let signed = &raw[..raw.len() - ext.data.len()];
    auth.verify(signed, &ext.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Color, DataSegment, SessionId, SERVICE_ID_SINGLE};
    use bytes::Buf;

    /// One-octet XOR checksum, enough to catch flipped bytes in tests.
    struct XorAuth;

    impl Authenticator for XorAuth {
        fn cipher_suite(&self) -> u8 {
            SUITE_HMAC_SHA1
        }

        fn key_id(&self) -> Option<u64> {
            Some(7)
        }

        fn signature_len(&self) -> usize {
            1
        }

        fn sign(&self, signed: &[u8]) -> Vec<u8> {
            vec![signed.iter().fold(0u8, |acc, b| acc ^ b)]
        }
    }

    fn segment() -> Segment {
        Segment::Data(DataSegment::new(
            SessionId::new(11, 42),
            SERVICE_ID_SINGLE,
            Color::Red,
            0,
            Bytes::from_static(b"sealed payload"),
        ))
    }

    fn decode(raw: &[u8]) -> Segment {
        let mut buf = raw;
        Segment::decode(&mut buf).expect("sealed bytes should decode")
    }

    #[test]
    fn sealed_segment_decodes_and_verifies() {
        let mut seg = segment();
        let raw = seal(&mut seg, &NullAuth);

        let decoded = decode(&raw);
        let params = decoded.header().auth.expect("auth params should survive the codec");
        assert_eq!(params.cipher_suite, SUITE_NULL);
        assert_eq!(params.key_id, None);
        assert!(verify(&raw, &decoded, &NullAuth));
    }

    #[test]
    fn key_id_rides_the_header_extension() {
        let mut seg = segment();
        let raw = seal(&mut seg, &XorAuth);

        let decoded = decode(&raw);
        let params = decoded.header().auth.expect("auth params should survive the codec");
        assert_eq!(params.cipher_suite, SUITE_HMAC_SHA1);
        assert_eq!(params.key_id, Some(7));
        assert!(verify(&raw, &decoded, &XorAuth));
    }

    #[test]
    fn unsealed_segment_fails_verification() {
        let seg = segment();
        let raw = seg.encode();
        let decoded = decode(&raw);
        assert!(!verify(&raw, &decoded, &NullAuth));
    }

    #[test]
    fn tampered_payload_detected() {
        let mut seg = segment();
        let mut raw = seal(&mut seg, &XorAuth);

        // flip one payload byte; the segment still decodes
        let n = raw.len();
        raw[n - 4] ^= 0xFF;
        let decoded = decode(&raw);
        assert!(!verify(&raw, &decoded, &XorAuth));
    }

    #[test]
    fn suite_mismatch_rejected() {
        let mut seg = segment();
        let raw = seal(&mut seg, &XorAuth);
        let decoded = decode(&raw);
        assert!(!verify(&raw, &decoded, &NullAuth));
    }

    #[test]
    fn resealing_replaces_the_signature_trailer() {
        let mut seg = segment();
        let first = seal(&mut seg, &NullAuth);
        let second = seal(&mut seg, &NullAuth);
        assert_eq!(first, second);
        assert_eq!(seg.header().trailer.len(), 1);
    }

    #[test]
    fn sealed_segment_matches_in_memory_form() {
        let mut seg = segment();
        let raw = seal(&mut seg, &XorAuth);
        let mut cursor = &raw[..];
        let decoded = Segment::decode(&mut cursor).expect("sealed bytes should decode");
        assert!(!cursor.has_remaining());
        assert_eq!(decoded, seg);
    }
}
