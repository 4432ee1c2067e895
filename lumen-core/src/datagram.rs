//! Datagram wire format, packetization and MTU-derived payload sizing.
//!
//! Header layout, 17 bytes, all multi-byte fields **big-endian**:
//!
//! ```text
//! Offset  Size  Field
//! ──────  ────  ──────────────
//!   0       4   frame_id    (u32)
//!   4       1   frame_type  (u8: 0 = Unknown, 1 = Key, 2 = NonKey)
//!   5       2   frag_id     (u16)
//!   7       2   frag_cnt    (u16)
//!   9       8   send_ts     (u64, µs since the Unix epoch)
//! ──────  ────  ──────────────
//!  17       …   payload
//! ```
//!
//! The retransmission bookkeeping fields (`num_rtx`, `last_send_ts`)
//! exist only on the sender and never hit the wire.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::LumenError;

/// Fixed size of the on-wire datagram header.
pub const HEADER_SIZE: usize = 17;

/// IPv4 + UDP header overhead subtracted from the MTU.
const IP_UDP_OVERHEAD: usize = 28;

/// MTU assumed until [`set_mtu`] is called.
const DEFAULT_MTU: usize = 1500;

/// Per-datagram payload budget, set once at startup and read lock-free
/// by every packetizer thereafter.
static MAX_PAYLOAD: AtomicUsize =
    AtomicUsize::new(DEFAULT_MTU - IP_UDP_OVERHEAD - HEADER_SIZE);

/// Derive the per-datagram payload budget from the path MTU.
///
/// Call once at startup, before any packetization.
pub fn set_mtu(mtu: usize) -> Result<(), LumenError> {
    if !(512..=1500).contains(&mtu) {
        return Err(LumenError::Config(format!(
            "reasonable MTU is between 512 and 1500 bytes, got {mtu}"
        )));
    }

    MAX_PAYLOAD.store(mtu - IP_UDP_OVERHEAD - HEADER_SIZE, Ordering::Relaxed);
    Ok(())
}

/// Maximum payload bytes a single datagram may carry.
pub fn max_payload() -> usize {
    MAX_PAYLOAD.load(Ordering::Relaxed)
}

// ── FrameType ────────────────────────────────────────────────────

/// Frame type carried in the datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Unknown = 0,
    /// Self-contained frame decodable without reference to any prior
    /// frame.
    Key = 1,
    NonKey = 2,
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value {
            1 => FrameType::Key,
            2 => FrameType::NonKey,
            _ => FrameType::Unknown,
        }
    }
}

/// Sequence number of a datagram: `(frame_id, frag_id)`, ordered
/// lexicographically.
pub type SeqNum = (u32, u16);

// ── Datagram ─────────────────────────────────────────────────────

/// One MTU-sized fragment of a compressed video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub frame_id: u32,
    pub frame_type: FrameType,
    /// Fragment index within the frame (`< frag_cnt`).
    pub frag_id: u16,
    /// Total fragments in this frame (≥ 1).
    pub frag_cnt: u16,
    /// Microseconds since the Unix epoch, stamped at transmission time.
    pub send_ts: u64,
    pub payload: Bytes,

    /// Times this datagram has been retransmitted (sender only).
    pub num_rtx: u32,
    /// Last transmission timestamp (sender only).
    pub last_send_ts: u64,
}

impl Datagram {
    pub fn new(
        frame_id: u32,
        frame_type: FrameType,
        frag_id: u16,
        frag_cnt: u16,
        payload: Bytes,
    ) -> Self {
        Self {
            frame_id,
            frame_type,
            frag_id,
            frag_cnt,
            send_ts: 0,
            payload,
            num_rtx: 0,
            last_send_ts: 0,
        }
    }

    /// Sequence number identifying this datagram.
    pub fn seq_num(&self) -> SeqNum {
        (self.frame_id, self.frag_id)
    }

    /// Split one encoded frame into MTU-sized datagrams.
    ///
    /// Produces `frame_size / (max_payload + 1) + 1` fragments; every
    /// fragment except the last carries exactly [`max_payload`] bytes
    /// and the last carries the remainder. Fragment payloads are
    /// zero-copy slices of `payload`.
    pub fn packetize(
        frame_id: u32,
        frame_type: FrameType,
        payload: Bytes,
    ) -> Result<Vec<Datagram>, LumenError> {
        Self::packetize_with(max_payload(), frame_id, frame_type, payload)
    }

    fn packetize_with(
        max_payload: usize,
        frame_id: u32,
        frame_type: FrameType,
        payload: Bytes,
    ) -> Result<Vec<Datagram>, LumenError> {
        let frame_size = payload.len();
        let frag_cnt = frame_size / (max_payload + 1) + 1;

        if frag_cnt > usize::from(u16::MAX) {
            return Err(LumenError::TooManyFragments { frame_size, frag_cnt });
        }

        let mut datagrams = Vec::with_capacity(frag_cnt);
        for frag_id in 0..frag_cnt {
            let start = frag_id * max_payload;
            let end = if frag_id + 1 < frag_cnt {
                start + max_payload
            } else {
                frame_size
            };

            datagrams.push(Datagram::new(
                frame_id,
                frame_type,
                frag_id as u16,
                frag_cnt as u16,
                payload.slice(start..end),
            ));
        }

        Ok(datagrams)
    }

    /// Parse a datagram received on the wire.
    ///
    /// Fails only when the input cannot hold a full header; whatever
    /// follows the header is the payload.
    pub fn parse(binary: &[u8]) -> Result<Self, LumenError> {
        if binary.len() < HEADER_SIZE {
            return Err(LumenError::TruncatedDatagram { len: binary.len() });
        }

        let mut buf = Bytes::copy_from_slice(binary);
        let frame_id = buf.get_u32();
        let frame_type = FrameType::from(buf.get_u8());
        let frag_id = buf.get_u16();
        let frag_cnt = buf.get_u16();
        let send_ts = buf.get_u64();

        Ok(Self {
            frame_id,
            frame_type,
            frag_id,
            frag_cnt,
            send_ts,
            payload: buf,
            num_rtx: 0,
            last_send_ts: 0,
        })
    }

    /// Serialize the header and payload for the wire.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.frame_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(self.frag_id);
        buf.put_u16(self.frag_cnt);
        buf.put_u64(self.send_ts);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_17() {
        assert_eq!(HEADER_SIZE, 17);
    }

    #[test]
    fn serialize_is_byte_exact() {
        let datagram = Datagram {
            frame_id: 0x0102_0304,
            frame_type: FrameType::Key,
            frag_id: 0x0005,
            frag_cnt: 0x0010,
            send_ts: 0x0102_0304_0506_0708,
            payload: Bytes::from_static(b"abc"),
            num_rtx: 0,
            last_send_ts: 0,
        };

        let wire = datagram.serialize();
        assert_eq!(
            wire.as_ref(),
            &[
                0x01, 0x02, 0x03, 0x04, // frame_id
                0x01, // frame_type = Key
                0x00, 0x05, // frag_id
                0x00, 0x10, // frag_cnt
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // send_ts
                0x61, 0x62, 0x63, // "abc"
            ]
        );
    }

    #[test]
    fn roundtrip() {
        let datagram = Datagram {
            frame_id: 42,
            frame_type: FrameType::NonKey,
            frag_id: 3,
            frag_cnt: 8,
            send_ts: 1_234_567,
            payload: Bytes::from_static(b"payload bytes"),
            num_rtx: 0,
            last_send_ts: 0,
        };

        let parsed = Datagram::parse(&datagram.serialize()).unwrap();
        assert_eq!(parsed, datagram);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let datagram = Datagram::new(7, FrameType::Key, 0, 1, Bytes::new());
        let wire = datagram.serialize();
        assert_eq!(wire.len(), HEADER_SIZE);

        let parsed = Datagram::parse(&wire).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn short_input_rejected() {
        let err = Datagram::parse(&[0u8; HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(
            err,
            LumenError::TruncatedDatagram { len } if len == HEADER_SIZE - 1
        ));
    }

    #[test]
    fn unknown_frame_type_parses_as_unknown() {
        let mut wire = Datagram::new(0, FrameType::Key, 0, 1, Bytes::new())
            .serialize()
            .to_vec();
        wire[4] = 0xFF;

        let parsed = Datagram::parse(&wire).unwrap();
        assert_eq!(parsed.frame_type, FrameType::Unknown);
    }

    #[test]
    fn packetize_splits_at_max_payload() {
        let payload = Bytes::from((0u8..10).collect::<Vec<u8>>());
        let frags =
            Datagram::packetize_with(4, 9, FrameType::NonKey, payload.clone()).unwrap();

        assert_eq!(frags.len(), 3);
        let lengths: Vec<usize> = frags.iter().map(|d| d.payload.len()).collect();
        assert_eq!(lengths, [4, 4, 2]);

        for (i, frag) in frags.iter().enumerate() {
            assert_eq!(frag.frame_id, 9);
            assert_eq!(frag.frag_id, i as u16);
            assert_eq!(frag.frag_cnt, 3);
            assert_eq!(frag.num_rtx, 0);
            assert_eq!(frag.send_ts, 0);
        }

        // concatenating in frag_id order reproduces the frame
        let mut joined = Vec::new();
        for frag in &frags {
            joined.extend_from_slice(&frag.payload);
        }
        assert_eq!(joined, payload.as_ref());
    }

    #[test]
    fn packetize_exact_multiple_gets_trailing_full_fragment() {
        // 8 bytes at max_payload 4 → 2 fragments of 4, not 3
        let payload = Bytes::from(vec![0xAA; 8]);
        let frags = Datagram::packetize_with(4, 0, FrameType::Key, payload).unwrap();
        assert_eq!(frags.len(), 2);
        assert!(frags.iter().all(|d| d.payload.len() == 4));
    }

    #[test]
    fn packetize_empty_frame_yields_one_empty_fragment() {
        let frags =
            Datagram::packetize_with(4, 0, FrameType::Key, Bytes::new()).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].frag_cnt, 1);
        assert!(frags[0].payload.is_empty());
    }

    #[test]
    fn packetize_rejects_fragment_count_overflow() {
        // 2 bytes per fragment, so a frame this large cannot be counted
        // by a u16
        let payload = Bytes::from(vec![0u8; 3 * (usize::from(u16::MAX) + 1)]);
        let err = Datagram::packetize_with(2, 0, FrameType::Key, payload).unwrap_err();
        assert!(matches!(err, LumenError::TooManyFragments { .. }));
    }

    #[test]
    fn mtu_bounds_are_enforced() {
        assert!(set_mtu(511).is_err());
        assert!(set_mtu(1501).is_err());
        // 1500 is the default, so accepting it does not disturb
        // concurrently running tests
        assert!(set_mtu(1500).is_ok());
        assert_eq!(max_payload(), 1500 - 28 - HEADER_SIZE);
    }
}
