//! Control messages exchanged alongside the video datagrams.
//!
//! Every message starts with a 1-byte type tag, followed by the
//! variant's fields in big-endian:
//!
//! ```text
//! tag 0  Invalid
//! tag 1  Ack     frame_id (u32), frag_id (u16), send_ts (u64)
//! tag 2  Config  width (u16), height (u16), frame_rate (u16),
//!                target_bitrate (u32)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::datagram::Datagram;

const TAG_ACK: u8 = 1;
const TAG_CONFIG: u8 = 2;

// ── AckMsg ───────────────────────────────────────────────────────

/// Acknowledgment for a single received datagram.
///
/// Echoes the datagram's identifying fields exactly; the sender turns
/// `now − send_ts` into an RTT sample, so the echoed `send_ts` must be
/// the peer's transmission timestamp, untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMsg {
    pub frame_id: u32,
    pub frag_id: u16,
    pub send_ts: u64,
}

impl AckMsg {
    /// Build the ACK for a received datagram.
    pub fn for_datagram(datagram: &Datagram) -> Self {
        Self {
            frame_id: datagram.frame_id,
            frag_id: datagram.frag_id,
            send_ts: datagram.send_ts,
        }
    }
}

// ── ConfigMsg ────────────────────────────────────────────────────

/// Session configuration the receiver requests at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigMsg {
    pub width: u16,
    pub height: u16,
    pub frame_rate: u16,
    /// Target bitrate in kbps; 0 leaves the sender's default in place.
    pub target_bitrate: u32,
}

// ── Msg ──────────────────────────────────────────────────────────

/// A control message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msg {
    Ack(AckMsg),
    Config(ConfigMsg),
}

impl Msg {
    /// Parse a control message.
    ///
    /// Returns `None` for empty input, unknown tags and truncated
    /// bodies — the sender drops malformed messages silently.
    pub fn parse(binary: &[u8]) -> Option<Msg> {
        let mut buf = binary;
        if buf.remaining() < 1 {
            return None;
        }

        match buf.get_u8() {
            TAG_ACK => {
                if buf.remaining() < 4 + 2 + 8 {
                    return None;
                }
                Some(Msg::Ack(AckMsg {
                    frame_id: buf.get_u32(),
                    frag_id: buf.get_u16(),
                    send_ts: buf.get_u64(),
                }))
            }
            TAG_CONFIG => {
                if buf.remaining() < 2 + 2 + 2 + 4 {
                    return None;
                }
                Some(Msg::Config(ConfigMsg {
                    width: buf.get_u16(),
                    height: buf.get_u16(),
                    frame_rate: buf.get_u16(),
                    target_bitrate: buf.get_u32(),
                }))
            }
            _ => None,
        }
    }

    /// Serialize with the leading type tag.
    pub fn serialize(&self) -> Bytes {
        match self {
            Msg::Ack(ack) => {
                let mut buf = BytesMut::with_capacity(1 + 4 + 2 + 8);
                buf.put_u8(TAG_ACK);
                buf.put_u32(ack.frame_id);
                buf.put_u16(ack.frag_id);
                buf.put_u64(ack.send_ts);
                buf.freeze()
            }
            Msg::Config(config) => {
                let mut buf = BytesMut::with_capacity(1 + 2 + 2 + 2 + 4);
                buf.put_u8(TAG_CONFIG);
                buf.put_u16(config.width);
                buf.put_u16(config.height);
                buf.put_u16(config.frame_rate);
                buf.put_u32(config.target_bitrate);
                buf.freeze()
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::FrameType;
    use bytes::Bytes;

    #[test]
    fn ack_roundtrip() {
        let ack = Msg::Ack(AckMsg {
            frame_id: 0xDEAD_BEEF,
            frag_id: 77,
            send_ts: 987_654_321,
        });

        let wire = ack.serialize();
        assert_eq!(wire.len(), 15);
        assert_eq!(wire[0], TAG_ACK);
        assert_eq!(Msg::parse(&wire), Some(ack));
    }

    #[test]
    fn config_roundtrip() {
        let config = Msg::Config(ConfigMsg {
            width: 1280,
            height: 720,
            frame_rate: 30,
            target_bitrate: 2000,
        });

        let wire = config.serialize();
        assert_eq!(wire.len(), 11);
        assert_eq!(wire[0], TAG_CONFIG);
        assert_eq!(Msg::parse(&wire), Some(config));
    }

    #[test]
    fn ack_echoes_datagram_fields() {
        let mut datagram =
            Datagram::new(12, FrameType::NonKey, 4, 9, Bytes::from_static(b"x"));
        datagram.send_ts = 55_555;

        let ack = AckMsg::for_datagram(&datagram);
        assert_eq!(ack.frame_id, 12);
        assert_eq!(ack.frag_id, 4);
        assert_eq!(ack.send_ts, 55_555);
    }

    #[test]
    fn empty_input_yields_none() {
        assert_eq!(Msg::parse(&[]), None);
    }

    #[test]
    fn unknown_tag_yields_none() {
        assert_eq!(Msg::parse(&[0x00]), None);
        assert_eq!(Msg::parse(&[0x03, 0x01, 0x02]), None);
    }

    #[test]
    fn truncated_body_yields_none() {
        let wire = Msg::Ack(AckMsg {
            frame_id: 1,
            frag_id: 2,
            send_ts: 3,
        })
        .serialize();
        assert_eq!(Msg::parse(&wire[..wire.len() - 1]), None);
        assert_eq!(Msg::parse(&wire[..1]), None);
    }
}
