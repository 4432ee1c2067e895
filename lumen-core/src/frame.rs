//! Per-frame fragment buffer with completeness tracking.

use crate::datagram::{Datagram, FrameType};
use crate::error::LumenError;

/// The receiver's view of one video frame being reassembled.
///
/// Holds a fixed-length sequence of optional fragments; the frame is
/// complete once every slot is filled. Fragment payloads concatenated
/// in ascending `frag_id` order reproduce the compressed frame.
#[derive(Debug)]
pub struct Frame {
    id: u32,
    frame_type: FrameType,
    frags: Vec<Option<Datagram>>,
    /// Number of fragments still absent.
    missing: usize,
    /// Payload bytes accumulated so far.
    frame_size: usize,
}

impl Frame {
    /// Start reassembling frame `id` out of `frag_cnt` fragments.
    pub fn new(id: u32, frame_type: FrameType, frag_cnt: u16) -> Result<Self, LumenError> {
        if frag_cnt == 0 {
            return Err(LumenError::Protocol("frame cannot have zero fragments"));
        }

        Ok(Self {
            id,
            frame_type,
            frags: vec![None; usize::from(frag_cnt)],
            missing: usize::from(frag_cnt),
            frame_size: 0,
        })
    }

    /// Insert one fragment into the frame.
    ///
    /// Rejects datagrams that do not belong to this frame; duplicates
    /// (retransmissions) are discarded silently.
    pub fn insert(&mut self, datagram: Datagram) -> Result<(), LumenError> {
        if datagram.frame_id != self.id
            || datagram.frame_type != self.frame_type
            || usize::from(datagram.frag_cnt) != self.frags.len()
            || usize::from(datagram.frag_id) >= self.frags.len()
        {
            return Err(LumenError::Protocol(
                "unable to insert an incompatible datagram",
            ));
        }

        let slot = &mut self.frags[usize::from(datagram.frag_id)];
        if slot.is_none() {
            self.frame_size += datagram.payload.len();
            self.missing -= 1;
            *slot = Some(datagram);
        }

        Ok(())
    }

    /// Whether every fragment has arrived.
    pub fn complete(&self) -> bool {
        self.missing == 0
    }

    /// Total payload bytes; defined only once the frame is complete.
    pub fn frame_size(&self) -> Option<usize> {
        self.complete().then_some(self.frame_size)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Fragment slots in ascending `frag_id` order.
    pub fn frags(&self) -> &[Option<Datagram>] {
        &self.frags
    }

    /// Concatenate the payloads in `frag_id` order into one compressed
    /// frame. The frame must be complete.
    pub fn assemble(&self) -> Result<Vec<u8>, LumenError> {
        if !self.complete() {
            return Err(LumenError::Protocol(
                "frame must be complete before assembly",
            ));
        }

        let mut data = Vec::with_capacity(self.frame_size);
        for datagram in self.frags.iter().flatten() {
            data.extend_from_slice(&datagram.payload);
        }
        Ok(data)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frag(frame_id: u32, frag_id: u16, frag_cnt: u16, payload: &'static [u8]) -> Datagram {
        Datagram::new(
            frame_id,
            FrameType::NonKey,
            frag_id,
            frag_cnt,
            Bytes::from_static(payload),
        )
    }

    #[test]
    fn zero_fragments_rejected() {
        assert!(Frame::new(0, FrameType::Key, 0).is_err());
    }

    #[test]
    fn out_of_order_insertion_completes() {
        let mut frame = Frame::new(7, FrameType::NonKey, 3).unwrap();

        frame.insert(frag(7, 2, 3, b"cc")).unwrap();
        assert!(!frame.complete());
        assert_eq!(frame.frame_size(), None);

        frame.insert(frag(7, 0, 3, b"aaaa")).unwrap();
        assert!(!frame.complete());

        frame.insert(frag(7, 1, 3, b"bbb")).unwrap();
        assert!(frame.complete());
        assert_eq!(frame.frame_size(), Some(9));
        assert_eq!(frame.assemble().unwrap(), b"aaaabbbcc");
    }

    #[test]
    fn duplicate_insert_changes_nothing() {
        let mut frame = Frame::new(1, FrameType::NonKey, 2).unwrap();
        frame.insert(frag(1, 0, 2, b"xy")).unwrap();

        // a retransmitted copy of the same fragment
        frame.insert(frag(1, 0, 2, b"xy")).unwrap();
        assert!(!frame.complete());

        frame.insert(frag(1, 1, 2, b"z")).unwrap();
        assert_eq!(frame.frame_size(), Some(3));
    }

    #[test]
    fn mismatched_datagram_rejected() {
        let mut frame = Frame::new(5, FrameType::NonKey, 2).unwrap();

        // wrong frame id
        assert!(frame.insert(frag(6, 0, 2, b"a")).is_err());
        // wrong fragment count
        assert!(frame.insert(frag(5, 0, 3, b"a")).is_err());
        // fragment index out of range
        assert!(frame.insert(frag(5, 2, 2, b"a")).is_err());
        // wrong frame type
        let key = Datagram::new(5, FrameType::Key, 0, 2, Bytes::from_static(b"a"));
        assert!(frame.insert(key).is_err());
    }

    #[test]
    fn assemble_requires_completeness() {
        let mut frame = Frame::new(2, FrameType::NonKey, 2).unwrap();
        frame.insert(frag(2, 0, 2, b"a")).unwrap();
        assert!(frame.assemble().is_err());
    }
}
