//! Sender-side packetization, retransmission scheduling and RTT
//! estimation, plus the VP9 compression front end.
//!
//! [`SendQueue`] owns the transport state: the outbound datagram deque
//! (retransmissions at the front, fresh frames at the back), the
//! unacked map keyed by `(frame_id, frag_id)`, and the min/EWMA RTT
//! estimators. [`Encoder`] drives the codec and feeds packetized
//! frames into the queue.
//!
//! Recovery layers, in order of escalation:
//!
//! 1. An ACK overtaking earlier sequence numbers triggers a backward
//!    sweep retransmitting the overtaken datagrams, at most once per
//!    RTT each and at most `MAX_NUM_RTX` times in total.
//! 2. Once the oldest unacked datagram is `MAX_UNACKED_US` old, all
//!    in-flight data is abandoned and the next frame is forced to be a
//!    key frame.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::clock::timestamp_us;
use crate::datagram::{Datagram, FrameType, SeqNum};
use crate::error::LumenError;
use crate::message::AckMsg;
use crate::vpx::{RawImage, VpxEncoder};

/// Give up retransmitting a datagram after this many attempts.
const MAX_NUM_RTX: u32 = 3;

/// Abandon in-flight data and force a key frame once the oldest
/// unacked datagram is this old (µs).
const MAX_UNACKED_US: u64 = 1_000_000;

/// EWMA smoothing factor for RTT samples.
const ALPHA: f64 = 0.2;

// ── SendQueue ────────────────────────────────────────────────────

/// Outbound datagram queue with unacked bookkeeping, RTT estimation
/// and ACK-driven retransmission.
#[derive(Default)]
pub struct SendQueue {
    send_buf: VecDeque<Datagram>,
    unacked: BTreeMap<SeqNum, Datagram>,
    min_rtt_us: Option<u32>,
    ewma_rtt_us: Option<f64>,
}

impl SendQueue {
    /// Datagrams waiting for a writable socket.
    pub fn send_buf(&mut self) -> &mut VecDeque<Datagram> {
        &mut self.send_buf
    }

    pub fn has_pending(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// Unacked datagrams keyed by sequence number.
    pub fn unacked(&self) -> &BTreeMap<SeqNum, Datagram> {
        &self.unacked
    }

    pub fn min_rtt_us(&self) -> Option<u32> {
        self.min_rtt_us
    }

    pub fn ewma_rtt_us(&self) -> Option<f64> {
        self.ewma_rtt_us
    }

    /// Record the first transmission of a datagram.
    ///
    /// Retransmissions must not be re-added; a duplicate sequence
    /// number is a programming error.
    pub fn add_unacked(&mut self, datagram: Datagram) -> Result<(), LumenError> {
        let seq_num = datagram.seq_num();
        let mut entry = datagram;
        entry.last_send_ts = entry.send_ts;

        if self.unacked.insert(seq_num, entry).is_some() {
            return Err(LumenError::Protocol("datagram already exists in unacked"));
        }
        Ok(())
    }

    /// Process one ACK at time `now_us`.
    ///
    /// Ingests the RTT sample, retransmits every unacked datagram
    /// ordered before the acked one (backward sweep), then erases the
    /// acked entry. A stale ACK only contributes its RTT sample.
    pub fn handle_ack(&mut self, ack: &AckMsg, now_us: u64) {
        self.add_rtt_sample(now_us.saturating_sub(ack.send_ts));

        let acked: SeqNum = (ack.frame_id, ack.frag_id);
        if !self.unacked.contains_key(&acked) {
            return; // stale ACK for an already-erased datagram
        }

        // just updated by add_rtt_sample above
        let ewma_rtt_us = self.ewma_rtt_us.unwrap_or_default();

        // A higher ACK overtaking lower sequence numbers strongly
        // suggests the earlier datagrams (or their ACKs) were lost:
        // retransmit them, newest first, at most once per RTT.
        for (_seq_num, datagram) in self.unacked.range_mut(..acked).rev() {
            if datagram.num_rtx >= MAX_NUM_RTX {
                continue;
            }

            if datagram.num_rtx == 0
                || now_us.saturating_sub(datagram.last_send_ts) as f64 > ewma_rtt_us
            {
                datagram.num_rtx += 1;
                datagram.last_send_ts = now_us;

                // retransmissions are more urgent
                self.send_buf.push_front(datagram.clone());
            }
        }

        self.unacked.remove(&acked);
    }

    /// Whether the oldest unacked datagram is older than the
    /// retransmission budget at time `now_us`.
    pub fn exceeded_unacked_deadline(&self, now_us: u64) -> bool {
        self.unacked
            .values()
            .next()
            .is_some_and(|first| now_us.saturating_sub(first.send_ts) > MAX_UNACKED_US)
    }

    /// Abandon every queued and in-flight datagram.
    pub fn clear(&mut self) {
        self.send_buf.clear();
        self.unacked.clear();
    }

    fn add_rtt_sample(&mut self, rtt_us: u64) {
        let rtt_us = rtt_us.min(u64::from(u32::MAX)) as u32;

        if self.min_rtt_us.is_none_or(|min| rtt_us < min) {
            self.min_rtt_us = Some(rtt_us);
        }

        self.ewma_rtt_us = Some(match self.ewma_rtt_us {
            None => f64::from(rtt_us),
            Some(ewma) => ALPHA * f64::from(rtt_us) + (1.0 - ALPHA) * ewma,
        });
    }
}

// ── Encoder ──────────────────────────────────────────────────────

/// Sender-side VP9 compressor and transmitter state.
pub struct Encoder {
    display_width: u16,
    display_height: u16,
    vpx: VpxEncoder,
    output: Option<File>,
    /// Next frame ID to encode.
    frame_id: u32,
    queue: SendQueue,

    // per-second stats, reset by `output_periodic_stats`
    num_encoded_frames: u32,
    total_encode_time_ms: f64,
    max_encode_time_ms: f64,
}

impl Encoder {
    /// Initialize a VP9 encoder for the given geometry, optionally
    /// logging per-frame results to `output` as CSV.
    pub fn new(
        display_width: u16,
        display_height: u16,
        frame_rate: u16,
        output: Option<&Path>,
    ) -> Result<Self, LumenError> {
        let output = output.map(File::create).transpose()?;
        let vpx = VpxEncoder::new(display_width, display_height, frame_rate)?;

        Ok(Self {
            display_width,
            display_height,
            vpx,
            output,
            frame_id: 0,
            queue: SendQueue::default(),
            num_encoded_frames: 0,
            total_encode_time_ms: 0.0,
            max_encode_time_ms: 0.0,
        })
    }

    /// Compress `raw_img` into frame `frame_id` and packetize it onto
    /// the tail of the send buffer.
    pub fn compress_frame(&mut self, raw_img: &RawImage) -> Result<(), LumenError> {
        let frame_generation_ts = timestamp_us();

        if raw_img.display_width() != self.display_width
            || raw_img.display_height() != self.display_height
        {
            return Err(LumenError::Config(format!(
                "encoder expects {}x{} input, got {}x{}",
                self.display_width,
                self.display_height,
                raw_img.display_width(),
                raw_img.display_height()
            )));
        }

        let force_key = self.check_recovery(frame_generation_ts);

        let encode_start = Instant::now();
        let packet = self
            .vpx
            .encode_frame(raw_img, i64::from(self.frame_id), force_key)?;
        let encode_time_ms = encode_start.elapsed().as_secs_f64() * 1000.0;

        self.num_encoded_frames += 1;
        self.total_encode_time_ms += encode_time_ms;
        self.max_encode_time_ms = self.max_encode_time_ms.max(encode_time_ms);

        let frame_type = if packet.is_key {
            debug!(frame_id = self.frame_id, "encoded a key frame");
            FrameType::Key
        } else {
            FrameType::NonKey
        };

        let frame_size = packet.data.len();
        self.packetize(frame_type, packet.data)?;

        if let Some(output) = self.output.as_mut() {
            let frame_encoded_ts = timestamp_us();
            writeln!(
                output,
                "{},{},{},{},{}",
                self.frame_id,
                self.vpx.target_bitrate(),
                frame_size,
                frame_generation_ts,
                frame_encoded_ts
            )?;
        }

        // move onto the next frame
        self.frame_id += 1;
        Ok(())
    }

    /// Handle an ACK from the receiver: RTT estimation and
    /// retransmission scheduling.
    pub fn handle_ack(&mut self, ack: &AckMsg) {
        self.queue.handle_ack(ack, timestamp_us());
    }

    /// Record a successfully transmitted, non-retransmitted datagram.
    pub fn add_unacked(&mut self, datagram: Datagram) -> Result<(), LumenError> {
        self.queue.add_unacked(datagram)
    }

    pub fn send_buf(&mut self) -> &mut VecDeque<Datagram> {
        self.queue.send_buf()
    }

    pub fn has_pending(&self) -> bool {
        self.queue.has_pending()
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    /// Update the CBR target and reconfigure the codec.
    pub fn set_target_bitrate(&mut self, bitrate_kbps: u32) -> Result<(), LumenError> {
        self.vpx.set_target_bitrate(bitrate_kbps)
    }

    /// Report and reset per-second encode statistics; RTT estimators
    /// persist for the session.
    pub fn output_periodic_stats(&mut self) {
        info!("frames encoded in the last ~1s: {}", self.num_encoded_frames);

        if self.num_encoded_frames > 0 {
            info!(
                "  - avg/max encoding time (ms): {:.3}/{:.3}",
                self.total_encode_time_ms / f64::from(self.num_encoded_frames),
                self.max_encode_time_ms
            );
        }

        if let (Some(min_rtt_us), Some(ewma_rtt_us)) =
            (self.queue.min_rtt_us(), self.queue.ewma_rtt_us())
        {
            info!(
                "  - min/EWMA RTT (ms): {:.3}/{:.3}",
                f64::from(min_rtt_us) / 1000.0,
                ewma_rtt_us / 1000.0
            );
        }

        self.num_encoded_frames = 0;
        self.total_encode_time_ms = 0.0;
        self.max_encode_time_ms = 0.0;
    }

    fn check_recovery(&mut self, now_us: u64) -> bool {
        if !self.queue.exceeded_unacked_deadline(now_us) {
            return false;
        }

        warn!(
            frame_id = self.frame_id,
            "recovery: gave up retransmissions and forced a key frame"
        );

        if let Some(first) = self.queue.unacked().values().next() {
            debug!(
                frame_id = first.frame_id,
                frag_id = first.frag_id,
                rtx = first.num_rtx,
                us_since_first_send = now_us.saturating_sub(first.send_ts),
                "giving up on lost datagram"
            );
        }

        self.queue.clear();
        true
    }

    fn packetize(&mut self, frame_type: FrameType, data: Bytes) -> Result<(), LumenError> {
        let datagrams = Datagram::packetize(self.frame_id, frame_type, data)?;
        self.queue.send_buf().extend(datagrams);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
