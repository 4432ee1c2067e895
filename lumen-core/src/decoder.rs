//! Receiver-side frame ordering, key-frame skip-ahead recovery and the
//! decode worker pipeline.
//!
//! The main thread owns the socket-facing state: `next_frame` (the
//! next frame ID to consume) and `frame_buf` (frames being
//! reassembled). Completed frames are handed to a worker thread over a
//! [`FrameQueue`]; the worker owns the codec context and the display.
//!
//! The receiver never waits indefinitely for missing non-key
//! fragments: as soon as a later key frame reassembles completely,
//! every intermediate frame is abandoned and `next_frame` jumps ahead.

use std::collections::{BTreeMap, VecDeque, btree_map::Entry};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::clock::timestamp_us;
use crate::datagram::{Datagram, FrameType};
#[cfg(feature = "display")]
use crate::display::VideoDisplay;
use crate::error::LumenError;
use crate::frame::Frame;
use crate::queue::FrameQueue;
use crate::vpx::VpxDecoder;

// ── LazyLevel ────────────────────────────────────────────────────

/// How much work the receiver performs per decodable frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LazyLevel {
    /// Decode and display every frame.
    DecodeDisplay = 0,
    /// Decode but do not display.
    DecodeOnly = 1,
    /// Track decodability only; never touch the codec.
    NoDecodeDisplay = 2,
}

impl TryFrom<u8> for LazyLevel {
    type Error = LumenError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::DecodeDisplay),
            1 => Ok(Self::DecodeOnly),
            2 => Ok(Self::NoDecodeDisplay),
            _ => Err(LumenError::Config(format!("invalid lazy level: {value}"))),
        }
    }
}

// ── Decoder ──────────────────────────────────────────────────────

/// Receiver-side reassembly frontier and decode pipeline.
pub struct Decoder {
    lazy_level: LazyLevel,
    /// Per-frame CSV log, written by the main thread only when no
    /// worker runs (`NoDecodeDisplay`).
    output: Option<File>,

    /// Next frame ID to consume.
    next_frame: u32,
    frame_buf: BTreeMap<u32, Frame>,

    // per-second stats
    num_decodable_frames: u32,
    total_decodable_frame_size: usize,
    last_stats_time: Instant,

    shared_queue: Arc<FrameQueue>,
    worker: Option<JoinHandle<()>>,
}

impl Decoder {
    /// Create the receiver pipeline, spawning the decode worker unless
    /// `lazy_level` rules decoding out entirely.
    pub fn new(
        display_width: u16,
        display_height: u16,
        lazy_level: LazyLevel,
        output: Option<PathBuf>,
    ) -> Result<Self, LumenError> {
        #[cfg(not(feature = "display"))]
        if lazy_level == LazyLevel::DecodeDisplay {
            return Err(LumenError::Config(
                "built without the `display` feature; use --lazy 1 or 2".into(),
            ));
        }

        let shared_queue = Arc::new(FrameQueue::new());
        let mut worker = None;
        let mut main_output = None;

        if lazy_level <= LazyLevel::DecodeOnly {
            let worker_output = output.map(File::create).transpose()?;
            let queue = Arc::clone(&shared_queue);

            worker = Some(
                thread::Builder::new()
                    .name("decode-worker".into())
                    .spawn(move || {
                        if let Err(e) = worker_main(
                            display_width,
                            display_height,
                            lazy_level,
                            worker_output,
                            &queue,
                        ) {
                            error!("decode worker failed: {e}");
                            std::process::exit(1);
                        }
                    })?,
            );

            info!("spawned a new thread for decoding and displaying frames");
        } else {
            main_output = output.map(File::create).transpose()?;
        }

        Ok(Self {
            lazy_level,
            output: main_output,
            next_frame: 0,
            frame_buf: BTreeMap::new(),
            num_decodable_frames: 0,
            total_decodable_frame_size: 0,
            last_stats_time: Instant::now(),
            shared_queue,
            worker,
        })
    }

    /// Next frame ID to consume.
    pub fn next_frame(&self) -> u32 {
        self.next_frame
    }

    /// Buffer a received datagram.
    ///
    /// Datagrams from frames older than `next_frame` are dropped
    /// silently; a datagram that contradicts its frame's stored header
    /// is a hard error.
    pub fn add_datagram(&mut self, datagram: Datagram) -> Result<(), LumenError> {
        if datagram.frame_id < self.next_frame {
            return Ok(()); // stale
        }

        let frame = match self.frame_buf.entry(datagram.frame_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Frame::new(
                datagram.frame_id,
                datagram.frame_type,
                datagram.frag_cnt,
            )?),
        };

        frame.insert(datagram)
    }

    /// Whether the frame at `next_frame` is ready to consume.
    ///
    /// When it is not, looks for the newest complete key frame ahead
    /// of `next_frame`; on a hit, jumps the frontier there (abandoning
    /// everything in between) and reports success.
    pub fn next_frame_complete(&mut self) -> bool {
        if self
            .frame_buf
            .get(&self.next_frame)
            .is_some_and(Frame::complete)
        {
            return true;
        }

        // seek forward if a key frame in the future is already complete
        let skip_to = self
            .frame_buf
            .iter()
            .rev()
            .find(|(_, frame)| frame.frame_type() == FrameType::Key && frame.complete())
            .map(|(frame_id, _)| *frame_id);

        if let Some(frame_id) = skip_to {
            debug_assert!(frame_id > self.next_frame);
            let frame_diff = frame_id - self.next_frame;
            self.advance_next_frame(frame_diff);

            warn!("recovery: skipped {frame_diff} frames ahead to key frame {frame_id}");
            return true;
        }

        false
    }

    /// Dispatch the complete frame at `next_frame` and advance past it.
    ///
    /// Depending on the lazy level the frame is either queued for the
    /// decode worker or, with neither decode nor display, logged
    /// directly by the main thread.
    pub fn consume_next_frame(&mut self) -> Result<(), LumenError> {
        let frame = match self.frame_buf.remove(&self.next_frame) {
            Some(frame) if frame.complete() => frame,
            _ => {
                return Err(LumenError::Protocol(
                    "next frame must be complete before consuming it",
                ));
            }
        };

        // complete ⇒ defined
        let frame_size = frame.frame_size().unwrap_or_default();
        self.num_decodable_frames += 1;
        self.total_decodable_frame_size += frame_size;
        self.output_periodic_stats();

        if self.lazy_level <= LazyLevel::DecodeOnly {
            // dispatch to the worker; it is signalled by the queue
            self.shared_queue.push(frame);
        } else if let Some(output) = self.output.as_mut() {
            writeln!(output, "{},{},{}", self.next_frame, frame_size, timestamp_us())?;
        }

        self.advance_next_frame(1);
        Ok(())
    }

    /// Advance the consume frontier by `n` frames, evicting every
    /// buffered frame that falls behind it.
    pub fn advance_next_frame(&mut self, n: u32) {
        self.next_frame += n;
        self.frame_buf = self.frame_buf.split_off(&self.next_frame);
    }

    fn output_periodic_stats(&mut self) {
        let stats_now = Instant::now();
        while stats_now >= self.last_stats_time + Duration::from_secs(1) {
            info!(
                "decodable frames in the last ~1s: {}",
                self.num_decodable_frames
            );

            let diff_ms = (stats_now - self.last_stats_time).as_secs_f64() * 1000.0;
            if diff_ms > 0.0 {
                info!(
                    "  - bitrate (kbps): {:.3}",
                    self.total_decodable_frame_size as f64 * 8.0 / diff_ms
                );
            }

            self.num_decodable_frames = 0;
            self.total_decodable_frame_size = 0;
            self.last_stats_time += Duration::from_secs(1);
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.shared_queue.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────

fn worker_main(
    display_width: u16,
    display_height: u16,
    lazy_level: LazyLevel,
    mut output: Option<File>,
    queue: &FrameQueue,
) -> Result<(), LumenError> {
    // nothing to do without decoding
    if lazy_level == LazyLevel::NoDecodeDisplay {
        return Ok(());
    }

    let max_threads = num_cpus::get().min(4);
    let mut vpx = VpxDecoder::new(display_width, display_height, max_threads as u32)?;
    info!("[worker] initialized decoder (max threads: {max_threads})");

    #[cfg(feature = "display")]
    let mut display = if lazy_level == LazyLevel::DecodeDisplay {
        Some(VideoDisplay::new(display_width, display_height)?)
    } else {
        None
    };

    let mut local_queue: VecDeque<Frame> = VecDeque::new();

    let mut num_decoded_frames = 0u32;
    let mut total_decode_time_ms = 0.0f64;
    let mut max_decode_time_ms = 0.0f64;
    let mut last_stats_time = Instant::now();

    while queue.drain_into(&mut local_queue) {
        // drop the display if it has been signalled to quit, but keep
        // decoding
        #[cfg(feature = "display")]
        if display.as_mut().is_some_and(VideoDisplay::signal_quit) {
            display = None;
        }

        while let Some(frame) = local_queue.pop_front() {
            let compressed = frame.assemble()?;

            let decode_start = Instant::now();
            vpx.decode(&compressed)?;
            let decode_time_ms = decode_start.elapsed().as_secs_f64() * 1000.0;

            if let Some(output) = output.as_mut() {
                writeln!(output, "{},{},{}", frame.id(), compressed.len(), timestamp_us())?;
            }

            #[cfg(feature = "display")]
            if let Some(display) = display.as_mut() {
                let decoded = vpx.decoded_image()?;
                display.show_frame(&decoded)?;
            }

            num_decoded_frames += 1;
            total_decode_time_ms += decode_time_ms;
            max_decode_time_ms = max_decode_time_ms.max(decode_time_ms);

            let stats_now = Instant::now();
            while stats_now >= last_stats_time + Duration::from_secs(1) {
                if num_decoded_frames > 0 {
                    info!(
                        "[worker] avg/max decoding time (ms) of {} frames: {:.3}/{:.3}",
                        num_decoded_frames,
                        total_decode_time_ms / f64::from(num_decoded_frames),
                        max_decode_time_ms
                    );
                }

                num_decoded_frames = 0;
                total_decode_time_ms = 0.0;
                max_decode_time_ms = 0.0;
                last_stats_time += Duration::from_secs(1);
            }
        }
    }

    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
