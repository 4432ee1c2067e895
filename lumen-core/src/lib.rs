//! # lumen-core
//!
//! Core library for lumen, a point-to-point low-latency VP9 video
//! transport over UDP.
//!
//! ## Architecture
//!
//! ```text
//! SENDER                                      RECEIVER
//! ┌──────────────────────────┐               ┌───────────────────────────┐
//! │ VideoInput (y4m / camera)│               │ UdpLink (blocking recv)   │
//! │   ↓ RawImage             │               │   ↓ Datagram → AckMsg ──┐ │
//! │ Encoder (VP9 + packetize)│   Datagram    │ Decoder frame_buf       │ │
//! │   ↓ send_buf             │ ───────────►  │   ↓ complete Frame      │ │
//! │ UdpLink (non-blocking)   │               │ FrameQueue → worker     │ │
//! │   ▲ EventLoop + timerfd  │  ◄─────────── │   ↓ VP9 decode          │ │
//! └───│──────────────────────┘    AckMsg   │ │ VideoDisplay            │ │
//!     └── RTT / RTX scheduling ◄───────────┘ └───────────────────────────┘
//! ```
//!
//! This crate contains:
//! - **Wire codec**: [`Datagram`], [`Msg`] — byte-exact big-endian
//!   serialization and the process-wide MTU/payload budget
//! - **Reassembly**: [`Frame`] — per-frame fragment buffer
//! - **Decoder pipeline**: [`Decoder`] — ordered delivery with
//!   key-frame skip-ahead and a condvar-signalled decode worker
//! - **Encoder transmitter**: [`Encoder`], [`SendQueue`] — VP9
//!   compression, packetization, unacked bookkeeping, EWMA RTT and
//!   ACK-driven retransmission
//! - **Event loop**: [`EventLoop`] — readiness dispatcher over raw
//!   fds, with [`PeriodicTimer`] for pacing and statistics
//! - **Error**: [`LumenError`] — typed, `thiserror`-based hierarchy

pub mod clock;
pub mod datagram;
pub mod decoder;
#[cfg(feature = "display")]
pub mod display;
pub mod encoder;
pub mod error;
pub mod event_loop;
pub mod frame;
pub mod input;
pub mod message;
pub mod net;
pub mod queue;
pub mod timer;
pub mod vpx;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use clock::timestamp_us;
pub use datagram::{Datagram, FrameType, HEADER_SIZE, SeqNum, max_payload, set_mtu};
pub use decoder::{Decoder, LazyLevel};
#[cfg(feature = "display")]
pub use display::VideoDisplay;
pub use encoder::{Encoder, SendQueue};
pub use error::LumenError;
pub use event_loop::{Callback, Direction, EventLoop, LoopHandle};
pub use frame::Frame;
#[cfg(feature = "camera")]
pub use input::CameraInput;
pub use input::{VideoInput, Y4mInput};
pub use message::{AckMsg, ConfigMsg, Msg};
pub use net::UdpLink;
pub use queue::FrameQueue;
pub use timer::PeriodicTimer;
pub use vpx::{EncodedPacket, RawImage, VpxDecoder, VpxEncoder};
