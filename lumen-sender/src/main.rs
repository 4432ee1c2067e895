//! lumen video sender — entry point.
//!
//! ```text
//! lumen-sender [--mtu N] [-o results.csv] [-v] <port> <input.y4m>
//! ```
//!
//! Binds the given UDP port, waits for a receiver's config handshake,
//! then streams the encoded video: a timerfd paces raw-frame reads and
//! encoding, socket writability drains the send buffer, and incoming
//! ACKs drive RTT estimation and retransmission. Everything runs
//! single-threaded around the event loop.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use lumen_core::clock::timestamp_us;
use lumen_core::datagram::set_mtu;
use lumen_core::encoder::Encoder;
use lumen_core::error::LumenError;
use lumen_core::event_loop::{Direction, EventLoop, LoopHandle};
use lumen_core::input::{VideoInput, Y4mInput};
use lumen_core::message::{ConfigMsg, Msg};
use lumen_core::net::UdpLink;
use lumen_core::timer::PeriodicTimer;
use lumen_core::vpx::RawImage;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "lumen-sender", about = "lumen VP9 video sender")]
struct Cli {
    /// MTU for deciding the UDP payload size (512-1500).
    #[arg(long)]
    mtu: Option<usize>,

    /// File to output per-frame performance results to (CSV:
    /// frame_id,target_bitrate,frame_size,generation_ts,encoded_ts).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable more logging for debugging.
    #[arg(short, long)]
    verbose: bool,

    /// Capture from a V4L2 camera; <INPUT> is the device path.
    #[cfg(feature = "camera")]
    #[arg(long)]
    camera: bool,

    /// UDP port to await the receiver's handshake on.
    port: u16,

    /// Path to a YUV4MPEG2 video file.
    input: PathBuf,
}

// ── Sender context ───────────────────────────────────────────────

/// Everything the event-loop callbacks operate on.
struct SenderCtx {
    handle: LoopHandle,
    sock: UdpLink,
    sock_fd: RawFd,
    encoder: Encoder,
    video_input: Box<dyn VideoInput>,
    raw_img: RawImage,
    fps_timer: PeriodicTimer,
    stats_timer: PeriodicTimer,
}

/// Block until a valid `ConfigMsg` arrives; everything else is
/// discarded.
fn recv_config(sock: &UdpLink) -> Result<(SocketAddr, ConfigMsg), LumenError> {
    loop {
        let (peer, data) = sock.recv_from()?;
        if let Some(Msg::Config(config)) = Msg::parse(&data) {
            return Ok((peer, config));
        }
        // ignore invalid or non-config messages
    }
}

fn open_input(cli: &Cli, width: u16, height: u16) -> Result<Box<dyn VideoInput>, LumenError> {
    #[cfg(feature = "camera")]
    if cli.camera {
        return Ok(Box::new(lumen_core::input::CameraInput::open(
            &cli.input, width, height,
        )?));
    }

    Ok(Box::new(Y4mInput::open(&cli.input, width, height, true)?))
}

// ── Main ─────────────────────────────────────────────────────────

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Init tracing; stats and recovery events go to stderr.
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(mtu) = cli.mtu {
        set_mtu(mtu)?;
    }

    let sock = UdpLink::bind(cli.port)?;
    info!("local address: {}", sock.local_addr()?);

    // wait for a receiver's ConfigMsg and "connect" to it
    info!("waiting for receiver...");
    let (peer, config) = recv_config(&sock)?;
    info!("peer address: {peer}");
    sock.connect_peer(peer)?;

    info!(
        width = config.width,
        height = config.height,
        fps = config.frame_rate,
        bitrate = config.target_bitrate,
        "received config"
    );

    if config.width == 0 || config.height == 0 || config.frame_rate == 0 {
        return Err(LumenError::Config("config must have non-zero geometry and FPS".into()).into());
    }

    // all further socket traffic goes through the event loop
    sock.set_nonblocking(true)?;

    let video_input = open_input(&cli, config.width, config.height)?;
    let raw_img = RawImage::new(config.width, config.height)?;

    let mut encoder = Encoder::new(
        config.width,
        config.height,
        config.frame_rate,
        cli.output.as_deref(),
    )?;
    if config.target_bitrate > 0 {
        encoder.set_target_bitrate(config.target_bitrate)?;
    }

    let mut event_loop: EventLoop<SenderCtx> = EventLoop::new()?;

    // a periodic timer with the same period as the frame interval
    let mut fps_timer = PeriodicTimer::new()?;
    fps_timer.arm(Duration::from_nanos(
        1_000_000_000 / u64::from(config.frame_rate),
    ))?;

    let mut stats_timer = PeriodicTimer::new()?;
    stats_timer.arm(Duration::from_secs(1))?;

    let sock_fd = sock.as_raw_fd();
    let fps_fd = fps_timer.as_raw_fd();
    let stats_fd = stats_timer.as_raw_fd();

    let mut ctx = SenderCtx {
        handle: event_loop.handle(),
        sock,
        sock_fd,
        encoder,
        video_input,
        raw_img,
        fps_timer,
        stats_timer,
    };

    // read raw frames when the pacing timer fires; encode the last one
    event_loop.register(
        fps_fd,
        Direction::In,
        Box::new(|ctx: &mut SenderCtx| {
            // being lenient: on late wakeups, skip all but the newest
            // raw frame
            let num_exp = ctx.fps_timer.expirations()?;
            if num_exp > 1 {
                warn!("skipping {} raw frames", num_exp - 1);
            }

            for _ in 0..num_exp {
                if !ctx.video_input.read_frame(&mut ctx.raw_img)? {
                    return Err(LumenError::InputExhausted);
                }
            }

            ctx.encoder.compress_frame(&ctx.raw_img)?;

            if ctx.encoder.has_pending() {
                ctx.handle.activate(ctx.sock_fd, Direction::Out);
            }
            Ok(())
        }),
    )?;

    // drain the send buffer while the socket accepts data
    event_loop.register(
        sock_fd,
        Direction::Out,
        Box::new(|ctx: &mut SenderCtx| {
            loop {
                let Some(front) = ctx.encoder.send_buf().front_mut() else {
                    break;
                };

                // timestamp the sending time right before sending
                front.send_ts = timestamp_us();
                let wire = front.serialize();
                let (frame_id, frag_id, frag_cnt, num_rtx) =
                    (front.frame_id, front.frag_id, front.frag_cnt, front.num_rtx);

                if !ctx.sock.send(&wire)? {
                    // EWOULDBLOCK; it wasn't sent, so the stamp is void
                    front.send_ts = 0;
                    break;
                }

                debug!(frame_id, frag_id, frag_cnt, rtx = num_rtx, "sent datagram");

                let sent = ctx.encoder.send_buf().pop_front();
                // only first transmissions enter the unacked map
                if num_rtx == 0 {
                    if let Some(sent) = sent {
                        ctx.encoder.add_unacked(sent)?;
                    }
                }
            }

            if !ctx.encoder.has_pending() {
                ctx.handle.deactivate(ctx.sock_fd, Direction::Out);
            }
            Ok(())
        }),
    )?;

    // ACKs from the receiver
    event_loop.register(
        sock_fd,
        Direction::In,
        Box::new(|ctx: &mut SenderCtx| {
            while let Some(data) = ctx.sock.recv()? {
                let Some(Msg::Ack(ack)) = Msg::parse(&data) else {
                    continue; // ignore invalid or non-ACK messages
                };

                debug!(frame_id = ack.frame_id, frag_id = ack.frag_id, "received ACK");

                // RTT estimation, retransmission scheduling
                ctx.encoder.handle_ack(&ack);

                // send_buf may hold retransmissions now
                if ctx.encoder.has_pending() {
                    ctx.handle.activate(ctx.sock_fd, Direction::Out);
                }
            }
            Ok(())
        }),
    )?;

    // per-second statistics
    event_loop.register(
        stats_fd,
        Direction::In,
        Box::new(|ctx: &mut SenderCtx| {
            if ctx.stats_timer.expirations()? == 0 {
                return Ok(());
            }
            ctx.encoder.output_periodic_stats();
            Ok(())
        }),
    )?;

    // main loop
    loop {
        event_loop.poll(&mut ctx, None)?;
    }
}
