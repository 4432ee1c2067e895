//! lumen video receiver — entry point.
//!
//! ```text
//! lumen-receiver [--fps N] [--cbr K] [--lazy L] [-o results.csv] [-v]
//!                <host> <port> <width> <height>
//! ```
//!
//! Connects to the sender, requests a session configuration, then
//! loops on the blocking socket: every received datagram is ACKed
//! immediately and fed to the reassembly pipeline, which skips ahead
//! to later key frames when fragments are lost for good.

use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use lumen_core::datagram::Datagram;
use lumen_core::decoder::{Decoder, LazyLevel};
use lumen_core::message::{AckMsg, ConfigMsg, Msg};
use lumen_core::net::UdpLink;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "lumen-receiver", about = "lumen VP9 video receiver")]
struct Cli {
    /// Frame rate to request from the sender.
    #[arg(long, default_value_t = 30)]
    fps: u16,

    /// Constant bitrate (kbps) to request; 0 keeps the sender's
    /// default.
    #[arg(long, default_value_t = 0)]
    cbr: u32,

    /// 0: decode and display; 1: decode only; 2: neither.
    #[arg(long, default_value_t = 0)]
    lazy: u8,

    /// File to output per-frame performance results to (CSV:
    /// frame_id,frame_size,timestamp).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable more logging for debugging.
    #[arg(short, long)]
    verbose: bool,

    /// Sender host.
    host: String,

    /// Sender port.
    port: u16,

    /// Display width in pixels.
    width: u16,

    /// Display height in pixels.
    height: u16,
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

    let lazy_level = LazyLevel::try_from(cli.lazy)?;

    // create a UDP socket and "connect" it to the sender
    let sock = UdpLink::connect((cli.host.as_str(), cli.port))?;
    info!("peer address: {}:{}", cli.host, cli.port);
    info!("local address: {}", sock.local_addr()?);

    // request a specific configuration
    let config = ConfigMsg {
        width: cli.width,
        height: cli.height,
        frame_rate: cli.fps,
        target_bitrate: cli.cbr,
    };
    sock.send(&Msg::Config(config).serialize())?;

    let mut decoder = Decoder::new(cli.width, cli.height, lazy_level, cli.output)?;

    // main loop: the socket stays blocking
    loop {
        let Some(data) = sock.recv()? else {
            continue;
        };

        // a datagram that cannot be parsed is a protocol violation
        let datagram = Datagram::parse(&data)?;

        // ACK every received datagram immediately
        let ack = AckMsg::for_datagram(&datagram);
        sock.send(&Msg::Ack(ack).serialize())?;
        debug!(
            frame_id = datagram.frame_id,
            frag_id = datagram.frag_id,
            "acked datagram"
        );

        decoder.add_datagram(datagram)?;

        // consume every frame that is (or has become) decodable
        while decoder.next_frame_complete() {
            decoder.consume_next_frame()?;
        }
    }
}
