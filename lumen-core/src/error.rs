//! Domain-specific error types for the lumen transport.
//!
//! All fallible operations return `Result<T, LumenError>`. Transient
//! `EWOULDBLOCK` conditions are translated at the socket boundary (see
//! [`crate::net`]) and never surface as an error; expected losses
//! (stale datagrams, stale ACKs, missing fragments) are silent policy
//! decisions, not errors.

use thiserror::Error;

use crate::datagram::HEADER_SIZE;

/// The canonical error type for the lumen transport.
#[derive(Debug, Error)]
pub enum LumenError {
    // ── Configuration ────────────────────────────────────────────
    /// Invalid startup configuration (MTU range, lazy level,
    /// mismatched dimensions).
    #[error("invalid configuration: {0}")]
    Config(String),

    // ── Parse ────────────────────────────────────────────────────
    /// A received datagram is too short to contain a header.
    #[error("short datagram: {len} bytes cannot hold a {header}-byte header", header = HEADER_SIZE)]
    TruncatedDatagram { len: usize },

    // ── Protocol state ───────────────────────────────────────────
    /// A state invariant was violated — a programming or peer bug.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// An encoded frame needs more fragments than `frag_cnt` can count.
    #[error("frame of {frame_size} bytes would need {frag_cnt} fragments (max {max})", max = u16::MAX)]
    TooManyFragments { frame_size: usize, frag_cnt: usize },

    // ── Codec / video I/O ────────────────────────────────────────
    /// The VP9 codec reported an error.
    #[error("codec error: {0}")]
    Codec(String),

    /// The display sink reported an error.
    #[error("display error: {0}")]
    Display(String),

    /// The video source ran out of frames (non-loop mode).
    #[error("reached the end of video input")]
    InputExhausted,

    // ── I/O ──────────────────────────────────────────────────────
    /// A fatal error from a socket, timer or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = LumenError::TruncatedDatagram { len: 5 };
        assert!(e.to_string().contains('5'));
        assert!(e.to_string().contains("17"));

        let e = LumenError::Config("MTU out of range".into());
        assert!(e.to_string().contains("MTU"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: LumenError = io_err.into();
        assert!(matches!(e, LumenError::Io(_)));
    }
}
