//! UDP socket wrapper with `WouldBlock` translation.
//!
//! Transient `EWOULDBLOCK` conditions are reported as `Ok(false)` /
//! `Ok(None)` so the event loop can re-arm interest; every other errno
//! is fatal and propagates as an error.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use crate::error::LumenError;

/// Largest datagram we ever expect on the wire; an MTU-sized payload
/// plus headers fits comfortably.
const RECV_BUF_SIZE: usize = 2048;

/// UDP socket carrying datagrams one way and control messages the
/// other.
pub struct UdpLink {
    socket: UdpSocket,
}

impl UdpLink {
    /// Bind to `port` on all interfaces (sender side); port 0 lets the
    /// OS choose.
    pub fn bind(port: u16) -> Result<Self, LumenError> {
        Ok(Self {
            socket: UdpSocket::bind(("0.0.0.0", port))?,
        })
    }

    /// Bind to an ephemeral port and connect to `peer` (receiver side).
    pub fn connect<A: ToSocketAddrs>(peer: A) -> Result<Self, LumenError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(peer)?;
        Ok(Self { socket })
    }

    /// Connect an already-bound socket to the observed peer.
    pub fn connect_peer(&self, peer: SocketAddr) -> Result<(), LumenError> {
        Ok(self.socket.connect(peer)?)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), LumenError> {
        Ok(self.socket.set_nonblocking(nonblocking)?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LumenError> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one datagram on the connected socket.
    ///
    /// Returns false when the kernel would block; retry on the next
    /// writability event.
    pub fn send(&self, data: &[u8]) -> Result<bool, LumenError> {
        match self.socket.send(data) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Receive one datagram on the connected socket.
    ///
    /// `None` means the socket would block; on a blocking socket this
    /// waits for data.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, LumenError> {
        let mut buf = [0u8; RECV_BUF_SIZE];
        match self.socket.recv(&mut buf) {
            Ok(len) => Ok(Some(buf[..len].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Receive one datagram and the peer that sent it. Blocks; used
    /// for the config handshake before the socket is connected.
    pub fn recv_from(&self) -> Result<(SocketAddr, Vec<u8>), LumenError> {
        let mut buf = [0u8; RECV_BUF_SIZE];
        let (len, peer) = self.socket.recv_from(&mut buf)?;
        Ok((peer, buf[..len].to_vec()))
    }
}

impl AsRawFd for UdpLink {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

// ── Tests ────────────────────────────────────────────────────────
