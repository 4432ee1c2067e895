//! Periodic timerfd for frame pacing and statistics.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use mio_timerfd::{ClockId, TimerFd};

/// A monotonic periodic timer backed by a timerfd.
///
/// Readiness is multiplexed through the event loop like any other fd;
/// [`expirations`](Self::expirations) reports how many periods have
/// elapsed since the last read, returning 0 when the timer has not
/// fired so callers can short-circuit spurious wakeups.
pub struct PeriodicTimer {
    inner: TimerFd,
}

impl PeriodicTimer {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: TimerFd::new(ClockId::Monotonic)?,
        })
    }

    /// Arm the timer to fire every `period`, starting one period from
    /// now.
    pub fn arm(&mut self, period: Duration) -> io::Result<()> {
        self.inner.set_timeout_interval(&period)
    }

    /// Number of periods elapsed since the last read.
    pub fn expirations(&mut self) -> io::Result<u64> {
        match self.inner.read() {
            Ok(count) => Ok(count),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for PeriodicTimer {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

// ── Tests ────────────────────────────────────────────────────────
