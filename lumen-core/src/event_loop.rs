//! Readiness-based event dispatcher over raw file descriptors.
//!
//! A roster on top of `mio::Poll`: callbacks are registered per
//! `(fd, direction)`, directions can be activated and deactivated at
//! runtime, and deregistration is deferred until the next [`poll`]
//! so a callback may remove its own fd.
//!
//! Callbacks receive a mutable reference to a caller-owned context,
//! which keeps the loop itself free of domain state; interest changes
//! from inside a callback go through a cloneable [`LoopHandle`] and
//! take effect at the top of the next `poll`.
//!
//! `mio` delivers edge-triggered readiness, so callbacks must drain
//! their fd until `WouldBlock` before returning.
//!
//! [`poll`]: EventLoop::poll

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::LumenError;

/// Readiness direction to monitor on a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Callback fired when a registered `(fd, direction)` becomes ready.
pub type Callback<C> = Box<dyn FnMut(&mut C) -> Result<(), LumenError>>;

enum Command {
    Activate(RawFd, Direction),
    Deactivate(RawFd, Direction),
    Deregister(RawFd),
}

// ── LoopHandle ───────────────────────────────────────────────────

/// Cloneable handle for adjusting interest from inside callbacks.
///
/// Commands queue up and are applied at the top of the next
/// [`EventLoop::poll`].
#[derive(Clone, Default)]
pub struct LoopHandle {
    commands: Rc<RefCell<VecDeque<Command>>>,
}

impl LoopHandle {
    /// Request that `(fd, direction)` be activated (idempotent).
    pub fn activate(&self, fd: RawFd, direction: Direction) {
        self.commands
            .borrow_mut()
            .push_back(Command::Activate(fd, direction));
    }

    /// Request that `(fd, direction)` be deactivated (idempotent).
    pub fn deactivate(&self, fd: RawFd, direction: Direction) {
        self.commands
            .borrow_mut()
            .push_back(Command::Deactivate(fd, direction));
    }

    /// Schedule `fd` for removal before the next wait.
    pub fn deregister(&self, fd: RawFd) {
        self.commands.borrow_mut().push_back(Command::Deregister(fd));
    }
}

// ── EventLoop ────────────────────────────────────────────────────

struct FdEntry<C> {
    token: Token,
    read_cb: Option<Callback<C>>,
    write_cb: Option<Callback<C>>,
    active_in: bool,
    active_out: bool,
    /// Whether the fd is currently registered with the mio registry
    /// (it is pulled out while every direction is deactivated).
    registered: bool,
}

impl<C> FdEntry<C> {
    fn interest(&self) -> Option<Interest> {
        match (self.active_in, self.active_out) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Readiness dispatcher multiplexing sockets and timers for a
/// single-threaded cooperative loop.
pub struct EventLoop<C> {
    poll: Poll,
    events: Events,
    roster: HashMap<RawFd, FdEntry<C>>,
    tokens: HashMap<Token, RawFd>,
    next_token: usize,
    handle: LoopHandle,
}

impl<C> EventLoop<C> {
    pub fn new() -> Result<Self, LumenError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            roster: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
            handle: LoopHandle::default(),
        })
    }

    /// Handle for adjusting interest from inside callbacks.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Register a callback for `(fd, direction)` and activate it.
    ///
    /// Registering the same `(fd, direction)` twice is a programming
    /// error.
    pub fn register(
        &mut self,
        fd: RawFd,
        direction: Direction,
        callback: Callback<C>,
    ) -> Result<(), LumenError> {
        let next_token = &mut self.next_token;
        let tokens = &mut self.tokens;

        let entry = self.roster.entry(fd).or_insert_with(|| {
            let token = Token(*next_token);
            *next_token += 1;
            tokens.insert(token, fd);
            FdEntry {
                token,
                read_cb: None,
                write_cb: None,
                active_in: false,
                active_out: false,
                registered: false,
            }
        });

        let slot = match direction {
            Direction::In => &mut entry.read_cb,
            Direction::Out => &mut entry.write_cb,
        };
        if slot.is_some() {
            return Err(LumenError::Protocol("attempted to register the same event"));
        }
        *slot = Some(callback);

        match direction {
            Direction::In => entry.active_in = true,
            Direction::Out => entry.active_out = true,
        }
        Self::sync_registration(&self.poll, fd, entry)
    }

    /// Activate a direction on a registered fd (idempotent).
    pub fn activate(&mut self, fd: RawFd, direction: Direction) -> Result<(), LumenError> {
        let entry = self
            .roster
            .get_mut(&fd)
            .ok_or(LumenError::Protocol("fd is not registered"))?;

        match direction {
            Direction::In => entry.active_in = true,
            Direction::Out => entry.active_out = true,
        }
        Self::sync_registration(&self.poll, fd, entry)
    }

    /// Deactivate a direction on a registered fd (idempotent).
    pub fn deactivate(&mut self, fd: RawFd, direction: Direction) -> Result<(), LumenError> {
        let entry = self
            .roster
            .get_mut(&fd)
            .ok_or(LumenError::Protocol("fd is not registered"))?;

        match direction {
            Direction::In => entry.active_in = false,
            Direction::Out => entry.active_out = false,
        }
        Self::sync_registration(&self.poll, fd, entry)
    }

    /// Schedule `fd` for removal; takes effect before the next wait.
    pub fn deregister(&mut self, fd: RawFd) {
        self.handle.deregister(fd);
    }

    /// Wait for ready events and fire the matching callbacks.
    ///
    /// `None` blocks until an event arrives. The first callback error
    /// aborts the dispatch and propagates to the caller.
    pub fn poll(&mut self, ctx: &mut C, timeout: Option<Duration>) -> Result<(), LumenError> {
        self.apply_commands()?;

        self.poll.poll(&mut self.events, timeout)?;

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            let Some(&fd) = self.tokens.get(&token) else {
                continue;
            };
            if readable {
                self.fire(fd, Direction::In, ctx)?;
            }
            if writable {
                self.fire(fd, Direction::Out, ctx)?;
            }
        }

        Ok(())
    }

    fn fire(&mut self, fd: RawFd, direction: Direction, ctx: &mut C) -> Result<(), LumenError> {
        let Some(entry) = self.roster.get_mut(&fd) else {
            return Ok(());
        };

        let slot = match direction {
            Direction::In => &mut entry.read_cb,
            Direction::Out => &mut entry.write_cb,
        };
        if let Some(callback) = slot.as_mut() {
            callback(ctx)?;
        }
        Ok(())
    }

    fn apply_commands(&mut self) -> Result<(), LumenError> {
        let commands: Vec<Command> = self.handle.commands.borrow_mut().drain(..).collect();

        for command in commands {
            match command {
                Command::Activate(fd, direction) => self.activate(fd, direction)?,
                Command::Deactivate(fd, direction) => self.deactivate(fd, direction)?,
                Command::Deregister(fd) => {
                    if let Some(entry) = self.roster.remove(&fd) {
                        self.tokens.remove(&entry.token);
                        if entry.registered {
                            self.poll.registry().deregister(&mut SourceFd(&fd))?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn sync_registration(poll: &Poll, fd: RawFd, entry: &mut FdEntry<C>) -> Result<(), LumenError> {
        match entry.interest() {
            Some(interest) => {
                let mut source = SourceFd(&fd);
                if entry.registered {
                    poll.registry().reregister(&mut source, entry.token, interest)?;
                } else {
                    poll.registry().register(&mut source, entry.token, interest)?;
                    entry.registered = true;
                }
            }
            None => {
                if entry.registered {
                    poll.registry().deregister(&mut SourceFd(&fd))?;
                    entry.registered = false;
                }
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct Counters {
        reads: u32,
        writes: u32,
    }

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    /// Drain an edge-triggered readable fd completely.
    fn drain(stream: &mut UnixStream) {
        let mut buf = [0u8; 256];
        while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut event_loop: EventLoop<Counters> = EventLoop::new().unwrap();
        let (a, _b) = pair();
        let fd = a.as_raw_fd();

        event_loop
            .register(fd, Direction::In, Box::new(|_| Ok(())))
            .unwrap();
        let err = event_loop
            .register(fd, Direction::In, Box::new(|_| Ok(())))
            .unwrap_err();
        assert!(matches!(err, LumenError::Protocol(_)));

        // the other direction on the same fd is fine
        event_loop
            .register(fd, Direction::Out, Box::new(|_| Ok(())))
            .unwrap();
    }

    #[test]
    fn readable_fd_fires_its_callback() {
        let mut event_loop: EventLoop<Counters> = EventLoop::new().unwrap();
        let (mut a, mut b) = pair();
        let fd = a.as_raw_fd();

        event_loop
            .register(
                fd,
                Direction::In,
                Box::new(move |ctx| {
                    ctx.reads += 1;
                    drain(&mut a);
                    Ok(())
                }),
            )
            .unwrap();

        b.write_all(b"ping").unwrap();

        let mut ctx = Counters::default();
        event_loop
            .poll(&mut ctx, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(ctx.reads, 1);
    }

    #[test]
    fn writable_fd_fires_once_registered() {
        let mut event_loop: EventLoop<Counters> = EventLoop::new().unwrap();
        let (a, _b) = pair();
        let fd = a.as_raw_fd();

        event_loop
            .register(
                fd,
                Direction::Out,
                Box::new(|ctx| {
                    ctx.writes += 1;
                    Ok(())
                }),
            )
            .unwrap();

        let mut ctx = Counters::default();
        event_loop
            .poll(&mut ctx, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(ctx.writes, 1);
    }

    #[test]
    fn deactivated_direction_stays_silent() {
        let mut event_loop: EventLoop<Counters> = EventLoop::new().unwrap();
        let (mut a, mut b) = pair();
        let fd = a.as_raw_fd();

        event_loop
            .register(
                fd,
                Direction::In,
                Box::new(move |ctx| {
                    ctx.reads += 1;
                    drain(&mut a);
                    Ok(())
                }),
            )
            .unwrap();
        event_loop.deactivate(fd, Direction::In).unwrap();
        // deactivating again is fine
        event_loop.deactivate(fd, Direction::In).unwrap();

        b.write_all(b"ping").unwrap();

        let mut ctx = Counters::default();
        event_loop
            .poll(&mut ctx, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(ctx.reads, 0);

        // reactivation picks the pending data back up
        event_loop.activate(fd, Direction::In).unwrap();
        event_loop
            .poll(&mut ctx, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(ctx.reads, 1);
    }

    #[test]
    fn handle_commands_apply_on_the_next_poll() {
        let mut event_loop: EventLoop<Counters> = EventLoop::new().unwrap();
        let (a, _b) = pair();
        let fd = a.as_raw_fd();

        let handle = event_loop.handle();
        event_loop
            .register(
                fd,
                Direction::Out,
                Box::new(move |ctx| {
                    ctx.writes += 1;
                    // a callback deactivating its own event
                    handle.deactivate(fd, Direction::Out);
                    Ok(())
                }),
            )
            .unwrap();

        let mut ctx = Counters::default();
        event_loop
            .poll(&mut ctx, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(ctx.writes, 1);

        // the queued deactivation has taken effect by now
        event_loop
            .poll(&mut ctx, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(ctx.writes, 1);
    }

    #[test]
    fn deferred_deregister_takes_effect_before_the_next_wait() {
        let mut event_loop: EventLoop<Counters> = EventLoop::new().unwrap();
        let (a, _b) = pair();
        let fd = a.as_raw_fd();

        event_loop
            .register(
                fd,
                Direction::Out,
                Box::new(|ctx| {
                    ctx.writes += 1;
                    Ok(())
                }),
            )
            .unwrap();
        event_loop.deregister(fd);

        let mut ctx = Counters::default();
        event_loop
            .poll(&mut ctx, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(ctx.writes, 0);

        // the fd can be registered afresh afterwards
        event_loop
            .register(fd, Direction::Out, Box::new(|_| Ok(())))
            .unwrap();
    }

    #[test]
    fn activating_an_unknown_fd_is_an_error() {
        let mut event_loop: EventLoop<Counters> = EventLoop::new().unwrap();
        assert!(event_loop.activate(123_456, Direction::In).is_err());
    }
}
