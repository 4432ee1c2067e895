//! Mutex + condvar handoff queue between the receiver's main thread
//! and its decode worker.
//!
//! The main thread moves completed frames onto the tail and signals;
//! the worker waits for a non-empty queue, drains all of it into a
//! local deque under the lock, then releases the lock before decoding.
//! Closing the queue lets the worker exit once it has drained the
//! remaining frames.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::frame::Frame;

struct QueueState {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Handoff queue carrying completed frames to the decode worker.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Move a completed frame onto the queue and wake the worker.
    pub fn push(&self, frame: Frame) {
        let mut state = self.state.lock().unwrap();
        state.frames.push_back(frame);
        // release the lock before notifying the worker
        drop(state);
        self.ready.notify_one();
    }

    /// Mark the queue closed and wake the worker so it can exit.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.ready.notify_one();
    }

    /// Block until frames are available, then move all of them into
    /// `local`. Returns false once the queue is closed and drained.
    pub fn drain_into(&self, local: &mut VecDeque<Frame>) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.frames.is_empty() {
                local.extend(state.frames.drain(..));
                return true;
            }
            if state.closed {
                return false;
            }
            state = self.ready.wait(state).unwrap();
        }
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
