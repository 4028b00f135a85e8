//! Single-flight command queue
//!
//! Commands are written strictly one at a time: the head of the queue is
//! handed to the writer once, and nothing behind it is released until the
//! head is resolved by a matching response, times out, or fails. Responses are
//! correlated by the `(command, sequence)` pair the device echoes back.
//!
//! [`CommandQueue::fail_all`] closes the queue: later commands fail with
//! [`CommandError::Disconnected`] until [`CommandQueue::reopen`].

use crate::core::protocol::framing::{Frame, FrameError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default time allowed for a response after the command is written
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Command failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No response within the timeout
    #[error("Command 0x{command:02X} (sequence 0x{sequence:02X}) timed out")]
    Timeout {
        /// Command code
        command: u8,
        /// Sequence id
        sequence: u8,
    },

    /// Writing the command failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The link went away before a response arrived
    #[error("Device disconnected")]
    Disconnected,

    /// The command could not be framed
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// A command with the same correlation key is still pending
    #[error("Command 0x{command:02X} with sequence 0x{sequence:02X} already pending")]
    DuplicateKey {
        /// Command code
        command: u8,
        /// Sequence id
        sequence: u8,
    },
}

/// Reply channel of a pending command
pub type Reply = oneshot::Receiver<Result<Bytes, CommandError>>;

/// A command waiting for its response
#[derive(Debug)]
pub struct PendingCommand {
    frame: Frame,
    sent_at: Option<Instant>,
    reply: oneshot::Sender<Result<Bytes, CommandError>>,
}

impl PendingCommand {
    /// Correlation key
    pub fn key(&self) -> (u8, u8) {
        (self.frame.command, self.frame.sequence)
    }

    /// Whether the command has been handed to the writer
    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    fn complete(self, result: Result<Bytes, CommandError>) {
        // The caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

/// FIFO of pending commands
#[derive(Debug)]
pub struct CommandQueue {
    pending: VecDeque<PendingCommand>,
    timeout: Duration,
    closed: bool,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl CommandQueue {
    /// Create a queue with a response timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            timeout,
            closed: false,
        }
    }

    /// Response timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Append a framed command
    pub fn enqueue(&mut self, frame: Frame) -> Result<Reply, CommandError> {
        if self.closed {
            return Err(CommandError::Disconnected);
        }
        if self.contains(frame.command, frame.sequence) {
            return Err(CommandError::DuplicateKey {
                command: frame.command,
                sequence: frame.sequence,
            });
        }
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(PendingCommand {
            frame,
            sent_at: None,
            reply: tx,
        });
        Ok(rx)
    }

    /// Release the head for writing if nothing is in flight.
    ///
    /// The head is marked sent at `now`, which starts its timeout.
    pub fn poll_send(&mut self, now: Instant) -> Option<Frame> {
        let head = self.pending.front_mut()?;
        if head.sent_at.is_some() {
            return None;
        }
        head.sent_at = Some(now);
        Some(head.frame.clone())
    }

    fn position(&self, command: u8, sequence: u8) -> Option<usize> {
        self.pending.iter().position(|p| p.key() == (command, sequence))
    }

    /// Resolve the entry matching a response; returns whether one matched
    pub fn resolve(&mut self, command: u8, sequence: u8, payload: Bytes) -> bool {
        match self.position(command, sequence).and_then(|i| self.pending.remove(i)) {
            Some(entry) => {
                entry.complete(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Fail one entry; returns whether it was pending
    pub fn fail(&mut self, command: u8, sequence: u8, error: CommandError) -> bool {
        match self.position(command, sequence).and_then(|i| self.pending.remove(i)) {
            Some(entry) => {
                entry.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every entry whose timeout has elapsed; returns their keys.
    ///
    /// Each timed-out entry is removed on its own; entries that have not been
    /// written are never timed out.
    pub fn expire(&mut self, now: Instant) -> Vec<(u8, u8)> {
        let timeout = self.timeout;
        let expired: Vec<(u8, u8)> = self
            .pending
            .iter()
            .filter(|p| p.sent_at.is_some_and(|at| now.saturating_duration_since(at) >= timeout))
            .map(PendingCommand::key)
            .collect();

        for &(command, sequence) in &expired {
            self.fail(command, sequence, CommandError::Timeout { command, sequence });
        }
        expired
    }

    /// Fail and drop every entry, then close the queue
    pub fn fail_all(&mut self, error: CommandError) -> usize {
        self.closed = true;
        let count = self.pending.len();
        for entry in self.pending.drain(..) {
            entry.complete(Err(error.clone()));
        }
        count
    }

    /// Accept commands again after [`fail_all`](Self::fail_all)
    pub fn reopen(&mut self) {
        self.closed = false;
    }

    /// Whether the queue rejects new commands
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Key of the command currently awaiting its response
    pub fn in_flight(&self) -> Option<(u8, u8)> {
        self.pending.front().filter(|p| p.is_sent()).map(PendingCommand::key)
    }

    /// Whether an entry with this key is pending
    pub fn contains(&self, command: u8, sequence: u8) -> bool {
        self.position(command, sequence).is_some()
    }
}
