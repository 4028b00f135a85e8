//! Response reassembly
//!
//! A response announces its total length in byte 1. Transports deliver it as
//! one or more notification chunks, which are concatenated verbatim until the
//! declared length is reached. Only one response is ever in flight, so every
//! chunk that arrives while a response is incomplete is treated as its
//! continuation.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;

use super::framing::LENGTH_OFFSET;

/// Result of feeding a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The response is complete
    Complete(Bytes),
    /// More chunks are needed
    Incomplete {
        /// Bytes accumulated so far
        received: usize,
        /// Declared total length, once byte 1 has arrived
        expected: Option<usize>,
    },
}

/// Accumulates notification chunks into complete responses
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    started_at: Option<Instant>,
    stall_timeout: Duration,
}

impl Reassembler {
    /// Create a reassembler that abandons partial responses older than `stall_timeout`
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
            started_at: None,
            stall_timeout,
        }
    }

    /// Whether a partial response is buffered
    pub fn is_in_progress(&self) -> bool {
        self.started_at.is_some()
    }

    /// Declared length of the buffered response
    pub fn expected(&self) -> Option<usize> {
        self.buffer.get(LENGTH_OFFSET).map(|&len| usize::from(len))
    }

    /// Bytes buffered so far
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial response
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.started_at = None;
    }

    /// Drop a partial response that has been waiting longer than the stall timeout.
    ///
    /// Returns the number of bytes discarded.
    pub fn discard_if_stalled(&mut self, now: Instant) -> Option<usize> {
        let started_at = self.started_at?;
        if now.saturating_duration_since(started_at) <= self.stall_timeout {
            return None;
        }
        let discarded = self.buffer.len();
        self.reset();
        Some(discarded)
    }

    /// Feed one notification chunk
    pub fn push(&mut self, chunk: &[u8], now: Instant) -> Progress {
        if chunk.is_empty() {
            return self.progress();
        }
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.buffer.extend_from_slice(chunk);

        match self.expected() {
            Some(expected) if self.buffer.len() >= expected => {
                self.started_at = None;
                Progress::Complete(self.buffer.split().freeze())
            }
            _ => self.progress(),
        }
    }

    fn progress(&self) -> Progress {
        Progress::Incomplete {
            received: self.buffer.len(),
            expected: self.expected(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::framing::{build_response, COMMAND_RESPONSE};

    fn sample_response() -> Vec<u8> {
        let payload: Vec<u8> = (0..140u8).collect();
        build_response(COMMAND_RESPONSE, 0x50, 0xF0, &payload).unwrap()
    }

    fn feed_all(chunk_size: usize, response: &[u8]) -> Vec<Bytes> {
        let now = Instant::now();
        let mut reassembler = Reassembler::new(Duration::from_secs(2));
        let mut complete = Vec::new();
        for chunk in response.chunks(chunk_size) {
            if let Progress::Complete(bytes) = reassembler.push(chunk, now) {
                complete.push(bytes);
            }
        }
        assert!(!reassembler.is_in_progress());
        complete
    }

    #[test]
    fn test_single_chunk() {
        let response = sample_response();
        let complete = feed_all(response.len(), &response);
        assert_eq!(complete, vec![Bytes::from(response)]);
    }

    #[test]
    fn test_any_chunk_boundary_gives_same_result() {
        let response = sample_response();
        for size in [1, 2, 3, 7, 20, 63, 145] {
            let complete = feed_all(size, &response);
            assert_eq!(complete.len(), 1, "chunk size {}", size);
            assert_eq!(complete[0].as_ref(), response.as_slice());
        }
    }

    #[test]
    fn test_incomplete_reports_progress() {
        let now = Instant::now();
        let mut reassembler = Reassembler::new(Duration::from_secs(2));
        assert_eq!(
            reassembler.push(&[0x5A], now),
            Progress::Incomplete { received: 1, expected: None }
        );
        assert_eq!(
            reassembler.push(&[0x08, 0x00], now),
            Progress::Incomplete { received: 3, expected: Some(8) }
        );
        assert!(reassembler.is_in_progress());
    }

    #[test]
    fn test_unrelated_chunk_is_appended() {
        let now = Instant::now();
        let mut reassembler = Reassembler::new(Duration::from_secs(2));
        reassembler.push(&[0x5A, 0x08, 0x00, 0x00], now);
        // Looks like a fresh measurement header but is treated as continuation
        let progress = reassembler.push(&[0x20, 0x0C, 0x00, 0x00], now);
        assert_eq!(
            progress,
            Progress::Complete(Bytes::from_static(&[0x5A, 0x08, 0x00, 0x00, 0x20, 0x0C, 0x00, 0x00]))
        );
    }

    #[test]
    fn test_stalled_response_is_discarded() {
        let start = Instant::now();
        let mut reassembler = Reassembler::new(Duration::from_millis(500));
        reassembler.push(&[0x5A, 0x40, 0x00], start);

        assert_eq!(reassembler.discard_if_stalled(start + Duration::from_millis(400)), None);
        assert_eq!(reassembler.discard_if_stalled(start + Duration::from_millis(600)), Some(3));
        assert!(!reassembler.is_in_progress());

        let progress = reassembler.push(&[0x5A, 0x02], start + Duration::from_millis(700));
        assert_eq!(progress, Progress::Complete(Bytes::from_static(&[0x5A, 0x02])));
    }
}
