//! Buffering for connectivity messages that arrive early.

use std::collections::VecDeque;

use crate::signal::CandidateInit;

/// FIFO for remote candidates received before the transport has a remote
/// description applied.
///
/// Starts closed: `push` queues. `drain` yields the queue in arrival order
/// exactly once and latches the buffer open; from then on `push` hands the
/// candidate straight back for immediate application. One instance per
/// session, discarded at teardown.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<CandidateInit>,
    open: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate, or hand it back once the buffer is open.
    pub fn push(&mut self, candidate: CandidateInit) -> Option<CandidateInit> {
        if self.open {
            Some(candidate)
        } else {
            self.queue.push_back(candidate);
            None
        }
    }

    /// Yield everything buffered, in arrival order, and latch open.
    pub fn drain(&mut self) -> Vec<CandidateInit> {
        self.open = true;
        self.queue.drain(..).collect()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Discard anything still queued. Part of session teardown.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: usize) -> CandidateInit {
        CandidateInit::new(format!("candidate:{n}"))
    }

    #[test]
    fn test_buffers_in_arrival_order() {
        let mut buffer = CandidateBuffer::new();
        for n in 0..5 {
            assert!(buffer.push(candidate(n)).is_none());
        }
        assert_eq!(buffer.len(), 5);

        let drained = buffer.drain();
        let order: Vec<_> = drained.iter().map(|c| c.candidate.clone()).collect();
        assert_eq!(
            order,
            ["candidate:0", "candidate:1", "candidate:2", "candidate:3", "candidate:4"]
        );
    }

    #[test]
    fn test_drain_yields_once() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(0));
        assert_eq!(buffer.drain().len(), 1);
        assert!(buffer.drain().is_empty());
        assert!(buffer.is_open());
    }

    #[test]
    fn test_push_after_drain_passes_through() {
        let mut buffer = CandidateBuffer::new();
        buffer.drain();
        let returned = buffer.push(candidate(7));
        assert_eq!(returned, Some(candidate(7)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear_discards_without_opening() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(0));
        buffer.push(candidate(1));
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.is_open());
    }
}
