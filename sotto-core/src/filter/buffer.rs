//! FIFO of frames awaiting an engine instance.
//!
//! Grows without bound while no recognizer is ready — upstream is expected
//! to apply its own backpressure. Draining is capped per call so a deep
//! backlog cannot hold the state lock indefinitely.

use std::collections::VecDeque;

use crate::frame::AudioFrame;

/// Frames handed to the engine per drain call; the remainder waits for the
/// next delivery.
pub(crate) const DRAIN_BATCH_FRAMES: usize = 10;

#[derive(Debug, Default)]
pub(crate) struct FrameBuffer {
    queue: VecDeque<AudioFrame>,
}

impl FrameBuffer {
    pub fn push(&mut self, frame: AudioFrame) {
        self.queue.push_back(frame);
    }

    pub fn pop(&mut self) -> Option<AudioFrame> {
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
