//! Typed audio frame passed from the host into the filter.

use std::sync::Arc;
use std::time::Duration;

/// One block of raw S16LE mono PCM with its presentation timestamp.
///
/// The payload is reference-counted: queueing a frame for recognition and
/// forwarding it downstream share the same bytes, never a copy.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    data: Arc<[u8]>,
    /// Presentation timestamp relative to the start of the stream.
    pub pts: Duration,
    /// Wall duration covered by this frame's samples.
    pub duration: Duration,
}

impl AudioFrame {
    pub fn new(data: impl Into<Arc<[u8]>>, pts: Duration, duration: Duration) -> Self {
        Self {
            data: data.into(),
            pts,
            duration,
        }
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_payload() {
        let frame = AudioFrame::new(vec![1u8, 2, 3], Duration::ZERO, Duration::from_millis(20));
        let copy = frame.clone();
        assert!(std::ptr::eq(frame.data().as_ptr(), copy.data().as_ptr()));
        assert_eq!(copy.len(), 3);
    }
}
