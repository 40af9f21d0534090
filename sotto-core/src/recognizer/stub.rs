//! `StubBackend` — placeholder engine that segments on signal energy.
//!
//! Produces deterministic vosk-shaped JSON payloads so the full filter
//! (loading, buffering, throttling, event flow) can be exercised end-to-end
//! without a real model on disk.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::error::Result;
use crate::recognizer::{FeedOutcome, Recognizer, SpeechBackend, SpeechModel};

/// Consecutive quiet chunks that close an utterance.
const SILENCE_CHUNKS_FOR_FINAL: u32 = 3;

/// RMS threshold (i16 full-scale) separating speech from silence.
const SPEECH_RMS: f64 = 200.0;

/// Echo-style stub engine.
///
/// `load_model` always succeeds; the "model" only remembers its path.
#[derive(Debug, Default)]
pub struct StubBackend;

impl StubBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SpeechBackend for StubBackend {
    fn load_model(&self, path: &Path) -> Result<Arc<dyn SpeechModel>> {
        debug!(path = %path.display(), "stub model constructed");
        Ok(Arc::new(StubLoadedModel))
    }
}

struct StubLoadedModel;

impl SpeechModel for StubLoadedModel {
    fn bind(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>> {
        Ok(Box::new(StubRecognizer {
            sample_rate,
            utterance_bytes: 0,
            quiet_streak: 0,
            heard_speech: false,
        }))
    }
}

/// For every chunk with signal it reports a partial; a run of quiet chunks
/// after speech closes the utterance with `[stub: <N> bytes @ <SR> Hz]`.
struct StubRecognizer {
    sample_rate: u32,
    utterance_bytes: u64,
    quiet_streak: u32,
    heard_speech: bool,
}

impl StubRecognizer {
    fn utterance_text(&self) -> String {
        format!(
            "[stub: {} bytes @ {} Hz]",
            self.utterance_bytes, self.sample_rate
        )
    }

    fn close_utterance(&mut self) -> String {
        if !self.heard_speech || self.utterance_bytes == 0 {
            return String::new();
        }
        let payload = json!({ "text": self.utterance_text() }).to_string();
        self.utterance_bytes = 0;
        self.quiet_streak = 0;
        self.heard_speech = false;
        payload
    }
}

impl Recognizer for StubRecognizer {
    fn accept(&mut self, bytes: &[u8]) -> Result<FeedOutcome> {
        self.utterance_bytes += bytes.len() as u64;

        if rms_i16(bytes) >= SPEECH_RMS {
            self.heard_speech = true;
            self.quiet_streak = 0;
            return Ok(FeedOutcome::PartialReady);
        }

        if self.heard_speech {
            self.quiet_streak += 1;
            if self.quiet_streak >= SILENCE_CHUNKS_FOR_FINAL {
                return Ok(FeedOutcome::FinalReady);
            }
        }
        Ok(FeedOutcome::NoResult)
    }

    fn partial(&mut self) -> String {
        if !self.heard_speech {
            return String::new();
        }
        json!({ "partial": self.utterance_text() }).to_string()
    }

    fn result(&mut self) -> String {
        self.close_utterance()
    }

    fn final_result(&mut self) -> String {
        self.close_utterance()
    }

    fn set_alternatives(&mut self, n: u32) {
        debug!(alternatives = n, "stub recognizer ignores alternatives");
    }

    fn reset(&mut self) {
        self.utterance_bytes = 0;
        self.quiet_streak = 0;
        self.heard_speech = false;
    }
}

fn rms_i16(bytes: &[u8]) -> f64 {
    let samples = bytes.len() / 2;
    if samples == 0 {
        return 0.0;
    }
    let sum_sq: f64 = bytes
        .chunks_exact(2)
        .map(|pair| {
            let s = i16::from_le_bytes([pair[0], pair[1]]) as f64;
            s * s
        })
        .sum();
    (sum_sq / samples as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud(len: usize) -> Vec<u8> {
        (0..len / 2)
            .flat_map(|_| 4000i16.to_le_bytes())
            .collect()
    }

    fn quiet(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    #[test]
    fn speech_then_silence_yields_partial_then_final() {
        let model = StubBackend::new()
            .load_model(Path::new("/tmp/does-not-matter"))
            .expect("stub load");
        let mut rec = model.bind(16_000).expect("bind");

        assert_eq!(rec.accept(&loud(640)).unwrap(), FeedOutcome::PartialReady);
        let partial = rec.partial();
        assert!(partial.contains("partial"), "got {partial}");

        assert_eq!(rec.accept(&quiet(640)).unwrap(), FeedOutcome::NoResult);
        assert_eq!(rec.accept(&quiet(640)).unwrap(), FeedOutcome::NoResult);
        assert_eq!(rec.accept(&quiet(640)).unwrap(), FeedOutcome::FinalReady);

        let text = rec.result();
        assert!(text.contains("16000 Hz"), "got {text}");

        // Utterance closed: nothing further to report.
        assert!(rec.final_result().is_empty());
    }

    #[test]
    fn silence_only_never_finalizes() {
        let model = StubBackend::new()
            .load_model(Path::new("/tmp/does-not-matter"))
            .expect("stub load");
        let mut rec = model.bind(8_000).expect("bind");

        for _ in 0..10 {
            assert_eq!(rec.accept(&quiet(320)).unwrap(), FeedOutcome::NoResult);
        }
        assert!(rec.partial().is_empty());
        assert!(rec.final_result().is_empty());
    }
}
