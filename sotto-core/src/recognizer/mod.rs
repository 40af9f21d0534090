//! Recognition engine seam.
//!
//! The filter consumes speech recognition as an opaque capability through
//! three object-safe traits:
//!
//! - [`SpeechBackend`] builds a [`SpeechModel`] from a path. Construction
//!   time is unbounded (large models can take seconds to map), which is why
//!   the filter only ever calls it from the loader's worker thread.
//! - [`SpeechModel`] binds a sample-rate-specific [`Recognizer`] instance.
//!   Binding an already-loaded model is assumed cheap.
//! - [`Recognizer`] consumes raw S16LE mono bytes and exposes partial/final
//!   hypotheses. A single instance is NOT assumed internally thread-safe;
//!   the filter serialises every call through its state mutex.
//!
//! `&mut self` on the recognizer intentionally expresses that decoders are
//! stateful. Destruction is `Drop`.

pub mod stub;

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

/// Outcome of feeding one chunk of audio to a recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// The chunk was consumed; nothing worth querying yet.
    NoResult,
    /// An (unstable) partial hypothesis may be read.
    PartialReady,
    /// The current utterance ended; a stable result may be read.
    FinalReady,
}

/// Entry point to a recognition engine implementation.
pub trait SpeechBackend: Send + Sync + 'static {
    /// Construct a model from `path`.
    ///
    /// # Errors
    /// Returns an error if the path does not hold a usable model. The filter
    /// reports this to the host as a fatal resource error.
    fn load_model(&self, path: &Path) -> Result<Arc<dyn SpeechModel>>;
}

/// A fully constructed model, shareable across recognizer rebinds.
pub trait SpeechModel: Send + Sync + 'static {
    /// Bind a recognizer instance for `sample_rate` Hz input.
    ///
    /// # Errors
    /// Returns an error if the model cannot decode at this rate.
    fn bind(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>>;
}

/// A live, sample-rate-bound recognition instance.
pub trait Recognizer: Send + 'static {
    /// Consume one chunk of raw S16LE mono PCM.
    ///
    /// # Errors
    /// A feed error is absorbed by the filter: logged, recognition skipped
    /// for the chunk, audio flow unaffected.
    fn accept(&mut self, bytes: &[u8]) -> Result<FeedOutcome>;

    /// Read the current partial hypothesis. Empty string means "nothing".
    fn partial(&mut self) -> String;

    /// Read the result for the utterance that just ended (after
    /// [`FeedOutcome::FinalReady`]). Empty string means "nothing".
    fn result(&mut self) -> String;

    /// Force a final result for whatever audio has been consumed, ending the
    /// current utterance. Empty string means "nothing".
    fn final_result(&mut self) -> String;

    /// Maximum number of alternative hypotheses to produce.
    fn set_alternatives(&mut self, n: u32);

    /// Discard all internal decoder state without destroying the instance.
    fn reset(&mut self);
}
