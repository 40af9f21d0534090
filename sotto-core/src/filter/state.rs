//! Shared filter state — every field lives behind the one state mutex.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, SottoError};
use crate::filter::buffer::FrameBuffer;
use crate::filter::loader::CancelToken;
use crate::filter::FilterConfig;
use crate::recognizer::{Recognizer, SpeechModel};

/// Coarse activation state of the filter, independent of the audio format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    /// Constructed or deactivated; no engine, no load in flight.
    Idle,
    /// Waiting for the model loader before activation can complete.
    Activating,
    /// Activation completed; frames flow through recognition.
    Active,
}

/// A constructed model together with the path it came from.
pub(crate) struct LoadedModel {
    pub path: PathBuf,
    pub model: Arc<dyn SpeechModel>,
}

/// A live recognizer instance bound to a sample rate.
///
/// Present only while the bound rate is known to be non-zero and the model
/// it came from is still installed.
pub(crate) struct RecognizerBinding {
    pub instance: Box<dyn Recognizer>,
    pub sample_rate: u32,
}

pub(crate) struct FilterState {
    pub stage: LifecycleStage,
    pub model_path: Option<PathBuf>,
    /// Negotiated input rate in Hz; 0 until the first format event.
    pub sample_rate: u32,
    pub alternatives: u32,
    /// Minimum gap between published partials, in frame-timestamp
    /// milliseconds. `-1` disables partials, `0` publishes on every change.
    pub partial_interval_ms: i64,
    /// Bytes fed to the engine since the last final result (or rebind).
    pub processed_bytes: u64,
    /// Last published partial payload, for change detection.
    pub last_partial: Option<String>,
    /// Presentation time of the last published partial.
    pub last_partial_pts: Option<Duration>,
    /// Frames awaiting an engine instance.
    pub pending: FrameBuffer,
    pub model: Option<LoadedModel>,
    pub binding: Option<RecognizerBinding>,
    /// Cancellation token of the load currently in flight.
    pub load: Option<CancelToken>,
    /// True from load submission until a handle installs (or the load dies).
    pub buffering: bool,
    /// True between flush-start and flush-stop.
    pub flushing: bool,
}

impl FilterState {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            stage: LifecycleStage::Idle,
            model_path: config.model_path.clone(),
            sample_rate: 0,
            alternatives: config.alternatives.min(super::MAX_ALTERNATIVES),
            partial_interval_ms: config.partial_interval_ms,
            processed_bytes: 0,
            last_partial: None,
            last_partial_pts: None,
            pending: FrameBuffer::default(),
            model: None,
            binding: None,
            load: None,
            buffering: false,
            flushing: false,
        }
    }

    /// Bind a recognizer from the installed model at the negotiated rate.
    ///
    /// Resets the processed-byte counter: a fresh instance has consumed
    /// nothing.
    pub fn bind_recognizer(&mut self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(SottoError::InvalidRate(0));
        }
        let Some(loaded) = self.model.as_ref() else {
            return Err(SottoError::Engine("no model installed".into()));
        };
        let mut instance = loaded.model.bind(self.sample_rate)?;
        instance.set_alternatives(self.alternatives);
        self.binding = Some(RecognizerBinding {
            instance,
            sample_rate: self.sample_rate,
        });
        self.processed_bytes = 0;
        Ok(())
    }

    /// Drop the recognizer and model. The negotiated rate is kept — it
    /// belongs to the stream format, not the engine.
    pub fn clear_engine(&mut self) {
        if self.binding.take().is_some() {
            self.processed_bytes = 0;
        }
        self.model = None;
    }

    /// Cancel the in-flight load, if any. Advisory: the worker discards its
    /// result under the lock; nobody blocks here.
    pub fn cancel_load(&mut self) {
        if let Some(token) = self.load.take() {
            debug!("cancelling in-flight model load");
            token.cancel();
        }
        self.buffering = false;
    }

    /// Return to the idle stage, releasing everything.
    pub fn reset_idle(&mut self) {
        self.last_partial = None;
        self.last_partial_pts = None;
        self.cancel_load();
        self.pending.clear();
        self.clear_engine();
        self.processed_bytes = 0;
        self.flushing = false;
        self.stage = LifecycleStage::Idle;
    }
}
