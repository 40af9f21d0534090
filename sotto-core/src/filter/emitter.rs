//! Publication rules for partial and final hypotheses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::events::{ResultKind, TranscriptEvent};
use crate::filter::state::FilterState;
use crate::filter::FilterDiagnostics;

pub(crate) struct ResultEmitter {
    seq: AtomicU64,
    tx: broadcast::Sender<TranscriptEvent>,
    diagnostics: Arc<FilterDiagnostics>,
}

impl ResultEmitter {
    pub fn new(tx: broadcast::Sender<TranscriptEvent>, diagnostics: Arc<FilterDiagnostics>) -> Self {
        Self {
            seq: AtomicU64::new(0),
            tx,
            diagnostics,
        }
    }

    /// One-way notification; a host with no subscriber loses nothing but
    /// the event.
    pub fn publish(&self, kind: ResultKind, text: String) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            ResultKind::Partial => &self.diagnostics.partials_emitted,
            ResultKind::Final => &self.diagnostics.finals_emitted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(TranscriptEvent { seq, kind, text });
    }

    /// Commit a final result: the cached partial dies with the utterance and
    /// the processed-byte accounting restarts. Empty sentinel text is not
    /// published.
    pub fn emit_final(&self, st: &mut FilterState, text: String) {
        st.last_partial = None;
        st.last_partial_pts = None;
        st.processed_bytes = 0;
        if text.is_empty() {
            debug!("final result empty; suppressing event");
            return;
        }
        self.publish(ResultKind::Final, text);
    }

    /// Query and maybe publish a partial for the frame at `pts`.
    ///
    /// Skipped when partials are disabled, when the configured interval
    /// since the last published partial (in presentation time) has not
    /// elapsed, when the engine has nothing, or when the hypothesis has not
    /// changed.
    pub fn try_emit_partial(&self, st: &mut FilterState, pts: Duration) {
        let interval = st.partial_interval_ms;
        if interval < 0 {
            return;
        }
        if interval > 0 {
            if let Some(last) = st.last_partial_pts {
                if pts.saturating_sub(last) < Duration::from_millis(interval as u64) {
                    return;
                }
            }
        }

        let text = match st.binding.as_mut() {
            Some(binding) => binding.instance.partial(),
            None => return,
        };
        if text.is_empty() {
            return;
        }
        if st.last_partial.as_deref() == Some(text.as_str()) {
            return;
        }

        st.last_partial = Some(text.clone());
        st.last_partial_pts = Some(pts);
        self.publish(ResultKind::Partial, text);
    }

    /// Force the recognizer to produce a final result for everything it has
    /// consumed, returning the text to the caller instead of publishing.
    ///
    /// Returns `None` — and produces no side effect on the cached partial —
    /// when nothing has been processed since the last final, so an
    /// end-of-stream right after a final result stays silent.
    pub fn force_final(&self, st: &mut FilterState) -> Option<String> {
        if st.processed_bytes == 0 {
            debug!("no data processed since last final; skipping");
            return None;
        }
        let text = match st.binding.as_mut() {
            Some(binding) => binding.instance.final_result(),
            None => return None,
        };
        st.last_partial = None;
        st.last_partial_pts = None;
        st.processed_bytes = 0;
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}
