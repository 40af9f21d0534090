//! The streaming transcription filter.
//!
//! ## Entry points (all serialised through one mutex)
//!
//! ```text
//! host data thread ──► push_frame / format_changed / flush / end_of_stream
//! host control     ──► activate / deactivate / property setters
//! loader worker    ──► install or discard a constructed model
//! ```
//!
//! The mutex is never held across model construction — only before (to read
//! the path and install a cancellation token) and after (to install or
//! discard the result). Frames are forwarded downstream outside the lock,
//! unmodified, whether or not recognition is available.

mod buffer;
pub mod clock;
mod emitter;
mod loader;
mod state;

pub use state::LifecycleStage;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Result, SottoError};
use crate::events::{FilterStatus, ResultKind, StatusEvent, TranscriptEvent};
use crate::frame::AudioFrame;
use crate::recognizer::{FeedOutcome, SpeechBackend};

use buffer::DRAIN_BATCH_FRAMES;
use clock::{MonotonicClock, PipelineClock};
use emitter::ResultEmitter;
use loader::{CancelToken, LoadRequest, ModelLoader};
use state::FilterState;

/// Broadcast channel capacity for host-facing events.
const BROADCAST_CAP: usize = 256;

/// Lag beyond which the filter is considered behind the pipeline and result
/// queries are rationed to once per second of consumed audio.
const CATCH_UP_LAG: Duration = Duration::from_millis(500);

/// Upper bound on the alternatives property.
pub(crate) const MAX_ALTERNATIVES: u32 = 100;

/// Standard model install path used when the host sets nothing else.
pub const DEFAULT_MODEL_PATH: &str = "/usr/share/sotto/model";

/// Configuration for [`SottoFilter`].
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Location of the speech model. `None` means the filter cannot
    /// activate until a path is set.
    pub model_path: Option<PathBuf>,
    /// Number of alternative hypotheses requested from the engine (0–100).
    pub alternatives: u32,
    /// Minimum gap between published partials in frame-timestamp
    /// milliseconds; `-1` disables partials, `0` publishes on every change.
    pub partial_interval_ms: i64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            model_path: Some(PathBuf::from(DEFAULT_MODEL_PATH)),
            alternatives: 0,
            partial_interval_ms: 0,
        }
    }
}

/// Outcome of an [`SottoFilter::activate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// An engine was already installed; the filter is active now.
    Complete,
    /// A model load was started; completion is signalled via a
    /// [`StatusEvent`] (`Active` on success, `Error` then `Idle` on failure).
    Pending,
}

#[derive(Default)]
pub struct FilterDiagnostics {
    pub frames_in: AtomicU64,
    pub frames_forwarded: AtomicU64,
    pub frames_buffered: AtomicU64,
    pub frames_fed: AtomicU64,
    pub feed_errors: AtomicU64,
    pub partials_emitted: AtomicU64,
    pub finals_emitted: AtomicU64,
    pub loads_started: AtomicU64,
    pub loads_installed: AtomicU64,
    pub loads_cancelled: AtomicU64,
    pub loads_failed: AtomicU64,
}

impl FilterDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_buffered: self.frames_buffered.load(Ordering::Relaxed),
            frames_fed: self.frames_fed.load(Ordering::Relaxed),
            feed_errors: self.feed_errors.load(Ordering::Relaxed),
            partials_emitted: self.partials_emitted.load(Ordering::Relaxed),
            finals_emitted: self.finals_emitted.load(Ordering::Relaxed),
            loads_started: self.loads_started.load(Ordering::Relaxed),
            loads_installed: self.loads_installed.load(Ordering::Relaxed),
            loads_cancelled: self.loads_cancelled.load(Ordering::Relaxed),
            loads_failed: self.loads_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub frames_in: u64,
    pub frames_forwarded: u64,
    pub frames_buffered: u64,
    pub frames_fed: u64,
    pub feed_errors: u64,
    pub partials_emitted: u64,
    pub finals_emitted: u64,
    pub loads_started: u64,
    pub loads_installed: u64,
    pub loads_cancelled: u64,
    pub loads_failed: u64,
}

/// The filter element.
///
/// `SottoFilter` is `Send + Sync` — all mutation goes through the state
/// mutex, so the host may deliver frames from one thread and drive
/// properties/lifecycle from others.
pub struct SottoFilter {
    shared: Arc<Mutex<FilterState>>,
    loader: ModelLoader,
    clock: Arc<dyn PipelineClock>,
    downstream: Sender<AudioFrame>,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    status_tx: broadcast::Sender<StatusEvent>,
    emitter: ResultEmitter,
    diagnostics: Arc<FilterDiagnostics>,
}

impl SottoFilter {
    /// Create a filter that forwards every delivered frame to `downstream`.
    pub fn new(
        config: FilterConfig,
        backend: Arc<dyn SpeechBackend>,
        downstream: Sender<AudioFrame>,
    ) -> Self {
        Self::with_clock(config, backend, downstream, Arc::new(MonotonicClock::new()))
    }

    /// As [`new`](Self::new), with an explicit pipeline clock.
    pub fn with_clock(
        config: FilterConfig,
        backend: Arc<dyn SpeechBackend>,
        downstream: Sender<AudioFrame>,
        clock: Arc<dyn PipelineClock>,
    ) -> Self {
        if config.alternatives > MAX_ALTERNATIVES {
            warn!(
                requested = config.alternatives,
                "alternatives clamped to {MAX_ALTERNATIVES}"
            );
        }

        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let diagnostics = Arc::new(FilterDiagnostics::default());
        let shared = Arc::new(Mutex::new(FilterState::new(&config)));
        let emitter = ResultEmitter::new(transcript_tx.clone(), Arc::clone(&diagnostics));
        let loader = ModelLoader::spawn(
            backend,
            Arc::clone(&shared),
            status_tx.clone(),
            Arc::clone(&diagnostics),
        );

        Self {
            shared,
            loader,
            clock,
            downstream,
            transcript_tx,
            status_tx,
            emitter,
            diagnostics,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Move `IDLE → ACTIVATING/ACTIVE`.
    ///
    /// # Errors
    /// - `SottoError::AlreadyActive` if not idle.
    /// - `SottoError::ModelPathUnset` if no path is configured.
    pub fn activate(&self) -> Result<Activation> {
        let mut st = self.shared.lock();
        match st.stage {
            LifecycleStage::Activating | LifecycleStage::Active => {
                Err(SottoError::AlreadyActive)
            }
            LifecycleStage::Idle => {
                if st.model.is_some() {
                    st.stage = LifecycleStage::Active;
                    self.emit_status(FilterStatus::Active, None);
                    return Ok(Activation::Complete);
                }
                let Some(path) = st.model_path.clone() else {
                    return Err(SottoError::ModelPathUnset);
                };
                st.stage = LifecycleStage::Activating;
                // Status first, then the load, all under the lock: the
                // worker cannot install (and signal Active) in between.
                self.emit_status(FilterStatus::Activating, None);
                self.submit_load_locked(&mut st, path);
                Ok(Activation::Pending)
            }
        }
    }

    /// Move back to `IDLE`: cancel any in-flight load (without waiting for
    /// it), release the engine and every buffered frame.
    ///
    /// # Errors
    /// - `SottoError::NotActive` if already idle.
    pub fn deactivate(&self) -> Result<()> {
        let mut st = self.shared.lock();
        if st.stage == LifecycleStage::Idle {
            return Err(SottoError::NotActive);
        }
        st.reset_idle();
        drop(st);
        self.emit_status(FilterStatus::Idle, None);
        info!("filter deactivated");
        Ok(())
    }

    /// Tear the filter down, waiting for the loader worker to acknowledge
    /// cancellation so no load outlives the filter.
    pub fn shutdown(mut self) {
        {
            let mut st = self.shared.lock();
            st.reset_idle();
        }
        self.loader.shutdown();
        info!("filter torn down");
    }

    // ── Data path ────────────────────────────────────────────────────────

    /// Deliver one frame.
    ///
    /// The frame reaches recognition (directly, or via the backlog while no
    /// engine is ready) and is then forwarded downstream unmodified —
    /// recognition failure never stops audio flow.
    pub fn push_frame(&self, frame: AudioFrame) {
        self.diagnostics.frames_in.fetch_add(1, Ordering::Relaxed);
        {
            let mut st = self.shared.lock();
            if st.flushing {
                debug!("flush in progress; frame bypasses recognition");
            } else if st.buffering || st.binding.is_none() {
                st.pending.push(frame.clone());
                self.diagnostics
                    .frames_buffered
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    pts = ?frame.pts,
                    backlog = st.pending.len(),
                    "no recognizer ready; frame buffered"
                );
            } else if !st.pending.is_empty() {
                // Keep arrival order: the new frame joins the tail and the
                // backlog drains first.
                st.pending.push(frame.clone());
                self.drain_backlog_locked(&mut st);
            } else {
                self.process_frame_locked(&mut st, &frame);
            }
        }

        if self.downstream.send(frame).is_ok() {
            self.diagnostics
                .frames_forwarded
                .fetch_add(1, Ordering::Relaxed);
        } else {
            debug!("downstream receiver gone; frame dropped at the edge");
        }
    }

    /// The host negotiated a new input sample rate.
    ///
    /// With a live recognizer at a different rate: emit any pending final,
    /// rebuild the instance at the new rate (cheap, done under the lock).
    /// With only a model: bind the first instance. With neither: record the
    /// rate for when loading completes.
    ///
    /// # Errors
    /// - `SottoError::InvalidRate` for a zero rate.
    /// - Engine errors from the rebind.
    pub fn format_changed(&self, sample_rate: u32) -> Result<()> {
        if sample_rate == 0 {
            return Err(SottoError::InvalidRate(0));
        }
        let mut st = self.shared.lock();
        st.sample_rate = sample_rate;

        match st.binding.as_ref().map(|b| b.sample_rate) {
            Some(bound) if bound == sample_rate => {
                debug!(rate = sample_rate, "rate unchanged; keeping recognizer");
            }
            Some(bound) => {
                info!(from = bound, to = sample_rate, "rate changed; rebuilding recognizer");
                if let Some(text) = self.emitter.force_final(&mut st) {
                    self.emitter.publish(ResultKind::Final, text);
                }
                st.binding = None;
                st.bind_recognizer()?;
            }
            None if st.model.is_some() => {
                info!(rate = sample_rate, "first rate for loaded model; creating recognizer");
                st.bind_recognizer()?;
            }
            None => {
                debug!(rate = sample_rate, "no model yet; rate recorded");
            }
        }
        Ok(())
    }

    /// Discard buffered frames and the current hypothesis; the engine
    /// instance survives with reset state.
    pub fn flush_start(&self) {
        let mut st = self.shared.lock();
        info!(discarded = st.pending.len(), "flush start");
        st.flushing = true;
        st.pending.clear();
        st.last_partial = None;
        st.last_partial_pts = None;
        if let Some(binding) = st.binding.as_mut() {
            binding.instance.reset();
        }
        st.processed_bytes = 0;
    }

    pub fn flush_stop(&self) {
        let mut st = self.shared.lock();
        st.flushing = false;
        debug!("flush stop");
    }

    /// End of stream: cancel any in-flight load and force the final result
    /// out. Silent when nothing was processed since the last final. The
    /// host propagates the end-of-stream event downstream after this
    /// returns.
    pub fn end_of_stream(&self) {
        let mut st = self.shared.lock();
        st.cancel_load();
        if let Some(text) = self.emitter.force_final(&mut st) {
            self.emitter.publish(ResultKind::Final, text);
        }
        info!("end of stream");
    }

    // ── Properties ───────────────────────────────────────────────────────

    /// Point the filter at a different model.
    ///
    /// Setting the same path is a no-op. While active (or activating) the
    /// reload starts immediately, superseding any in-flight load; while
    /// idle the load waits for activation. `None` deactivates a live
    /// filter.
    pub fn set_model_path(&self, path: Option<PathBuf>) {
        let mut st = self.shared.lock();
        if st.model_path == path {
            debug!("model path unchanged; ignoring");
            return;
        }
        info!(path = ?path, "model path changed");
        st.model_path = path.clone();

        match path {
            None => {
                let was_live = st.stage != LifecycleStage::Idle;
                st.reset_idle();
                drop(st);
                if was_live {
                    self.emit_status(FilterStatus::Idle, None);
                }
            }
            Some(path) => {
                st.clear_engine();
                if st.stage == LifecycleStage::Idle {
                    debug!("filter idle; load deferred until activation");
                } else {
                    // Frames queued for the superseded engine are stale.
                    st.pending.clear();
                    self.submit_load_locked(&mut st, path);
                }
            }
        }
    }

    /// Number of alternative hypotheses (clamped to 0–100). Applies to the
    /// live recognizer immediately when one exists.
    pub fn set_alternatives(&self, n: u32) {
        let n = if n > MAX_ALTERNATIVES {
            warn!(requested = n, "alternatives clamped to {MAX_ALTERNATIVES}");
            MAX_ALTERNATIVES
        } else {
            n
        };
        let mut st = self.shared.lock();
        if st.alternatives == n {
            return;
        }
        st.alternatives = n;
        match st.binding.as_mut() {
            Some(binding) => binding.instance.set_alternatives(n),
            None => debug!(n, "no recognizer yet; alternatives recorded"),
        }
    }

    /// Minimum gap between published partials in frame-timestamp
    /// milliseconds; `-1` disables partials.
    pub fn set_partial_interval_ms(&self, ms: i64) {
        let mut st = self.shared.lock();
        if st.partial_interval_ms == ms {
            return;
        }
        st.partial_interval_ms = ms;
    }

    pub fn model_path(&self) -> Option<PathBuf> {
        self.shared.lock().model_path.clone()
    }

    pub fn alternatives(&self) -> u32 {
        self.shared.lock().alternatives
    }

    pub fn partial_interval_ms(&self) -> i64 {
        self.shared.lock().partial_interval_ms
    }

    pub fn stage(&self) -> LifecycleStage {
        self.shared.lock().stage
    }

    /// Force the recognizer to produce final results now and hand them to
    /// the caller directly (no event). Resets the processed-byte
    /// accounting.
    pub fn take_final(&self) -> Option<String> {
        let mut st = self.shared.lock();
        self.emitter.force_final(&mut st)
    }

    // ── Observability ────────────────────────────────────────────────────

    /// Subscribe to partial/final transcription events.
    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcript_tx.subscribe()
    }

    /// Subscribe to lifecycle status events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn emit_status(&self, status: FilterStatus, detail: Option<String>) {
        let _ = self.status_tx.send(StatusEvent { status, detail });
    }

    /// Start a load for `path`, superseding any in-flight one. No-op when
    /// the installed engine already came from `path`.
    fn submit_load_locked(&self, st: &mut FilterState, path: PathBuf) {
        if st.model.as_ref().is_some_and(|m| m.path == path) {
            debug!(path = %path.display(), "requested model already installed; ignoring");
            return;
        }
        st.cancel_load();
        let token = CancelToken::new();
        st.load = Some(token.clone());
        st.buffering = true;
        self.diagnostics.loads_started.fetch_add(1, Ordering::Relaxed);
        self.loader.submit(LoadRequest { path, token });
    }

    /// Feed up to [`DRAIN_BATCH_FRAMES`] backlog frames, oldest first. The
    /// remainder waits for the next delivery so a deep backlog cannot pin
    /// the lock.
    fn drain_backlog_locked(&self, st: &mut FilterState) {
        for _ in 0..DRAIN_BATCH_FRAMES {
            let Some(frame) = st.pending.pop() else {
                return;
            };
            self.process_frame_locked(st, &frame);
        }
        if !st.pending.is_empty() {
            debug!(remaining = st.pending.len(), "drain cap reached; backlog resumes next frame");
        }
    }

    /// Feed one frame to the recognizer and apply the catch-up/throttle
    /// policy before querying for results.
    fn process_frame_locked(&self, st: &mut FilterState, frame: &AudioFrame) {
        if frame.is_empty() {
            return;
        }
        let Some(binding) = st.binding.as_mut() else {
            return;
        };

        let outcome = binding.instance.accept(frame.data());
        st.processed_bytes += frame.len() as u64;
        self.diagnostics.frames_fed.fetch_add(1, Ordering::Relaxed);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.diagnostics.feed_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "engine rejected waveform chunk; recognition skipped");
                return;
            }
        };

        // S16LE mono.
        let bytes_per_second = u64::from(binding.sample_rate) * 2;
        let frame_len = frame.len() as u64;
        let now = self.clock.running_time();
        let lag = now.checked_sub(frame.pts).unwrap_or(Duration::ZERO);

        if lag > CATCH_UP_LAG {
            // Behind the pipeline: query once per second of consumed audio
            // instead of on every lagging frame.
            if st.processed_bytes % bytes_per_second >= frame_len {
                debug!(?lag, "catching up; result check deferred");
                return;
            }
            info!(?lag, "late but consumed a full second; checking result");
        } else if st.processed_bytes < bytes_per_second / 10 {
            debug!("under 100ms processed since last result; not querying");
            return;
        }

        match outcome {
            FeedOutcome::FinalReady => {
                let text = binding.instance.result();
                self.emitter.emit_final(st, text);
            }
            FeedOutcome::PartialReady => self.emitter.try_emit_partial(st, frame.pts),
            FeedOutcome::NoResult => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    use crossbeam_channel::{unbounded, Receiver};
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::filter::clock::ManualClock;
    use crate::recognizer::{Recognizer, SpeechModel};

    /// Marker first byte that makes the test recognizer finalise.
    const FINAL_MARKER: u8 = 0xEE;

    #[derive(Default)]
    struct BackendProbe {
        constructs: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        fed: parking_lot::Mutex<Vec<(PathBuf, Vec<u8>)>>,
        alternatives_seen: parking_lot::Mutex<Vec<u32>>,
    }

    struct TestBackend {
        probe: Arc<BackendProbe>,
        /// Construction blocks on one recv per load when set.
        gate: Option<Receiver<()>>,
        fail_paths: Vec<PathBuf>,
    }

    impl TestBackend {
        fn new(probe: Arc<BackendProbe>) -> Self {
            Self {
                probe,
                gate: None,
                fail_paths: Vec::new(),
            }
        }

        fn gated(probe: Arc<BackendProbe>, gate: Receiver<()>) -> Self {
            Self {
                probe,
                gate: Some(gate),
                fail_paths: Vec::new(),
            }
        }

        fn failing(probe: Arc<BackendProbe>, fail: &Path) -> Self {
            Self {
                probe,
                gate: None,
                fail_paths: vec![fail.to_path_buf()],
            }
        }
    }

    impl SpeechBackend for TestBackend {
        fn load_model(&self, path: &Path) -> Result<Arc<dyn SpeechModel>> {
            let running = self.probe.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_concurrent.fetch_max(running, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }

            self.probe.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.probe.constructs.fetch_add(1, Ordering::SeqCst);

            if self.fail_paths.iter().any(|p| p == path) {
                return Err(SottoError::ModelLoad {
                    path: path.to_path_buf(),
                    reason: "scripted failure".into(),
                });
            }
            Ok(Arc::new(TestModel {
                path: path.to_path_buf(),
                probe: Arc::clone(&self.probe),
            }))
        }
    }

    struct TestModel {
        path: PathBuf,
        probe: Arc<BackendProbe>,
    }

    impl SpeechModel for TestModel {
        fn bind(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>> {
            Ok(Box::new(TestRecognizer {
                path: self.path.clone(),
                sample_rate,
                probe: Arc::clone(&self.probe),
                utterance_bytes: 0,
            }))
        }
    }

    struct TestRecognizer {
        path: PathBuf,
        sample_rate: u32,
        probe: Arc<BackendProbe>,
        utterance_bytes: u64,
    }

    impl Recognizer for TestRecognizer {
        fn accept(&mut self, bytes: &[u8]) -> Result<FeedOutcome> {
            self.probe
                .fed
                .lock()
                .push((self.path.clone(), bytes.to_vec()));
            self.utterance_bytes += bytes.len() as u64;
            if bytes.first() == Some(&FINAL_MARKER) {
                Ok(FeedOutcome::FinalReady)
            } else if bytes.iter().all(|b| *b == 0) {
                Ok(FeedOutcome::NoResult)
            } else {
                Ok(FeedOutcome::PartialReady)
            }
        }

        fn partial(&mut self) -> String {
            format!(r#"{{"partial" : "{} bytes"}}"#, self.utterance_bytes)
        }

        fn result(&mut self) -> String {
            self.close()
        }

        fn final_result(&mut self) -> String {
            self.close()
        }

        fn set_alternatives(&mut self, n: u32) {
            self.probe.alternatives_seen.lock().push(n);
        }

        fn reset(&mut self) {
            self.utterance_bytes = 0;
        }
    }

    impl TestRecognizer {
        fn close(&mut self) -> String {
            if self.utterance_bytes == 0 {
                return String::new();
            }
            let text = format!(
                r#"{{"text" : "{} bytes @ {} Hz"}}"#,
                self.utterance_bytes, self.sample_rate
            );
            self.utterance_bytes = 0;
            text
        }
    }

    fn frame(tag: u8, index: u64, bytes: usize) -> AudioFrame {
        AudioFrame::new(
            vec![tag; bytes],
            Duration::from_millis(index * 20),
            Duration::from_millis(20),
        )
    }

    fn wait_for_status(
        rx: &mut broadcast::Receiver<StatusEvent>,
        wanted: FilterStatus,
        timeout: Duration,
    ) -> StatusEvent {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(ev) if ev.status == wanted => return ev,
                Ok(_) => continue,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for status {wanted:?}");
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("status channel closed unexpectedly"),
            }
        }
    }

    fn drain_transcripts(rx: &mut broadcast::Receiver<TranscriptEvent>) -> Vec<TranscriptEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn active_filter(
        probe: Arc<BackendProbe>,
        config: FilterConfig,
        clock: ManualClock,
    ) -> (SottoFilter, Receiver<AudioFrame>) {
        let (down_tx, down_rx) = unbounded();
        let filter = SottoFilter::with_clock(
            config,
            Arc::new(TestBackend::new(probe)),
            down_tx,
            Arc::new(clock),
        );
        let mut status_rx = filter.subscribe_status();
        assert_eq!(filter.activate().expect("activate"), Activation::Pending);
        wait_for_status(&mut status_rx, FilterStatus::Active, Duration::from_secs(2));
        filter.format_changed(16_000).expect("format");
        (filter, down_rx)
    }

    #[test]
    fn frames_buffer_until_engine_ready_then_drain_in_order() {
        let probe = Arc::new(BackendProbe::default());
        let (gate_tx, gate_rx) = unbounded();
        let (down_tx, down_rx) = unbounded();
        let clock = ManualClock::new();
        let filter = SottoFilter::with_clock(
            FilterConfig {
                model_path: Some(PathBuf::from("/models/a")),
                ..FilterConfig::default()
            },
            Arc::new(TestBackend::gated(Arc::clone(&probe), gate_rx)),
            down_tx,
            Arc::new(clock.clone()),
        );
        let mut status_rx = filter.subscribe_status();
        filter.format_changed(16_000).expect("format");

        assert_eq!(filter.activate().expect("activate"), Activation::Pending);
        wait_for_status(
            &mut status_rx,
            FilterStatus::Activating,
            Duration::from_secs(2),
        );

        // Engine not ready: frames buffer for recognition but still pass
        // through immediately.
        for i in 0..3u64 {
            filter.push_frame(frame(i as u8 + 1, i, 640));
        }
        assert_eq!(down_rx.len(), 3);
        assert!(probe.fed.lock().is_empty());

        gate_tx.send(()).expect("release load");
        wait_for_status(&mut status_rx, FilterStatus::Active, Duration::from_secs(2));

        // The next delivery drains the backlog ahead of itself.
        clock.set(Duration::from_millis(80));
        filter.push_frame(frame(9, 3, 640));

        let fed = probe.fed.lock();
        let tags: Vec<u8> = fed.iter().map(|(_, bytes)| bytes[0]).collect();
        assert_eq!(tags, vec![1, 2, 3, 9]);
        drop(fed);

        assert_eq!(down_rx.len(), 4);
        drop(gate_tx);
        filter.shutdown();
    }

    #[test]
    fn partial_interval_throttles_by_presentation_time() {
        let probe = Arc::new(BackendProbe::default());
        let clock = ManualClock::new();
        let (filter, _down_rx) = active_filter(
            Arc::clone(&probe),
            FilterConfig {
                model_path: Some(PathBuf::from("/models/a")),
                partial_interval_ms: 100,
                ..FilterConfig::default()
            },
            clock.clone(),
        );
        let mut transcript_rx = filter.subscribe_transcripts();

        // 20 ms frames, 640 bytes each at 16 kHz; keep the clock on top of
        // the stream so the catch-up path stays cold.
        for i in 0..25u64 {
            clock.set(Duration::from_millis(i * 20 + 10));
            filter.push_frame(frame(7, i, 640));
        }

        let events = drain_transcripts(&mut transcript_rx);
        assert!(!events.is_empty(), "expected some partials");
        let partials: Vec<&TranscriptEvent> = events
            .iter()
            .filter(|e| e.kind == ResultKind::Partial)
            .collect();
        assert_eq!(events.len(), partials.len());
        // 25 frames over 500 ms with a 100 ms floor: at most 5 partials.
        assert!(partials.len() <= 5, "got {} partials", partials.len());
        filter.shutdown();
    }

    #[test]
    fn negative_partial_interval_disables_partials() {
        let probe = Arc::new(BackendProbe::default());
        let clock = ManualClock::new();
        let (filter, _down_rx) = active_filter(
            Arc::clone(&probe),
            FilterConfig {
                model_path: Some(PathBuf::from("/models/a")),
                partial_interval_ms: -1,
                ..FilterConfig::default()
            },
            clock.clone(),
        );
        let mut transcript_rx = filter.subscribe_transcripts();

        for i in 0..25u64 {
            clock.set(Duration::from_millis(i * 20 + 10));
            filter.push_frame(frame(7, i, 640));
        }

        assert!(drain_transcripts(&mut transcript_rx).is_empty());
        filter.shutdown();
    }

    #[test]
    fn lagging_stream_queries_once_per_consumed_second() {
        let probe = Arc::new(BackendProbe::default());
        let clock = ManualClock::new();
        // Pipeline clock far ahead of every frame timestamp.
        clock.set(Duration::from_secs(30));
        let (filter, _down_rx) = active_filter(
            Arc::clone(&probe),
            FilterConfig {
                model_path: Some(PathBuf::from("/models/a")),
                ..FilterConfig::default()
            },
            clock.clone(),
        );
        let mut transcript_rx = filter.subscribe_transcripts();

        // 100 frames × 640 bytes = 2 s of audio; exactly two wraps of the
        // 32 000-byte-per-second counter.
        for i in 0..100u64 {
            filter.push_frame(frame(7, i, 640));
        }

        let events = drain_transcripts(&mut transcript_rx);
        assert_eq!(events.len(), 2, "one query per consumed second");
        assert!(events.iter().all(|e| e.kind == ResultKind::Partial));
        filter.shutdown();
    }

    #[test]
    fn final_outcome_emits_final_and_resets_accounting() {
        let probe = Arc::new(BackendProbe::default());
        let clock = ManualClock::new();
        let (filter, _down_rx) = active_filter(
            Arc::clone(&probe),
            FilterConfig {
                model_path: Some(PathBuf::from("/models/a")),
                ..FilterConfig::default()
            },
            clock.clone(),
        );
        let mut transcript_rx = filter.subscribe_transcripts();

        for i in 0..10u64 {
            clock.set(Duration::from_millis(i * 20 + 10));
            filter.push_frame(frame(7, i, 640));
        }
        clock.set(Duration::from_millis(210));
        filter.push_frame(frame(FINAL_MARKER, 10, 640));

        let events = drain_transcripts(&mut transcript_rx);
        let last = events.last().expect("some events");
        assert_eq!(last.kind, ResultKind::Final);
        assert!(last.text.contains("7040 bytes"), "got {}", last.text);

        // Nothing processed since the final: end-of-stream stays silent.
        filter.end_of_stream();
        assert!(drain_transcripts(&mut transcript_rx).is_empty());
        filter.shutdown();
    }

    #[test]
    fn rate_change_rebinds_and_flushes_pending_final() {
        let probe = Arc::new(BackendProbe::default());
        let clock = ManualClock::new();
        let (filter, _down_rx) = active_filter(
            Arc::clone(&probe),
            FilterConfig {
                model_path: Some(PathBuf::from("/models/a")),
                ..FilterConfig::default()
            },
            clock.clone(),
        );
        let mut transcript_rx = filter.subscribe_transcripts();

        for i in 0..10u64 {
            clock.set(Duration::from_millis(i * 20 + 10));
            filter.push_frame(frame(7, i, 640));
        }
        let _ = drain_transcripts(&mut transcript_rx);

        filter.format_changed(8_000).expect("rate change");

        let events = drain_transcripts(&mut transcript_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ResultKind::Final);
        assert!(events[0].text.contains("16000 Hz"), "got {}", events[0].text);

        // Construction happened once; only the bind was redone.
        assert_eq!(probe.constructs.load(Ordering::SeqCst), 1);
        filter.shutdown();
    }

    #[test]
    fn flush_start_discards_hypothesis_and_counter() {
        let probe = Arc::new(BackendProbe::default());
        let clock = ManualClock::new();
        let (filter, _down_rx) = active_filter(
            Arc::clone(&probe),
            FilterConfig {
                model_path: Some(PathBuf::from("/models/a")),
                ..FilterConfig::default()
            },
            clock.clone(),
        );
        let mut transcript_rx = filter.subscribe_transcripts();

        for i in 0..10u64 {
            clock.set(Duration::from_millis(i * 20 + 10));
            filter.push_frame(frame(7, i, 640));
        }
        let _ = drain_transcripts(&mut transcript_rx);

        filter.flush_start();
        filter.flush_stop();

        // No final fires for the discarded segment.
        filter.end_of_stream();
        assert!(drain_transcripts(&mut transcript_rx).is_empty());
        filter.shutdown();
    }

    #[test]
    fn alternatives_apply_to_live_recognizer() {
        let probe = Arc::new(BackendProbe::default());
        let clock = ManualClock::new();
        let (filter, _down_rx) = active_filter(
            Arc::clone(&probe),
            FilterConfig {
                model_path: Some(PathBuf::from("/models/a")),
                ..FilterConfig::default()
            },
            clock.clone(),
        );

        filter.set_alternatives(3);
        filter.set_alternatives(3); // no-op
        filter.set_alternatives(500); // clamped

        let seen = probe.alternatives_seen.lock().clone();
        // First entry comes from the bind itself.
        assert_eq!(seen, vec![0, 3, MAX_ALTERNATIVES]);
        filter.shutdown();
    }

    #[test]
    fn superseded_load_never_installs() {
        let probe = Arc::new(BackendProbe::default());
        let (gate_tx, gate_rx) = unbounded();
        let (down_tx, _down_rx) = unbounded();
        let filter = SottoFilter::with_clock(
            FilterConfig {
                model_path: Some(PathBuf::from("/models/first")),
                ..FilterConfig::default()
            },
            Arc::new(TestBackend::gated(Arc::clone(&probe), gate_rx)),
            down_tx,
            Arc::new(ManualClock::new()),
        );
        let mut status_rx = filter.subscribe_status();
        filter.format_changed(16_000).expect("format");

        assert_eq!(filter.activate().expect("activate"), Activation::Pending);

        // Wait until the first construction is actually in flight (blocked
        // on the gate), then supersede it.
        let start = Instant::now();
        while probe.concurrent.load(Ordering::SeqCst) == 0 {
            assert!(
                start.elapsed() < Duration::from_secs(2),
                "first load never started"
            );
            thread::sleep(Duration::from_millis(1));
        }
        filter.set_model_path(Some(PathBuf::from("/models/second")));

        gate_tx.send(()).expect("release first load");
        gate_tx.send(()).expect("release second load");
        wait_for_status(&mut status_rx, FilterStatus::Active, Duration::from_secs(2));

        assert_eq!(probe.constructs.load(Ordering::SeqCst), 2);
        assert_eq!(probe.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(
            filter.model_path(),
            Some(PathBuf::from("/models/second"))
        );

        // The installed recognizer answers for the second model only.
        filter.push_frame(frame(7, 0, 640));
        let fed = probe.fed.lock();
        assert!(fed
            .iter()
            .all(|(path, _)| path == Path::new("/models/second")));
        drop(fed);

        let snap = filter.diagnostics_snapshot();
        assert_eq!(snap.loads_started, 2);
        assert_eq!(snap.loads_cancelled, 1);
        assert_eq!(snap.loads_installed, 1);

        drop(gate_tx);
        filter.shutdown();
    }

    #[test]
    fn failed_load_reports_error_and_reverts_to_idle() {
        let probe = Arc::new(BackendProbe::default());
        let (down_tx, _down_rx) = unbounded();
        let bad = PathBuf::from("/models/broken");
        let filter = SottoFilter::with_clock(
            FilterConfig {
                model_path: Some(bad.clone()),
                ..FilterConfig::default()
            },
            Arc::new(TestBackend::failing(Arc::clone(&probe), &bad)),
            down_tx,
            Arc::new(ManualClock::new()),
        );
        let mut status_rx = filter.subscribe_status();

        assert_eq!(filter.activate().expect("activate"), Activation::Pending);
        let err = wait_for_status(&mut status_rx, FilterStatus::Error, Duration::from_secs(2));
        assert!(
            err.detail.as_deref().unwrap_or("").contains("/models/broken"),
            "diagnostic should name the path"
        );
        wait_for_status(&mut status_rx, FilterStatus::Idle, Duration::from_secs(2));
        assert_eq!(filter.stage(), LifecycleStage::Idle);
        filter.shutdown();
    }

    #[test]
    fn setting_identical_path_is_a_noop() {
        let probe = Arc::new(BackendProbe::default());
        let clock = ManualClock::new();
        let (filter, _down_rx) = active_filter(
            Arc::clone(&probe),
            FilterConfig {
                model_path: Some(PathBuf::from("/models/a")),
                ..FilterConfig::default()
            },
            clock,
        );

        filter.set_model_path(Some(PathBuf::from("/models/a")));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(probe.constructs.load(Ordering::SeqCst), 1);
        assert_eq!(filter.diagnostics_snapshot().loads_started, 1);
        filter.shutdown();
    }
}
