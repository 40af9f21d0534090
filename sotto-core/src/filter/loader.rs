//! Background model loader.
//!
//! Exactly one worker thread constructs models, so no two engine handles
//! are ever built in parallel. Requests carry a cancellation token; a newer
//! submission cancels the older token, and a cancelled request that still
//! finishes construction discards its result under the state lock — never
//! before taking it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::events::{FilterStatus, StatusEvent};
use crate::filter::state::{FilterState, LifecycleStage, LoadedModel};
use crate::filter::FilterDiagnostics;
use crate::recognizer::SpeechBackend;

/// Shared cancellation flag checked at defined points by the worker.
#[derive(Clone, Debug, Default)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One load of one path. Consumed exactly once by the worker.
pub(crate) struct LoadRequest {
    pub path: PathBuf,
    pub token: CancelToken,
}

enum LoaderMsg {
    Load(LoadRequest),
    Shutdown,
}

/// Owner of the worker thread. Dropping it (or calling [`shutdown`]) waits
/// for the worker to finish its current request and exit.
///
/// [`shutdown`]: ModelLoader::shutdown
pub(crate) struct ModelLoader {
    tx: Sender<LoaderMsg>,
    worker: Option<JoinHandle<()>>,
}

impl ModelLoader {
    pub fn spawn(
        backend: Arc<dyn SpeechBackend>,
        shared: Arc<Mutex<FilterState>>,
        status_tx: broadcast::Sender<StatusEvent>,
        diagnostics: Arc<FilterDiagnostics>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let worker = thread::spawn(move || worker_loop(rx, backend, shared, status_tx, diagnostics));
        Self {
            tx,
            worker: Some(worker),
        }
    }

    /// Queue a load. The caller has already installed `request.token` as the
    /// state's active token and cancelled the previous one.
    pub fn submit(&self, request: LoadRequest) {
        if self.tx.send(LoaderMsg::Load(request)).is_err() {
            error!("model loader worker is gone; load request dropped");
        }
    }

    /// Stop the worker and wait for it to acknowledge. Cancel the active
    /// token (and release the state lock) before calling this.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(LoaderMsg::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("model loader worker panicked");
            }
        }
    }
}

impl Drop for ModelLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    rx: Receiver<LoaderMsg>,
    backend: Arc<dyn SpeechBackend>,
    shared: Arc<Mutex<FilterState>>,
    status_tx: broadcast::Sender<StatusEvent>,
    diagnostics: Arc<FilterDiagnostics>,
) {
    while let Ok(msg) = rx.recv() {
        match msg {
            LoaderMsg::Shutdown => break,
            LoaderMsg::Load(request) => {
                run_load(request, &*backend, &shared, &status_tx, &diagnostics)
            }
        }
    }
    debug!("model loader worker exiting");
}

fn run_load(
    request: LoadRequest,
    backend: &dyn SpeechBackend,
    shared: &Mutex<FilterState>,
    status_tx: &broadcast::Sender<StatusEvent>,
    diagnostics: &FilterDiagnostics,
) {
    // The request may have waited in the queue; a superseded one exits
    // before touching the engine.
    if request.token.is_cancelled() {
        debug!(path = %request.path.display(), "queued load already superseded");
        diagnostics.loads_cancelled.fetch_add(1, Ordering::Relaxed);
        return;
    }

    info!(path = %request.path.display(), "constructing speech model");

    // Unbounded-duration construction happens without the state lock.
    let built = backend.load_model(&request.path);

    match built {
        Ok(model) => {
            let mut became_active = false;
            {
                let mut st = shared.lock();

                // Checked under the lock: a cancellation that raced with the
                // end of construction still discards the result.
                if request.token.is_cancelled() {
                    info!(path = %request.path.display(), "model construction superseded; discarding");
                    diagnostics.loads_cancelled.fetch_add(1, Ordering::Relaxed);
                    return;
                }

                st.load = None;
                st.buffering = false;
                st.model = Some(LoadedModel {
                    path: request.path.clone(),
                    model,
                });

                if st.sample_rate > 0 {
                    if let Err(e) = st.bind_recognizer() {
                        error!(path = %request.path.display(), error = %e, "recognizer bind failed after load");
                        revert_and_report(
                            st,
                            status_tx,
                            diagnostics,
                            &request,
                            format!("recognizer bind failed: {e}"),
                        );
                        return;
                    }
                    info!(
                        path = %request.path.display(),
                        rate = st.sample_rate,
                        backlog = st.pending.len(),
                        "model installed; recognizer ready"
                    );
                } else {
                    info!(path = %request.path.display(), "model installed; rate not negotiated yet");
                }

                if st.stage == LifecycleStage::Activating {
                    st.stage = LifecycleStage::Active;
                    became_active = true;
                }
            }

            diagnostics.loads_installed.fetch_add(1, Ordering::Relaxed);
            if became_active {
                let _ = status_tx.send(StatusEvent {
                    status: FilterStatus::Active,
                    detail: None,
                });
            }
        }
        Err(e) => {
            let st = shared.lock();
            // A failure must never stall a newer, still-relevant request:
            // superseded failures stay silent.
            if request.token.is_cancelled() {
                info!(path = %request.path.display(), "superseded load failed; newer request proceeds");
                diagnostics.loads_cancelled.fetch_add(1, Ordering::Relaxed);
                return;
            }
            revert_and_report(st, status_tx, diagnostics, &request, e.to_string());
        }
    }
}

/// A failed (and not superseded) load is fatal: revert to idle under the
/// caller's lock, then report a resource error to the host.
fn revert_and_report(
    mut st: MutexGuard<'_, FilterState>,
    status_tx: &broadcast::Sender<StatusEvent>,
    diagnostics: &FilterDiagnostics,
    request: &LoadRequest,
    reason: String,
) {
    st.reset_idle();
    drop(st);

    diagnostics.loads_failed.fetch_add(1, Ordering::Relaxed);
    warn!(path = %request.path.display(), reason = %reason, "model load failed; reverting to idle");

    let _ = status_tx.send(StatusEvent {
        status: FilterStatus::Error,
        detail: Some(format!(
            "failed to load speech model at {}: {reason}",
            request.path.display()
        )),
    });
    let _ = status_tx.send(StatusEvent {
        status: FilterStatus::Idle,
        detail: None,
    });
}
