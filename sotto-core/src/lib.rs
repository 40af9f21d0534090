//! # sotto-core
//!
//! Streaming pass-through speech-recognition filter.
//!
//! ## Architecture
//!
//! ```text
//! host frames ──► SottoFilter ──► downstream (unchanged, always)
//!                    │  ▲
//!            FrameBuffer │ install/discard (under the one state mutex)
//!                    │  │
//!              Recognizer ◄── ModelLoader worker ◄── SpeechBackend
//!                    │
//!          broadcast::Sender<TranscriptEvent / StatusEvent>
//! ```
//!
//! Frames always flow downstream, ready engine or not. Model construction is
//! unbounded in duration and therefore runs on the loader's worker thread,
//! never under the state lock and never on the host's data thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod error;
pub mod events;
pub mod filter;
pub mod frame;
pub mod recognizer;

// Convenience re-exports for downstream crates
pub use error::SottoError;
pub use events::{FilterStatus, ResultKind, StatusEvent, TranscriptEvent};
pub use filter::{Activation, FilterConfig, LifecycleStage, SottoFilter, DEFAULT_MODEL_PATH};
pub use frame::AudioFrame;
pub use recognizer::{FeedOutcome, Recognizer, SpeechBackend, SpeechModel};
