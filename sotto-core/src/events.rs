//! Host-facing event types published over the broadcast channels.
//!
//! | Event | Channel accessor |
//! |-------|------------------|
//! | `TranscriptEvent` | `SottoFilter::subscribe_transcripts` |
//! | `StatusEvent` | `SottoFilter::subscribe_status` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Transcript events
// ---------------------------------------------------------------------------

/// Published when the recognizer produces text for consumed audio.
///
/// `text` carries the engine's raw structured payload unchanged (vosk-style
/// backends emit JSON); the filter never parses or reformats it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Whether the hypothesis is still unstable or committed.
    pub kind: ResultKind,
    /// Raw engine payload.
    pub text: String,
}

/// Distinguishes unstable hypotheses from committed utterance results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Subject to change as more audio for the same utterance arrives.
    Partial,
    /// Stable text for a completed utterance segment.
    Final,
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Published when the filter's lifecycle stage changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: FilterStatus,
    /// Optional human-readable detail (e.g. a load failure diagnostic).
    pub detail: Option<String>,
}

/// Coarse lifecycle stage of the filter, independent of the audio format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterStatus {
    /// Constructed or deactivated; no engine, no load in flight.
    Idle,
    /// A model load is in flight; frames are buffering.
    Activating,
    /// An engine is installed (or installing after a live reload) and frames
    /// flow through recognition.
    Active,
    /// A model failed to load; the filter reverted to idle.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_event_serializes_with_lowercase_kind() {
        let event = TranscriptEvent {
            seq: 3,
            kind: ResultKind::Partial,
            text: r#"{"partial" : "hello wor"}"#.into(),
        };

        let json = serde_json::to_value(&event).expect("serialize transcript event");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["kind"], "partial");
        assert_eq!(json["text"], r#"{"partial" : "hello wor"}"#);

        let round_trip: TranscriptEvent =
            serde_json::from_value(json).expect("deserialize transcript event");
        assert_eq!(round_trip.kind, ResultKind::Partial);
        assert_eq!(round_trip.seq, 3);
    }

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = StatusEvent {
            status: FilterStatus::Activating,
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "activating");
        assert_eq!(json["detail"], serde_json::Value::Null);

        let round_trip: StatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, FilterStatus::Activating);
    }

    #[test]
    fn result_kind_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<ResultKind>(r#""Final""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }
}
