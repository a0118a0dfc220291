//! Orchestrator event types and session identity.

use crate::audio::{AudioClip, PlaybackOutcome};
use crate::router::{AiResponse, RouterError};
use crate::stt::{Transcript, TranscriptionError};
use crate::tts::TtsError;
use crate::AudioFrame;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque per-wake identifier correlating every downstream event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "s{:x}-{:04x}",
            chrono::Utc::now().timestamp_millis(),
            n & 0xffff
        ))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inbound control requests from the event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Reset,
    SetMute(bool),
    DumpState,
}

/// Everything that can drive a state transition. All transitions happen in
/// the orchestrator task and nowhere else.
#[derive(Debug)]
pub enum OrchestratorEvent {
    /// Startup sequencer finished (welcome played, detector warm).
    StartupComplete,
    /// Armed detector crossed the threshold on an unmuted frame.
    WakeDetected { score: f32 },
    /// A frame arrived while the capture gate is open.
    FrameCaptured(AudioFrame),
    TranscriptReady {
        session: SessionId,
        outcome: Result<Transcript, TranscriptionError>,
    },
    ResponseReady {
        session: SessionId,
        outcome: Result<AiResponse, RouterError>,
    },
    SynthesisReady {
        session: SessionId,
        outcome: Result<AudioClip, TtsError>,
    },
    PlaybackFinished { outcome: PlaybackOutcome },
    /// Capture device is gone; the audio task is attempting recovery.
    DeviceFault { detail: String },
    /// Capture device reopened successfully.
    RecoveryOk,
    Control(ControlCommand),
    Shutdown,
}
