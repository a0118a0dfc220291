//! The voice orchestrator: a single-threaded state machine over a bounded
//! event queue.
//!
//! ```text
//! Initializing → Listening → WakeConfirmed → Capturing → Transcribing
//!      ↑             ↑                                        │
//!      │             └──── Speaking ←──── Thinking ←──────────┘
//!      └─ (startup)        (playback)     (AI router)
//! ```
//!
//! Every transition happens in [`Orchestrator::handle_event`] and nowhere
//! else. Workers (STT, router, TTS) run in their own tasks and post results
//! back onto the queue tagged with the session they belong to; results for
//! a session that has already ended are dropped on arrival. Wake events in
//! any state but `Listening` are ignored, which also covers mid-utterance
//! repeats of the wake phrase and anything the detector produced from
//! muted frames.

pub mod events;
pub mod pipeline;
pub mod startup;

use crate::audio::{AudioClip, MuteHandle, PlaybackHandle, PlaybackOutcome};
use crate::bus::BusHandle;
use crate::config::VadSettings;
use crate::health::HealthState;
use crate::router::{AiRouter, RouterError};
use crate::stt::Transcriber;
use crate::tts::SpeechSynthesizer;
use crate::vad::{EnergyVad, VadVerdict};
use crate::{AudioFrame, SAMPLE_RATE};
use events::{ControlCommand, OrchestratorEvent, SessionId};
use pipeline::DetectorReset;
use std::sync::Arc;
use strum::Display;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Spoken fallbacks; short, typed, and the only user-visible error surface.
pub const FALLBACK_DIDNT_CATCH: &str = "Sorry, I didn't catch that.";
pub const FALLBACK_AI_FAILED: &str = "Something went wrong, please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum VoiceState {
    Initializing,
    Listening,
    WakeConfirmed,
    Capturing,
    Transcribing,
    Thinking,
    Speaking,
    Degraded,
}

impl VoiceState {
    /// Value for the retained status topic.
    fn status(&self) -> &'static str {
        match self {
            VoiceState::Initializing => "initializing",
            VoiceState::Listening => "listening",
            VoiceState::WakeConfirmed | VoiceState::Capturing => "capturing",
            VoiceState::Transcribing | VoiceState::Thinking => "thinking",
            VoiceState::Speaking => "speaking",
            VoiceState::Degraded => "degraded",
        }
    }
}

/// Worker handles the orchestrator dispatches to. All trait objects so the
/// state machine is testable without audio hardware or network services.
pub struct Workers {
    pub transcriber: Arc<dyn Transcriber>,
    pub router: Arc<tokio::sync::Mutex<AiRouter>>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

struct ActiveSession {
    id: SessionId,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    state: VoiceState,
    session: Option<ActiveSession>,
    events_rx: mpsc::Receiver<OrchestratorEvent>,
    events_tx: mpsc::Sender<OrchestratorEvent>,
    workers: Workers,
    playback: PlaybackHandle,
    bus: BusHandle,
    mute: MuteHandle,
    capture_gate: watch::Sender<bool>,
    detector_reset: DetectorReset,
    health: Arc<HealthState>,
    vad: EnergyVad,
    utterance: Vec<i16>,
    max_utterance_samples: usize,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events_rx: mpsc::Receiver<OrchestratorEvent>,
        events_tx: mpsc::Sender<OrchestratorEvent>,
        workers: Workers,
        playback: PlaybackHandle,
        bus: BusHandle,
        mute: MuteHandle,
        capture_gate: watch::Sender<bool>,
        detector_reset: DetectorReset,
        health: Arc<HealthState>,
        vad_settings: &VadSettings,
    ) -> Self {
        let max_utterance_samples =
            (vad_settings.max_utterance_ms as usize) * (SAMPLE_RATE as usize) / 1_000;
        Self {
            state: VoiceState::Initializing,
            session: None,
            events_rx,
            events_tx,
            workers,
            playback,
            bus,
            mute,
            capture_gate,
            detector_reset,
            health,
            vad: EnergyVad::new(vad_settings),
            utterance: Vec::new(),
            max_utterance_samples,
        }
    }

    /// Bounded event queue shared by every producer.
    pub fn channel() -> (
        mpsc::Sender<OrchestratorEvent>,
        mpsc::Receiver<OrchestratorEvent>,
    ) {
        mpsc::channel(256)
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id.clone())
    }

    /// Drive the state machine until shutdown.
    pub async fn run(&mut self) {
        log::info!("Orchestrator running");
        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, OrchestratorEvent::Shutdown) {
                log::info!("Orchestrator shutting down");
                break;
            }
            self.handle_event(event).await;
        }
    }

    /// Apply one event. Public so the state machine can be tested by
    /// feeding events directly.
    pub async fn handle_event(&mut self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::StartupComplete => self.on_startup_complete(),
            OrchestratorEvent::WakeDetected { score } => self.on_wake(score),
            OrchestratorEvent::FrameCaptured(frame) => self.on_frame(frame),
            OrchestratorEvent::TranscriptReady { session, outcome } => {
                self.on_transcript(session, outcome)
            }
            OrchestratorEvent::ResponseReady { session, outcome } => {
                self.on_response(session, outcome)
            }
            OrchestratorEvent::SynthesisReady { session, outcome } => {
                self.on_synthesis(session, outcome)
            }
            OrchestratorEvent::PlaybackFinished { outcome } => self.on_playback_finished(outcome),
            OrchestratorEvent::DeviceFault { detail } => self.on_device_fault(detail),
            OrchestratorEvent::RecoveryOk => self.on_recovery(),
            OrchestratorEvent::Control(command) => self.on_control(command),
            OrchestratorEvent::Shutdown => {}
        }
    }

    /// Record a transition: state, health, retained status, and the
    /// granular `voice/events` record, in that order, every time.
    fn transition(&mut self, to: VoiceState, reason: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        log::info!("State {} → {} ({})", from, to, reason);
        self.state = to;
        self.health.set_state(to.status());
        let session = self.session.as_ref().map(|s| s.id.clone());
        self.bus
            .publish_status(to.status(), session.as_ref());
        self.bus
            .publish_transition(&from.to_string(), &to.to_string(), reason, session.as_ref());
    }

    fn on_startup_complete(&mut self) {
        if self.state != VoiceState::Initializing {
            log::warn!("Spurious startup_complete in {}", self.state);
            return;
        }
        // `ready` sits between `initializing` and `listening` on the
        // retained status topic; observers see all three in order.
        self.health.set_state("ready");
        self.bus.publish_status("ready", None);
        self.transition(VoiceState::Listening, "startup_complete");
    }

    fn on_wake(&mut self, score: f32) {
        if self.state != VoiceState::Listening {
            log::info!(
                "Wake event ignored in {} (score {:.3})",
                self.state,
                score
            );
            return;
        }

        let session = ActiveSession {
            id: SessionId::generate(),
            cancel: CancellationToken::new(),
        };
        log::info!("Session {} started (score {:.3})", session.id, score);
        self.bus.publish_session_event("session_started", &session.id);
        self.session = Some(session);

        self.vad.reset();
        self.utterance.clear();
        let _ = self.capture_gate.send(true);
        self.transition(VoiceState::WakeConfirmed, "wake_detected");
    }

    fn on_frame(&mut self, frame: AudioFrame) {
        match self.state {
            VoiceState::WakeConfirmed => {
                self.transition(VoiceState::Capturing, "first_frame_captured");
                self.consume_frame(frame);
            }
            VoiceState::Capturing => self.consume_frame(frame),
            // Late frames race the gate closing; drop them.
            _ => {}
        }
    }

    fn consume_frame(&mut self, frame: AudioFrame) {
        if self.utterance.len() < self.max_utterance_samples {
            self.utterance.extend_from_slice(&frame.samples);
        }

        match self.vad.push_frame(&frame.samples) {
            VadVerdict::Frame(_) => {}
            VadVerdict::End(end) => {
                let _ = self.capture_gate.send(false);
                let reason = match end.reason {
                    crate::vad::EndReason::TrailingSilence => "vad_utterance_end",
                    crate::vad::EndReason::MaxUtterance => "max_utterance_reached",
                };
                self.transition(VoiceState::Transcribing, reason);

                if end.is_silent {
                    // Nothing was said; skip STT, AI, and TTS entirely.
                    log::info!("Capture was silent, returning to listening");
                    self.utterance.clear();
                    self.end_session("transcript_silent");
                    return;
                }

                let audio = std::mem::take(&mut self.utterance);
                self.spawn_transcription(audio);
            }
        }
    }

    fn on_transcript(
        &mut self,
        session: SessionId,
        outcome: Result<crate::stt::Transcript, crate::stt::TranscriptionError>,
    ) {
        if !self.session_matches(&session) || self.state != VoiceState::Transcribing {
            log::debug!("Dropping stale transcript for {}", session);
            return;
        }

        match outcome {
            Ok(transcript) if transcript.is_silent => {
                log::info!("Transcript silent ({} ms)", transcript.duration_ms);
                self.end_session("transcript_silent");
            }
            Ok(transcript) => {
                log::info!("Transcript: '{}'", transcript.text);
                self.bus.publish_request(&session, &transcript.text);
                self.transition(VoiceState::Thinking, "transcript_ok");
                self.spawn_routing(transcript.text);
            }
            Err(e) => {
                log::warn!("Transcription failed: {}", e);
                self.health.record_error(e.to_string());
                self.transition(VoiceState::Speaking, "transcription_failed");
                self.spawn_synthesis(FALLBACK_DIDNT_CATCH.to_string());
            }
        }
    }

    fn on_response(&mut self, session: SessionId, outcome: Result<crate::router::AiResponse, RouterError>) {
        if !self.session_matches(&session) || self.state != VoiceState::Thinking {
            log::debug!("Dropping stale response for {}", session);
            return;
        }

        match outcome {
            Ok(response) => {
                log::info!(
                    "Response via {} in {} ms ({} tool calls)",
                    response.provider,
                    response.latency_ms,
                    response.tool_calls.len()
                );
                // Published even if synthesis fails later.
                self.bus.publish_response(&session, &response.text);
                self.transition(VoiceState::Speaking, "ai_response_ok");
                self.spawn_synthesis(response.text);
            }
            Err(RouterError::Cancelled) => {
                log::debug!("Routing cancelled for {}", session);
            }
            Err(e) => {
                log::warn!("AI routing failed: {}", e);
                self.health.record_error(e.to_string());
                self.transition(VoiceState::Speaking, "ai_failed");
                self.spawn_synthesis(FALLBACK_AI_FAILED.to_string());
            }
        }
    }

    fn on_synthesis(
        &mut self,
        session: SessionId,
        outcome: Result<AudioClip, crate::tts::TtsError>,
    ) {
        if !self.session_matches(&session) || self.state != VoiceState::Speaking {
            log::debug!("Dropping stale synthesis for {}", session);
            return;
        }

        match outcome {
            Ok(clip) => {
                // Beep isolation: the assistant must not hear itself. The
                // detector keeps running on the muted (zeroed) frames so
                // its context stays warm; its output is ignored.
                self.mute.set(true);
                let done = self.playback.play(clip);
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let outcome = done.await.unwrap_or_else(|_| {
                        PlaybackOutcome::Error("playback channel closed".into())
                    });
                    let _ = events
                        .send(OrchestratorEvent::PlaybackFinished { outcome })
                        .await;
                });
            }
            Err(e) => {
                // Text-only fallback: the response is already on the bus.
                log::warn!("Synthesis failed, skipping audio: {}", e);
                self.health.record_error(e.to_string());
                self.end_session("tts_failed");
            }
        }
    }

    fn on_playback_finished(&mut self, outcome: PlaybackOutcome) {
        if self.state != VoiceState::Speaking {
            log::debug!("Playback finished outside Speaking ({})", outcome);
            return;
        }
        self.mute.set(false);
        match &outcome {
            PlaybackOutcome::Completed => {}
            PlaybackOutcome::Interrupted => log::info!("Playback interrupted"),
            PlaybackOutcome::Error(e) => {
                log::warn!("Playback error: {}", e);
                self.health.record_error(e.clone());
            }
        }
        // Returning to Listening does NOT reset the detector: its buffers
        // rolled over muted frames and are still warm.
        self.end_session("playback_complete");
    }

    fn on_device_fault(&mut self, detail: String) {
        log::error!("Device fault: {}", detail);
        self.health.record_error(detail);
        self.mute.set(false);
        self.transition(VoiceState::Degraded, "fatal_device_error");
        // Entering Degraded closes any session, same id bracketing as the
        // normal return to Listening.
        self.cancel_session();
    }

    fn on_recovery(&mut self) {
        if self.state != VoiceState::Degraded {
            log::debug!("Recovery signal in {}", self.state);
            return;
        }
        self.transition(VoiceState::Listening, "recovery_ok");
    }

    fn on_control(&mut self, command: ControlCommand) {
        log::info!("Control command: {:?}", command);
        match command {
            ControlCommand::Reset => {
                self.playback.stop();
                self.mute.set(false);
                let _ = self.capture_gate.send(false);
                self.detector_reset.request();
                if self.session.is_some() {
                    self.cancel_session();
                    self.transition(VoiceState::Listening, "control_reset");
                } else if self.state != VoiceState::Initializing {
                    self.transition(VoiceState::Listening, "control_reset");
                }
            }
            ControlCommand::SetMute(muted) => self.mute.set(muted),
            ControlCommand::DumpState => {
                let session = self.session.as_ref().map(|s| s.id.clone());
                self.bus.publish_transition(
                    &self.state.to_string(),
                    &self.state.to_string(),
                    "state_dump",
                    session.as_ref(),
                );
            }
        }
    }

    fn session_matches(&self, session: &SessionId) -> bool {
        self.session
            .as_ref()
            .map(|s| &s.id == session)
            .unwrap_or(false)
    }

    /// Close the session and return to Listening. Publishes exactly one
    /// `session_ended` carrying the same id as `session_started`.
    fn end_session(&mut self, reason: &str) {
        self.transition(VoiceState::Listening, reason);
        self.cancel_session();
    }

    fn cancel_session(&mut self) {
        let _ = self.capture_gate.send(false);
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            self.bus.publish_session_event("session_ended", &session.id);
            log::info!("Session {} ended", session.id);
        }
    }

    fn spawn_transcription(&self, audio: Vec<i16>) {
        let Some(session) = &self.session else { return };
        let transcriber = self.workers.transcriber.clone();
        let events = self.events_tx.clone();
        let id = session.id.clone();
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = transcriber.transcribe(audio) => result,
                // STT has no side effects; cancelling kills the subprocess.
                _ = cancel.cancelled() => {
                    log::debug!("Transcription cancelled for {}", id);
                    return;
                }
            };
            let _ = events
                .send(OrchestratorEvent::TranscriptReady {
                    session: id,
                    outcome,
                })
                .await;
        });
    }

    fn spawn_routing(&self, text: String) {
        let Some(session) = &self.session else { return };
        let router = self.workers.router.clone();
        let events = self.events_tx.clone();
        let id = session.id.clone();
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            // Not select-cancelled: a dispatched device command must run to
            // completion. The router checks the token between hops, and a
            // late result is dropped by the session check on arrival.
            let outcome = router.lock().await.respond(&text, &cancel).await;
            if matches!(outcome, Err(RouterError::Cancelled)) {
                return;
            }
            let _ = events
                .send(OrchestratorEvent::ResponseReady {
                    session: id,
                    outcome,
                })
                .await;
        });
    }

    fn spawn_synthesis(&self, text: String) {
        let Some(session) = &self.session else { return };
        let synthesizer = self.workers.synthesizer.clone();
        let events = self.events_tx.clone();
        let id = session.id.clone();
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = synthesizer.synthesize(&text) => result,
                _ = cancel.cancelled() => {
                    log::debug!("Synthesis cancelled for {}", id);
                    return;
                }
            };
            let _ = events
                .send(OrchestratorEvent::SynthesisReady {
                    session: id,
                    outcome,
                })
                .await;
        });
    }
}
