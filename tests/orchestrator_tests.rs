//! Orchestrator state machine and session lifecycle, driven end to end
//! with mock workers, a recording bus, and a fake playback sink.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use voice_gateway_rs::audio::{
    AudioClip, MuteHandle, PlaybackCommand, PlaybackHandle, PlaybackOutcome,
};
use voice_gateway_rs::bus::{BusHandle, DeviceStateCache, OutboundMessage};
use voice_gateway_rs::config::{ToolsConfig, VadSettings};
use voice_gateway_rs::health::HealthState;
use voice_gateway_rs::orchestrator::events::OrchestratorEvent;
use voice_gateway_rs::orchestrator::pipeline::DetectorReset;
use voice_gateway_rs::orchestrator::{Orchestrator, Workers, FALLBACK_DIDNT_CATCH};
use voice_gateway_rs::router::context::ConversationWindow;
use voice_gateway_rs::router::provider::{AiProvider, ChatMessage, ProviderError, ProviderReply};
use voice_gateway_rs::router::AiRouter;
use voice_gateway_rs::stt::{Transcriber, Transcript, TranscriptionError};
use voice_gateway_rs::tools::ToolExecutor;
use voice_gateway_rs::tts::{SpeechSynthesizer, TtsError};
use voice_gateway_rs::{AudioFrame, FRAME_SAMPLES};

// ── Mocks ────────────────────────────────────────────────────────────────

struct MockTranscriber {
    outcome: Mutex<Option<Result<Transcript, TranscriptionError>>>,
    calls: Arc<AtomicUsize>,
    received_samples: Arc<AtomicUsize>,
}

impl MockTranscriber {
    fn returning(outcome: Result<Transcript, TranscriptionError>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Some(outcome)),
            calls: Arc::new(AtomicUsize::new(0)),
            received_samples: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, audio: Vec<i16>) -> Result<Transcript, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received_samples.store(audio.len(), Ordering::SeqCst);
        self.outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Ok(Transcript::silent(0)))
    }
}

struct MockTts {
    fail: bool,
    spoken: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SpeechSynthesizer for MockTts {
    async fn synthesize(&self, text: &str) -> Result<AudioClip, TtsError> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(TtsError::Request("synthesis unavailable".into()));
        }
        Ok(AudioClip {
            samples: vec![0; 160],
            sample_rate: 16_000,
        })
    }
}

/// Provider that refuses every call; bypass-only tests assert it is never
/// reached.
struct UnreachableProvider {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl AiProvider for UnreachableProvider {
    fn name(&self) -> &str {
        "unreachable"
    }
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _tools: &[Value],
    ) -> Result<ProviderReply, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Network("should not be called".into()))
    }
}

/// Fake speaker: acknowledges every clip as completed.
fn fake_playback(plays: Arc<AtomicUsize>) -> PlaybackHandle {
    let (tx, rx) = std_mpsc::channel();
    std::thread::spawn(move || {
        while let Ok(command) = rx.recv() {
            if let PlaybackCommand::Play { done, .. } = command {
                plays.fetch_add(1, Ordering::SeqCst);
                let _ = done.send(PlaybackOutcome::Completed);
            }
        }
    });
    PlaybackHandle::new(tx)
}

// ── Fixture ──────────────────────────────────────────────────────────────

struct Fixture {
    events_tx: mpsc::Sender<OrchestratorEvent>,
    bus_rx: mpsc::Receiver<OutboundMessage>,
    capture_gate: watch::Receiver<bool>,
    provider_calls: Arc<AtomicUsize>,
    stt_calls: Arc<AtomicUsize>,
    stt_samples: Arc<AtomicUsize>,
    spoken: Arc<Mutex<Vec<String>>>,
    plays: Arc<AtomicUsize>,
    _devices: DeviceStateCache,
}

fn fixture(
    stt_outcome: Result<Transcript, TranscriptionError>,
    tts_fails: bool,
    vad: VadSettings,
) -> Fixture {
    let (events_tx, events_rx) = Orchestrator::channel();
    let (bus_tx, bus_rx) = mpsc::channel(256);
    let bus = BusHandle::new(bus_tx, "voice".into(), "devices".into());

    let devices = DeviceStateCache::new();
    let executor = Arc::new(ToolExecutor::new(
        ToolsConfig::default(),
        devices.clone(),
        bus.clone(),
        None,
    ));
    let provider_calls = Arc::new(AtomicUsize::new(0));
    let router = AiRouter::new(
        Box::new(UnreachableProvider {
            calls: provider_calls.clone(),
        }),
        executor,
        ConversationWindow::new(20, Duration::from_secs(300)),
        4,
    );

    let transcriber = MockTranscriber::returning(stt_outcome);
    let stt_calls = transcriber.calls.clone();
    let stt_samples = transcriber.received_samples.clone();

    let spoken = Arc::new(Mutex::new(Vec::new()));
    let synthesizer = Arc::new(MockTts {
        fail: tts_fails,
        spoken: spoken.clone(),
    });

    let plays = Arc::new(AtomicUsize::new(0));
    let playback = fake_playback(plays.clone());

    let (gate_tx, gate_rx) = watch::channel(false);
    let workers = Workers {
        transcriber,
        router: Arc::new(tokio::sync::Mutex::new(router)),
        synthesizer,
    };
    let mut orchestrator = Orchestrator::new(
        events_rx,
        events_tx.clone(),
        workers,
        playback,
        bus,
        MuteHandle::new(),
        gate_tx,
        DetectorReset::new(),
        HealthState::new(),
        &vad,
    );
    tokio::spawn(async move { orchestrator.run().await });

    Fixture {
        events_tx,
        bus_rx,
        capture_gate: gate_rx,
        provider_calls,
        stt_calls,
        stt_samples,
        spoken,
        plays,
        _devices: devices,
    }
}

fn quick_vad() -> VadSettings {
    VadSettings {
        threshold: 0.015,
        trailing_silence_ms: 160, // two silent frames end the utterance
        max_utterance_ms: 10_000,
    }
}

fn loud_frame(sequence_no: u64) -> AudioFrame {
    AudioFrame {
        samples: (0..FRAME_SAMPLES)
            .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
            .collect(),
        t0: Instant::now(),
        sequence_no,
        muted: false,
    }
}

fn silent_frame(sequence_no: u64) -> AudioFrame {
    AudioFrame {
        samples: vec![0; FRAME_SAMPLES],
        t0: Instant::now(),
        sequence_no,
        muted: false,
    }
}

#[derive(Debug)]
struct BusRecord {
    topic: String,
    payload: Value,
}

impl BusRecord {
    fn kind(&self) -> String {
        if self.topic == "voice/events" {
            if let Some(event) = self.payload.get("event").and_then(|e| e.as_str()) {
                return format!("events:{event}");
            }
            if let Some(reason) = self.payload.get("reason").and_then(|r| r.as_str()) {
                return format!("transition:{reason}");
            }
        }
        if self.topic == "voice/status" {
            return format!("status:{}", self.payload["status"].as_str().unwrap_or("?"));
        }
        self.topic.clone()
    }
}

/// Collect bus traffic until `session_ended` (or the timeout trips).
async fn drain_until_session_end(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<BusRecord> {
    let mut records = Vec::new();
    let deadline = Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout(deadline, rx.recv())
            .await
            .expect("timed out waiting for session_ended")
            .expect("bus channel closed");
        let record = BusRecord {
            topic: message.topic,
            payload: serde_json::from_slice(&message.payload).unwrap_or(Value::Null),
        };
        let done = record.kind() == "events:session_ended";
        records.push(record);
        if done {
            return records;
        }
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ── Scenarios ────────────────────────────────────────────────────────────

/// Happy path: wake → "what time is it" → datetime bypass → spoken reply.
/// Verifies session-event ordering, status sequencing, and that the AI
/// provider is never consulted for a literal pattern match.
#[tokio::test]
async fn datetime_session_end_to_end() {
    let mut fx = fixture(
        Ok(Transcript {
            text: "what time is it".into(),
            is_silent: false,
            duration_ms: 240,
        }),
        false,
        quick_vad(),
    );

    fx.events_tx.send(OrchestratorEvent::StartupComplete).await.unwrap();
    fx.events_tx
        .send(OrchestratorEvent::WakeDetected { score: 0.62 })
        .await
        .unwrap();
    for frame in [loud_frame(0), silent_frame(1), silent_frame(2)] {
        fx.events_tx
            .send(OrchestratorEvent::FrameCaptured(frame))
            .await
            .unwrap();
    }

    let records = drain_until_session_end(&mut fx.bus_rx).await;
    let kinds: Vec<String> = records.iter().map(|r| r.kind()).collect();

    // Status ordering: ready strictly before listening, capturing after.
    let statuses: Vec<&String> = kinds.iter().filter(|k| k.starts_with("status:")).collect();
    assert_eq!(statuses[0], "status:ready");
    assert_eq!(statuses[1], "status:listening");

    // Exactly one session, bracketed correctly.
    let started = kinds.iter().position(|k| k == "events:session_started").unwrap();
    let ended = kinds.iter().position(|k| k == "events:session_ended").unwrap();
    assert_eq!(
        kinds.iter().filter(|k| *k == "events:session_started").count(),
        1
    );
    let req = kinds.iter().position(|k| k == "voice/req").unwrap();
    let res = kinds.iter().position(|k| k == "voice/res").unwrap();
    assert!(started < req && req < res && res < ended);

    // Same session id on every session-scoped record.
    let started_id = records[started].payload["session_id"].as_str().unwrap().to_string();
    for index in [req, res, ended] {
        assert_eq!(records[index].payload["session_id"], started_id.as_str());
    }

    assert_eq!(records[req].payload["text"], "what time is it");
    let res_text = records[res].payload["text"].as_str().unwrap();
    assert!(res_text.starts_with("It's "), "got: {res_text}");

    // Bypass means zero provider calls; the reply was spoken and played.
    assert_eq!(fx.provider_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.plays.load(Ordering::SeqCst), 1);
    assert_eq!(fx.spoken.lock().unwrap().len(), 1);

    // Transition reasons observed along the way.
    for reason in [
        "transition:wake_detected",
        "transition:first_frame_captured",
        "transition:vad_utterance_end",
        "transition:transcript_ok",
        "transition:ai_response_ok",
        "transition:playback_complete",
    ] {
        assert!(kinds.iter().any(|k| k == reason), "missing {reason}");
    }

    // Gate is closed again after the session.
    assert!(!*fx.capture_gate.borrow());
}

/// A wake event outside Listening never starts a session.
#[tokio::test]
async fn wake_ignored_outside_listening() {
    let mut fx = fixture(Ok(Transcript::silent(0)), false, quick_vad());

    // Still Initializing: no startup_complete yet.
    fx.events_tx
        .send(OrchestratorEvent::WakeDetected { score: 0.9 })
        .await
        .unwrap();
    settle().await;

    assert!(
        fx.bus_rx.try_recv().is_err(),
        "no session_started (or anything else) may be published"
    );
}

/// A second wake mid-session (the user repeating the wake word) is
/// ignored; exactly one session exists.
#[tokio::test]
async fn mid_session_wake_ignored() {
    let mut fx = fixture(
        Ok(Transcript {
            text: "what time is it".into(),
            is_silent: false,
            duration_ms: 240,
        }),
        false,
        quick_vad(),
    );

    fx.events_tx.send(OrchestratorEvent::StartupComplete).await.unwrap();
    fx.events_tx
        .send(OrchestratorEvent::WakeDetected { score: 0.5 })
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(loud_frame(0)))
        .await
        .unwrap();
    // User says the wake word again mid-utterance.
    fx.events_tx
        .send(OrchestratorEvent::WakeDetected { score: 0.8 })
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(silent_frame(1)))
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(silent_frame(2)))
        .await
        .unwrap();

    let records = drain_until_session_end(&mut fx.bus_rx).await;
    let starts = records
        .iter()
        .filter(|r| r.kind() == "events:session_started")
        .count();
    assert_eq!(starts, 1);
}

/// S4: an utterance with no speech ends the session without STT, AI, or
/// TTS involvement.
#[tokio::test]
async fn silent_capture_skips_everything() {
    let mut fx = fixture(Ok(Transcript::silent(0)), false, quick_vad());

    fx.events_tx.send(OrchestratorEvent::StartupComplete).await.unwrap();
    fx.events_tx
        .send(OrchestratorEvent::WakeDetected { score: 0.4 })
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(silent_frame(0)))
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(silent_frame(1)))
        .await
        .unwrap();

    let records = drain_until_session_end(&mut fx.bus_rx).await;
    let kinds: Vec<String> = records.iter().map(|r| r.kind()).collect();

    assert!(kinds.iter().any(|k| k == "transition:transcript_silent"));
    assert!(!kinds.iter().any(|k| k == "voice/req"));
    assert!(!kinds.iter().any(|k| k == "voice/res"));
    assert_eq!(fx.stt_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.provider_calls.load(Ordering::SeqCst), 0);
    assert!(fx.spoken.lock().unwrap().is_empty());
    assert_eq!(fx.plays.load(Ordering::SeqCst), 0);
}

/// S5: a transcription timeout produces the "didn't catch that" cue and a
/// cleanly closed session.
#[tokio::test]
async fn transcription_timeout_speaks_fallback() {
    let mut fx = fixture(
        Err(TranscriptionError::Timeout(Duration::from_secs(10))),
        false,
        quick_vad(),
    );

    fx.events_tx.send(OrchestratorEvent::StartupComplete).await.unwrap();
    fx.events_tx
        .send(OrchestratorEvent::WakeDetected { score: 0.3 })
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(loud_frame(0)))
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(silent_frame(1)))
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(silent_frame(2)))
        .await
        .unwrap();

    let records = drain_until_session_end(&mut fx.bus_rx).await;
    let kinds: Vec<String> = records.iter().map(|r| r.kind()).collect();

    assert!(kinds.iter().any(|k| k == "transition:transcription_failed"));
    assert!(!kinds.iter().any(|k| k == "voice/req"));
    let spoken = fx.spoken.lock().unwrap();
    assert_eq!(spoken.len(), 1);
    assert_eq!(spoken[0], FALLBACK_DIDNT_CATCH);
}

/// TTS failure degrades to text-only: the response is still published on
/// the bus, nothing is played, and the session closes.
#[tokio::test]
async fn tts_failure_is_text_only() {
    let mut fx = fixture(
        Ok(Transcript {
            text: "what time is it".into(),
            is_silent: false,
            duration_ms: 240,
        }),
        true, // synthesis fails
        quick_vad(),
    );

    fx.events_tx.send(OrchestratorEvent::StartupComplete).await.unwrap();
    fx.events_tx
        .send(OrchestratorEvent::WakeDetected { score: 0.3 })
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(loud_frame(0)))
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(silent_frame(1)))
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::FrameCaptured(silent_frame(2)))
        .await
        .unwrap();

    let records = drain_until_session_end(&mut fx.bus_rx).await;
    let kinds: Vec<String> = records.iter().map(|r| r.kind()).collect();

    assert!(kinds.iter().any(|k| k == "voice/res"), "response still published");
    assert!(kinds.iter().any(|k| k == "transition:tts_failed"));
    assert_eq!(fx.plays.load(Ordering::SeqCst), 0);
}

/// The hard utterance cap ends capture on time (± one frame) even under
/// continuous speech.
#[tokio::test]
async fn max_utterance_caps_capture() {
    let vad = VadSettings {
        threshold: 0.015,
        trailing_silence_ms: 10_000,
        max_utterance_ms: 400, // five frames
    };
    let mut fx = fixture(
        Ok(Transcript {
            text: "a very long ramble".into(),
            is_silent: false,
            duration_ms: 400,
        }),
        false,
        vad,
    );

    fx.events_tx.send(OrchestratorEvent::StartupComplete).await.unwrap();
    fx.events_tx
        .send(OrchestratorEvent::WakeDetected { score: 0.3 })
        .await
        .unwrap();
    for i in 0..10u64 {
        fx.events_tx
            .send(OrchestratorEvent::FrameCaptured(loud_frame(i)))
            .await
            .unwrap();
    }

    let records = drain_until_session_end(&mut fx.bus_rx).await;
    let kinds: Vec<String> = records.iter().map(|r| r.kind()).collect();
    assert!(kinds.iter().any(|k| k == "transition:max_utterance_reached"));

    // Exactly the five frames inside the cap were captured.
    assert_eq!(
        fx.stt_samples.load(Ordering::SeqCst),
        5 * FRAME_SAMPLES
    );
}

/// Device fault mid-session: the session closes, the gateway degrades,
/// and recovery returns it to Listening.
#[tokio::test]
async fn device_fault_degrades_and_recovers() {
    let mut fx = fixture(Ok(Transcript::silent(0)), false, quick_vad());

    fx.events_tx.send(OrchestratorEvent::StartupComplete).await.unwrap();
    fx.events_tx
        .send(OrchestratorEvent::WakeDetected { score: 0.3 })
        .await
        .unwrap();
    fx.events_tx
        .send(OrchestratorEvent::DeviceFault {
            detail: "microphone unplugged".into(),
        })
        .await
        .unwrap();

    let records = drain_until_session_end(&mut fx.bus_rx).await;
    let kinds: Vec<String> = records.iter().map(|r| r.kind()).collect();
    assert!(kinds.iter().any(|k| k == "status:degraded"));
    assert!(kinds.iter().any(|k| k == "transition:fatal_device_error"));

    fx.events_tx.send(OrchestratorEvent::RecoveryOk).await.unwrap();
    settle().await;
    let mut saw_listening = false;
    while let Ok(message) = fx.bus_rx.try_recv() {
        let payload: Value = serde_json::from_slice(&message.payload).unwrap_or(Value::Null);
        if message.topic == "voice/status" && payload["status"] == "listening" {
            saw_listening = true;
        }
    }
    assert!(saw_listening, "recovery returns to listening");
}
