//! Startup sequencer.
//!
//! Naive ordering plays the welcome cue before the detector has context,
//! then resets the detector afterwards, leaving a multi-second window
//! that looks ready and isn't. The sequence here is authoritative:
//!
//! 1. Event bus and tool-server connections (both retry internally).
//! 2. ONNX models → detector.
//! 3. Microphone capture, feeding the detector.
//! 4. Await detector warm-up (bounded; proceed with a log on timeout).
//! 5. Welcome cue through TTS + playback, capture muted.
//! 6. Transition to Listening with NO detector reset: the buffers
//!    rolled over muted frames during the welcome and are still valid.
//! 7. Retained status becomes `ready`, then `listening`.

use crate::audio::{AudioCapture, MuteHandle, Playback};
use crate::bus::EventBus;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::health::{self, HealthState};
use crate::orchestrator::events::OrchestratorEvent;
use crate::orchestrator::pipeline::{AudioPipeline, DetectorReset};
use crate::orchestrator::{Orchestrator, Workers};
use crate::router::context::ConversationWindow;
use crate::router::provider::OpenAiChatProvider;
use crate::router::AiRouter;
use crate::stt::WhisperCliTranscriber;
use crate::tools::mcp::McpClient;
use crate::tools::ToolExecutor;
use crate::tts::{HttpTts, SpeechSynthesizer};
use crate::wakeword::onnx::{OnnxEmbeddingBackend, OnnxMelFrontend, OnnxWakeClassifier};
use crate::wakeword::WakewordDetector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Bring the whole gateway up in the required order, then run the
/// orchestrator until a shutdown signal.
pub async fn launch(config: GatewayConfig) -> Result<()> {
    let health = HealthState::new();
    tokio::spawn(health::serve(config.health.bind.clone(), health.clone()));

    // 1a. Event bus. The task owns the connection and retries internally;
    // publishes buffer until the broker answers.
    let (events_tx, events_rx) = Orchestrator::channel();
    let (bus, devices, bus_task) = EventBus::new(config.bus.clone(), events_tx.clone(), health.clone());
    tokio::spawn(bus_task.run());
    bus.publish_status("initializing", None);

    // 1b. External tool server, if configured.
    let mcp = match &config.tools.mcp {
        Some(mcp_config) => Some(Arc::new(McpClient::new(
            mcp_config.clone(),
            Duration::from_secs(config.tools.call_timeout_s),
        ))),
        None => None,
    };

    let executor = Arc::new(ToolExecutor::new(
        config.tools.clone(),
        devices,
        bus.clone(),
        mcp.clone(),
    ));

    if let Some(mcp) = &mcp {
        match mcp.list_tools("tool-server").await {
            Ok(discovered) => executor.merge_external(discovered),
            Err(e) => log::warn!(
                "Tool discovery failed ({e:?}); continuing with built-ins, will retry on next call"
            ),
        }

        // Periodic re-discovery picks up a restarted tool server and any
        // catalog changes it brings along.
        let refresh_mcp = mcp.clone();
        let refresh_executor = executor.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                if let Ok(discovered) = refresh_mcp.list_tools("tool-server").await {
                    refresh_executor.merge_external(discovered);
                }
            }
        });
    }

    // 2. Models. A missing or corrupt model is fatal (exit code 3).
    let detector = WakewordDetector::new(
        Box::new(OnnxMelFrontend::load(&config.wakeword.melspectrogram_model)?),
        Box::new(OnnxEmbeddingBackend::load(&config.wakeword.embedding_model)?),
        Box::new(OnnxWakeClassifier::load(&config.wakeword.wakeword_model)?),
        config.wakeword.threshold,
        Duration::from_millis(config.wakeword.debounce_ms),
    );
    let mut warmup = detector.warmup_watch();

    // 3. Microphone (exit code 4 when absent) and speaker.
    let mute = MuteHandle::new();
    let capture = AudioCapture::open(config.audio.device.as_deref(), mute.clone())
        .map_err(|e| GatewayError::Device(e.to_string()))?;
    let playback = Playback::spawn(config.audio.playback_device.clone());

    // Workers.
    let transcriber = Arc::new(WhisperCliTranscriber::new(config.stt.clone()));
    let provider = Box::new(OpenAiChatProvider::new(
        config.ai.base_url.clone(),
        config.ai.model.clone(),
        config.ai.api_key(),
        Duration::from_secs(config.ai.request_timeout_s),
    ));
    let router = AiRouter::new(
        provider,
        executor.clone(),
        ConversationWindow::new(
            config.ai.window_messages,
            Duration::from_secs(config.ai.window_idle_timeout_s),
        ),
        config.ai.max_tool_hops,
    );
    let synthesizer: Arc<dyn SpeechSynthesizer> = Arc::new(HttpTts::new(config.tts.clone()));
    let workers = Workers {
        transcriber,
        router: Arc::new(tokio::sync::Mutex::new(router)),
        synthesizer: synthesizer.clone(),
    };

    // Wire the pipeline and the orchestrator.
    let (capture_gate_tx, capture_gate_rx) = watch::channel(false);
    let detector_reset = DetectorReset::new();
    let pipeline = AudioPipeline::new(
        capture,
        config.audio.device.clone(),
        mute.clone(),
        detector,
        events_tx.clone(),
        capture_gate_rx,
        detector_reset.clone(),
        health.clone(),
    );
    tokio::spawn(pipeline.run());

    let mut orchestrator = Orchestrator::new(
        events_rx,
        events_tx.clone(),
        workers,
        playback.clone(),
        bus.clone(),
        mute.clone(),
        capture_gate_tx,
        detector_reset,
        health.clone(),
        &config.vad,
    );

    // 4. Warm-up, bounded.
    let warmup_timeout = Duration::from_secs(config.wakeword.warmup_timeout_s);
    let warmed = tokio::time::timeout(warmup_timeout, async {
        while !*warmup.borrow() {
            if warmup.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    match warmed {
        Ok(()) => log::info!("Detector warm-up complete"),
        Err(_) => log::warn!(
            "Detector warm-up did not complete within {:?}; proceeding anyway",
            warmup_timeout
        ),
    }

    // 5. Welcome cue with the capture path muted, so the detector rolls
    // over zeroed frames instead of hearing the assistant.
    mute.set(true);
    match synthesizer.synthesize(config.welcome()).await {
        Ok(clip) => {
            let done = playback.play(clip);
            match done.await {
                Ok(outcome) => log::info!("Welcome playback: {}", outcome),
                Err(_) => log::warn!("Welcome playback channel closed"),
            }
        }
        Err(e) => {
            log::warn!("Welcome synthesis failed ({e}); starting without the cue");
            health.record_error(e.to_string());
        }
    }
    mute.set(false);

    // 6 & 7. Listening. Deliberately no detector.reset() here.
    events_tx
        .send(OrchestratorEvent::StartupComplete)
        .await
        .map_err(|_| GatewayError::Internal("event queue closed during startup".into()))?;

    // Signal handling: first Ctrl-C drains into a clean shutdown.
    let shutdown_tx = events_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Signal received, shutting down");
            let _ = shutdown_tx.send(OrchestratorEvent::Shutdown).await;
        }
    });

    orchestrator.run().await;
    Ok(())
}
