//! The audio pipeline task: capture → wake-word detector → orchestrator.
//!
//! Single consumer of [`AudioFrame`]s; runs the three model inferences
//! per frame and never suspends on remote I/O. Frames are forwarded to the
//! orchestrator only while the capture gate is open (wake confirmed →
//! utterance end). On device loss the task reports the fault, then owns
//! the reopen-with-backoff loop and reports recovery.

use crate::audio::{AudioCapture, CaptureEvent, MuteHandle};
use crate::health::HealthState;
use crate::orchestrator::events::OrchestratorEvent;
use crate::wakeword::WakewordDetector;
use crate::FRAME_MS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Cross-task request flag asking the pipeline to reset the detector.
/// Unidirectional: the orchestrator raises it, the pipeline consumes it.
#[derive(Clone, Default)]
pub struct DetectorReset(Arc<AtomicBool>);

impl DetectorReset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

pub struct AudioPipeline {
    capture: AudioCapture,
    device: Option<String>,
    mute: MuteHandle,
    detector: WakewordDetector,
    events: mpsc::Sender<OrchestratorEvent>,
    capture_gate: watch::Receiver<bool>,
    reset: DetectorReset,
    health: Arc<HealthState>,
    slow_frames: u64,
    warmed: bool,
}

impl AudioPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capture: AudioCapture,
        device: Option<String>,
        mute: MuteHandle,
        detector: WakewordDetector,
        events: mpsc::Sender<OrchestratorEvent>,
        capture_gate: watch::Receiver<bool>,
        reset: DetectorReset,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            capture,
            device,
            mute,
            detector,
            events,
            capture_gate,
            reset,
            health,
            slow_frames: 0,
            warmed: false,
        }
    }

    pub async fn run(mut self) {
        log::info!("Audio pipeline running");
        loop {
            if self.reset.take() {
                self.detector.reset();
                self.warmed = false;
                self.health.set_warmup_complete(false);
            }

            match self.capture.recv().await {
                CaptureEvent::Frame(frame) => self.process(frame).await,
                CaptureEvent::Fault(detail) => {
                    if !self.recover(detail).await {
                        break;
                    }
                }
                CaptureEvent::Closed => {
                    if !self.recover("capture channel closed".to_string()).await {
                        break;
                    }
                }
            }
        }
        log::info!("Audio pipeline stopped");
    }

    async fn process(&mut self, frame: crate::AudioFrame) {
        let started = std::time::Instant::now();
        match self.detector.process_frame(&frame) {
            Ok(result) => {
                if result.ready && !self.warmed {
                    self.warmed = true;
                    self.health.set_warmup_complete(true);
                }
                if result.detected {
                    let _ = self
                        .events
                        .send(OrchestratorEvent::WakeDetected {
                            score: result.score,
                        })
                        .await;
                }
            }
            Err(e) => log::error!("Detection failed on frame {}: {}", frame.sequence_no, e),
        }

        // Inference over the frame budget starves the queue; count it
        // rather than drop anything ourselves.
        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(FRAME_MS) {
            self.slow_frames += 1;
            log::warn!(
                "Frame {} took {:?} (> {} ms budget, {} total)",
                frame.sequence_no,
                elapsed,
                FRAME_MS,
                self.slow_frames
            );
        }

        if *self.capture_gate.borrow() {
            let _ = self
                .events
                .send(OrchestratorEvent::FrameCaptured(frame))
                .await;
        }
    }

    /// Report the fault, then try to reopen the device with capped
    /// exponential backoff. Returns false only when the orchestrator is
    /// gone and there is nobody left to recover for.
    async fn recover(&mut self, detail: String) -> bool {
        log::error!("Capture fault: {}", detail);
        if self
            .events
            .send(OrchestratorEvent::DeviceFault { detail })
            .await
            .is_err()
        {
            return false;
        }

        // The context in the rolling buffers predates the fault.
        self.detector.reset();
        self.warmed = false;
        self.health.set_warmup_complete(false);

        let mut backoff = Duration::from_secs(1);
        loop {
            tokio::time::sleep(backoff).await;
            match AudioCapture::open(self.device.as_deref(), self.mute.clone()) {
                Ok(capture) => {
                    log::info!("Capture device reopened");
                    self.capture = capture;
                    return self
                        .events
                        .send(OrchestratorEvent::RecoveryOk)
                        .await
                        .is_ok();
                }
                Err(e) => {
                    log::warn!("Reopen failed ({}), retrying in {:?}", e, backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }
}
