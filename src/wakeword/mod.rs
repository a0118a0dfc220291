//! Streaming wake-word detection.
//!
//! Three models run in sequence on every 80 ms chunk:
//!
//! ```text
//! Raw audio (1280 samples) → mel frontend → 8 mel frames (32 bins each)
//! Last 76 mel frames       → embedding    → one 96-dim vector
//! Last 16 embeddings       → classifier   → score in [0, 1]
//! ```
//!
//! The classifier needs 1.28 s of temporal context (16 × 80 ms), and the
//! embedding model needs 76 mel frames (~1.5 s) before it can produce the
//! first vector, so embeddings must accumulate over time from streaming
//! audio. A single sliding window over mel frames alone cannot express
//! this; the detector keeps two rolling buffers and reports which warm-up
//! phase it is in until both have filled.
//!
//! Warm-up arithmetic: 8 mel frames per chunk fills the 76-frame window on
//! chunk 10; one embedding per chunk thereafter fills the 16-embedding
//! window on chunk 25. After `reset()` the same warm-up repeats, which is
//! exactly why the startup sequencer never resets the detector after the
//! welcome cue.

pub mod onnx;

use crate::ring_buffer::RingBuffer;
use crate::AudioFrame;
use std::time::{Duration, Instant};
use strum::Display;
use thiserror::Error;
use tokio::sync::watch;

/// Mel bins per frame.
pub const MEL_BINS: usize = 32;
/// Mel frames produced per 80 ms chunk.
pub const MEL_FRAMES_PER_CHUNK: usize = 8;
/// Mel frames required before the embedding model can run.
pub const MEL_WINDOW: usize = 76;
/// Mel ring capacity (~1.2 s).
pub const MEL_BUFFER_CAPACITY: usize = 120;
/// Embedding vector length.
pub const EMBEDDING_DIM: usize = 96;
/// Embeddings required before the classifier can run.
pub const EMBEDDING_WINDOW: usize = 16;
/// Embedding ring capacity.
pub const EMBEDDING_BUFFER_CAPACITY: usize = 32;

pub type MelFrame = [f32; MEL_BINS];
pub type Embedding = [f32; EMBEDDING_DIM];

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model load error: {0}")]
    Load(String),
    #[error("Inference error: {0}")]
    Inference(String),
    #[error("Unexpected tensor shape: {0}")]
    Shape(String),
}

/// Stage 1: raw chunk → mel frames.
pub trait MelFrontend: Send {
    fn mel_frames(&mut self, samples: &[f32]) -> Result<Vec<MelFrame>, ModelError>;
}

/// Stage 2: 76-frame mel window → one embedding.
pub trait EmbeddingBackend: Send {
    fn embed(&mut self, window: &[&MelFrame]) -> Result<Embedding, ModelError>;
}

/// Stage 3: 16-embedding window → confidence score.
pub trait WakeClassifier: Send {
    fn score(&mut self, window: &[&Embedding]) -> Result<f32, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DetectionPhase {
    /// Still filling the mel window; no embeddings yet.
    WarmupMel,
    /// Mel window full; still filling the embedding window.
    WarmupEmbedding,
    /// Both windows full; scores are live.
    Armed,
}

/// Produced at most once per 80 ms chunk.
#[derive(Debug, Clone, Copy)]
pub struct DetectionResult {
    pub ready: bool,
    pub phase: DetectionPhase,
    pub score: f32,
    pub detected: bool,
    pub t: Instant,
}

impl DetectionResult {
    fn warming(phase: DetectionPhase) -> Self {
        Self {
            ready: false,
            phase,
            score: 0.0,
            detected: false,
            t: Instant::now(),
        }
    }
}

pub struct WakewordDetector {
    mel: Box<dyn MelFrontend>,
    embedder: Box<dyn EmbeddingBackend>,
    classifier: Box<dyn WakeClassifier>,
    mel_buffer: RingBuffer<MelFrame>,
    embedding_buffer: RingBuffer<Embedding>,
    threshold: f32,
    debounce: Duration,
    last_detection: Option<Instant>,
    last_sequence: Option<u64>,
    warmup_tx: watch::Sender<bool>,
}

impl WakewordDetector {
    pub fn new(
        mel: Box<dyn MelFrontend>,
        embedder: Box<dyn EmbeddingBackend>,
        classifier: Box<dyn WakeClassifier>,
        threshold: f32,
        debounce: Duration,
    ) -> Self {
        let (warmup_tx, _) = watch::channel(false);
        Self {
            mel,
            embedder,
            classifier,
            mel_buffer: RingBuffer::new(MEL_BUFFER_CAPACITY),
            embedding_buffer: RingBuffer::new(EMBEDDING_BUFFER_CAPACITY),
            threshold,
            debounce,
            last_detection: None,
            last_sequence: None,
            warmup_tx,
        }
    }

    /// Awaitable warm-up signal; becomes true on the first armed chunk.
    pub fn warmup_watch(&self) -> watch::Receiver<bool> {
        self.warmup_tx.subscribe()
    }

    pub fn warmup_complete(&self) -> bool {
        *self.warmup_tx.borrow()
    }

    /// Run the per-chunk pipeline.
    ///
    /// Muted frames keep the rolling buffers warm (the samples are zeros)
    /// but can never report a detection. A sequence gap invalidates the
    /// accumulated temporal context and restarts warm-up.
    pub fn process_frame(&mut self, frame: &AudioFrame) -> Result<DetectionResult, ModelError> {
        if let Some(last) = self.last_sequence {
            if frame.sequence_no != last.wrapping_add(1) {
                log::warn!(
                    "Frame gap ({} → {}), resetting detection context",
                    last,
                    frame.sequence_no
                );
                self.reset();
            }
        }
        self.last_sequence = Some(frame.sequence_no);

        // Models take the raw 16-bit amplitude range as f32.
        let samples: Vec<f32> = frame.samples.iter().map(|&s| s as f32).collect();

        let new_frames = self.mel.mel_frames(&samples)?;
        for mel_frame in new_frames {
            self.mel_buffer.push(mel_frame);
        }

        let mel_window = match self.mel_buffer.view_last(MEL_WINDOW) {
            Some(window) => window,
            None => {
                log::debug!(
                    "Warm-up (mel): {}/{} frames",
                    self.mel_buffer.len(),
                    MEL_WINDOW
                );
                return Ok(DetectionResult::warming(DetectionPhase::WarmupMel));
            }
        };

        let embedding = self.embedder.embed(&mel_window)?;
        self.embedding_buffer.push(embedding);

        let embedding_window = match self.embedding_buffer.view_last(EMBEDDING_WINDOW) {
            Some(window) => window,
            None => {
                log::debug!(
                    "Warm-up (embedding): {}/{} vectors",
                    self.embedding_buffer.len(),
                    EMBEDDING_WINDOW
                );
                return Ok(DetectionResult::warming(DetectionPhase::WarmupEmbedding));
            }
        };

        let score = self.classifier.score(&embedding_window)?;
        let t = Instant::now();

        if !self.warmup_complete() {
            let _ = self.warmup_tx.send(true);
            log::info!("👂 Wake-word detector armed");
        }

        // Strictly greater: a score exactly at the threshold does not fire.
        let mut detected = score > self.threshold && !frame.muted;

        if detected {
            if let Some(last) = self.last_detection {
                if t.duration_since(last) < self.debounce {
                    log::debug!("Detection debounced (score {:.3})", score);
                    detected = false;
                }
            }
        }
        if detected {
            self.last_detection = Some(t);
            log::info!("🎤 Wake word detected (score {:.3})", score);
        }

        Ok(DetectionResult {
            ready: true,
            phase: DetectionPhase::Armed,
            score,
            detected,
            t,
        })
    }

    /// Clear both rolling buffers and restart warm-up.
    ///
    /// Never call this between the welcome cue and the first wake: it
    /// re-opens the warm-up gap the startup sequencer exists to close.
    pub fn reset(&mut self) {
        self.mel_buffer.clear();
        self.embedding_buffer.clear();
        self.last_detection = None;
        let _ = self.warmup_tx.send(false);
        log::info!("🔄 Detector reset, warm-up restarting");
    }
}
