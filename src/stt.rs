//! Transcription of captured utterances.
//!
//! The production transcriber shells out to a local whisper.cpp-style CLI:
//! the captured PCM is written to a scratch WAV, the binary runs under a
//! deadline, and stdout becomes the transcript. Empty or placeholder output
//! maps to a silent transcript rather than an error: silence is a normal
//! outcome the orchestrator routes on, not a failure.

use crate::config::SttConfig;
use crate::SAMPLE_RATE;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum TranscriptionError {
    #[error("Transcription timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transcription model error: {0}")]
    Model(String),
    #[error("Transcriber produced unreadable output: {0}")]
    Empty(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub is_silent: bool,
    pub duration_ms: u32,
}

impl Transcript {
    pub fn silent(duration_ms: u32) -> Self {
        Self {
            text: String::new(),
            is_silent: true,
            duration_ms,
        }
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<i16>) -> Result<Transcript, TranscriptionError>;
}

/// Output strings some whisper builds print for speech-free audio.
const SILENCE_SENTINELS: &[&str] = &["[BLANK_AUDIO]", "(silence)", "[silence]", "[ Silence ]"];

pub struct WhisperCliTranscriber {
    config: SttConfig,
}

impl WhisperCliTranscriber {
    pub fn new(config: SttConfig) -> Self {
        Self { config }
    }

    fn write_scratch_wav(&self, audio: &[i16]) -> Result<tempfile::TempPath, TranscriptionError> {
        let file = tempfile::Builder::new()
            .prefix("utterance-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| TranscriptionError::Model(format!("scratch file: {e}")))?;

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(file.as_file(), spec)
            .map_err(|e| TranscriptionError::Model(format!("wav header: {e}")))?;
        for &sample in audio {
            writer
                .write_sample(sample)
                .map_err(|e| TranscriptionError::Model(format!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| TranscriptionError::Model(format!("wav finalize: {e}")))?;
        Ok(file.into_temp_path())
    }

    /// True when the raw model output means "nothing was said".
    pub fn is_silence_sentinel(text: &str) -> bool {
        let trimmed = text.trim();
        trimmed.is_empty()
            || SILENCE_SENTINELS
                .iter()
                .any(|s| trimmed.eq_ignore_ascii_case(s))
    }
}

#[async_trait]
impl Transcriber for WhisperCliTranscriber {
    async fn transcribe(&self, audio: Vec<i16>) -> Result<Transcript, TranscriptionError> {
        let duration_ms = (audio.len() as u64 * 1_000 / SAMPLE_RATE as u64) as u32;

        // Too short to contain an instruction; skip the model entirely.
        if (duration_ms as u64) < self.config.min_utterance_ms {
            log::debug!(
                "Utterance too short to transcribe ({} ms < {} ms)",
                duration_ms,
                self.config.min_utterance_ms
            );
            return Ok(Transcript::silent(duration_ms));
        }

        let wav_path = self.write_scratch_wav(&audio)?;
        let timeout = Duration::from_secs(self.config.timeout_s);

        let mut command = Command::new(&self.config.binary);
        command
            .arg("-m")
            .arg(&self.config.model)
            .arg("-f")
            .arg(&*wav_path)
            .arg("--language")
            .arg(&self.config.language)
            .arg("--no-timestamps")
            .arg("--no-prints")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!(
            "Transcribing {} ms of audio with {}",
            duration_ms,
            self.config.binary.display()
        );

        let started = std::time::Instant::now();
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(TranscriptionError::Model(format!(
                    "failed to run {}: {e}",
                    self.config.binary.display()
                )))
            }
            Err(_) => return Err(TranscriptionError::Timeout(timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscriptionError::Model(format!(
                "transcriber exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8(output.stdout)
            .map_err(|e| TranscriptionError::Empty(e.to_string()))?;
        let text = text.trim().to_string();

        log::info!(
            "Transcribed {} ms in {} ms: '{}'",
            duration_ms,
            started.elapsed().as_millis(),
            text
        );

        if Self::is_silence_sentinel(&text) {
            return Ok(Transcript::silent(duration_ms));
        }

        Ok(Transcript {
            text,
            is_silent: false,
            duration_ms,
        })
    }
}
