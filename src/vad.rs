//! Voice activity detection and utterance end-pointing.
//!
//! An energy gate classifies each 80 ms frame as speech or silence, tracks
//! the run of trailing silence, and ends the utterance either when that run
//! reaches the configured duration or when the hard utterance cap is hit.
//! A capture that never contained speech still ends normally and is marked
//! silent so the orchestrator can skip transcription.

use crate::config::VadSettings;
use crate::FRAME_MS;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum VadLabel {
    Speech,
    Silence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EndReason {
    TrailingSilence,
    MaxUtterance,
}

/// Emitted once per capture when the utterance is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtteranceEnd {
    pub reason: EndReason,
    /// True when no speech frame was ever observed.
    pub is_silent: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadVerdict {
    Frame(VadLabel),
    End(UtteranceEnd),
}

pub struct EnergyVad {
    threshold: f32,
    trailing_silence_ms: u64,
    max_utterance_ms: u64,
    silent_run_ms: u64,
    elapsed_ms: u64,
    saw_speech: bool,
}

impl EnergyVad {
    pub fn new(settings: &VadSettings) -> Self {
        Self {
            threshold: settings.threshold,
            trailing_silence_ms: settings.trailing_silence_ms,
            max_utterance_ms: settings.max_utterance_ms,
            silent_run_ms: 0,
            elapsed_ms: 0,
            saw_speech: false,
        }
    }

    /// Normalized RMS of an s16le frame, in [0, 1].
    pub fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples
            .iter()
            .map(|&s| {
                let x = s as f64 / 32_768.0;
                x * x
            })
            .sum();
        (sum_sq / samples.len() as f64).sqrt() as f32
    }

    /// Feed one 80 ms frame; returns the label or the end-of-utterance
    /// verdict. The max-utterance cap is checked first so the utterance
    /// ends exactly at the cap even mid-speech.
    pub fn push_frame(&mut self, samples: &[i16]) -> VadVerdict {
        self.elapsed_ms += FRAME_MS;

        let label = if Self::rms(samples) > self.threshold {
            self.saw_speech = true;
            self.silent_run_ms = 0;
            VadLabel::Speech
        } else {
            self.silent_run_ms += FRAME_MS;
            VadLabel::Silence
        };

        if self.elapsed_ms >= self.max_utterance_ms {
            return VadVerdict::End(UtteranceEnd {
                reason: EndReason::MaxUtterance,
                is_silent: !self.saw_speech,
                duration_ms: self.elapsed_ms,
            });
        }

        if self.silent_run_ms >= self.trailing_silence_ms {
            return VadVerdict::End(UtteranceEnd {
                reason: EndReason::TrailingSilence,
                is_silent: !self.saw_speech,
                duration_ms: self.elapsed_ms,
            });
        }

        VadVerdict::Frame(label)
    }

    /// Prepare for the next capture.
    pub fn reset(&mut self) {
        self.silent_run_ms = 0;
        self.elapsed_ms = 0;
        self.saw_speech = false;
    }
}
