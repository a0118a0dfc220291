//! Speech synthesis.
//!
//! Responses are preprocessed into speakable text (markdown stripped, URLs
//! elided), sent to an HTTP synthesis endpoint, and decoded from the WAV
//! reply into a PCM clip for the playback machine.

use crate::audio::AudioClip;
use crate::config::TtsConfig;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("Synthesis request failed: {0}")]
    Request(String),
    #[error("Synthesis endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },
    #[error("Could not decode synthesized audio: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioClip, TtsError>;
}

static CODE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());
static MARKDOWN_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").unwrap());
static BARE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());
static EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*_]{1,3}([^*_]+)[*_]{1,3}").unwrap());
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s*").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Reduce a model response to something worth saying out loud.
pub fn speakable(text: &str) -> String {
    let text = CODE_BLOCK.replace_all(text, " ");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = MARKDOWN_LINK.replace_all(&text, "$1");
    let text = BARE_URL.replace_all(&text, "");
    let text = EMPHASIS.replace_all(&text, "$1");
    let text = HEADING.replace_all(&text, "");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

pub struct HttpTts {
    client: reqwest::Client,
    config: TtsConfig,
}

impl HttpTts {
    pub fn new(config: TtsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()
            .expect("reqwest client");
        Self { client, config }
    }

    fn decode_wav(&self, bytes: &[u8]) -> Result<AudioClip, TtsError> {
        let mut reader =
            hound::WavReader::new(Cursor::new(bytes)).map_err(|e| TtsError::Decode(e.to_string()))?;
        let spec = reader.spec();

        let mut samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .collect::<Result<_, _>>()
                .map_err(|e| TtsError::Decode(e.to_string()))?,
            (hound::SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * 32_767.0) as i16))
                .collect::<Result<_, _>>()
                .map_err(|e| TtsError::Decode(e.to_string()))?,
            (format, bits) => {
                return Err(TtsError::Decode(format!(
                    "unsupported WAV format {format:?}/{bits}-bit"
                )))
            }
        };

        // Fold stereo down rather than refuse it.
        if spec.channels == 2 {
            samples = samples
                .chunks_exact(2)
                .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
                .collect();
        } else if spec.channels != 1 {
            return Err(TtsError::Decode(format!(
                "unsupported channel count {}",
                spec.channels
            )));
        }

        if self.config.volume != 1.0 {
            let gain = self.config.volume;
            for sample in &mut samples {
                *sample = ((*sample as f32) * gain).clamp(-32_768.0, 32_767.0) as i16;
            }
        }

        Ok(AudioClip {
            samples,
            sample_rate: spec.sample_rate,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpTts {
    async fn synthesize(&self, text: &str) -> Result<AudioClip, TtsError> {
        let spoken = speakable(text);
        if spoken.is_empty() {
            return Err(TtsError::Request("nothing speakable in response".into()));
        }

        log::debug!("Synthesizing {} chars", spoken.len());
        let response = self
            .client
            .post(self.config.endpoint.as_str())
            .json(&serde_json::json!({
                "text": spoken,
                "voice": self.config.voice,
                "speed": self.config.speed,
            }))
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TtsError::Endpoint {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;
        let clip = self.decode_wav(&bytes)?;
        log::debug!(
            "Synthesized clip: {} samples @ {} Hz ({:?})",
            clip.samples.len(),
            clip.sample_rate,
            clip.duration()
        );
        Ok(clip)
    }
}
