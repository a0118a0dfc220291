//! Gateway configuration: defaults, optional JSON file, environment overrides.
//!
//! Everything is validated once at startup; an invalid configuration fails
//! fast with a message naming the offending key. Secrets (the AI provider
//! API key) are never read from the config file, only the environment.

use secrecy::SecretBox;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("Failed to read config file {path}: {reason}")]
    FileRead { path: String, reason: String },
    #[error("Failed to parse config file {path}: {reason}")]
    FileParse { path: String, reason: String },
}

fn default_sample_rate() -> u32 {
    16_000
}
fn default_channels() -> u16 {
    1
}
fn default_frame_samples() -> usize {
    1_280
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture device name (None = system default).
    pub device: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_frame_samples")]
    pub frame_samples: usize,
    /// Playback device name (None = system default).
    pub playback_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_samples: default_frame_samples(),
            playback_device: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WakewordConfig {
    pub melspectrogram_model: PathBuf,
    pub embedding_model: PathBuf,
    pub wakeword_model: PathBuf,
    /// Detection threshold; a frame detects only when score is strictly
    /// greater. 0.15–0.35 is the useful range, below 0.10 false-positives.
    pub threshold: f32,
    /// Minimum time between detections from the sliding window.
    pub debounce_ms: u64,
    /// How long startup waits for the rolling buffers to fill.
    pub warmup_timeout_s: u64,
}

impl Default for WakewordConfig {
    fn default() -> Self {
        Self {
            melspectrogram_model: PathBuf::from("models/melspectrogram.onnx"),
            embedding_model: PathBuf::from("models/embedding_model.onnx"),
            wakeword_model: PathBuf::from("models/hey_jarvis_v0.1.onnx"),
            threshold: 0.2,
            debounce_ms: 1_000,
            warmup_timeout_s: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    /// Normalized RMS above which a frame counts as speech.
    pub threshold: f32,
    /// Trailing silence that ends an utterance. Shorter is snappier but
    /// cuts off slow speakers.
    pub trailing_silence_ms: u64,
    /// Hard cap on utterance length.
    pub max_utterance_ms: u64,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: 0.015,
            trailing_silence_ms: 1_000,
            max_utterance_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Local transcriber binary (whisper.cpp CLI or compatible).
    pub binary: PathBuf,
    pub model: PathBuf,
    pub language: String,
    pub timeout_s: u64,
    /// Captures shorter than this skip the model entirely.
    pub min_utterance_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("whisper-cli"),
            model: PathBuf::from("models/ggml-base.en.bin"),
            language: "en".to_string(),
            timeout_s: 10,
            min_utterance_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// OpenAI-compatible chat completions base URL (local or cloud).
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key, if the
    /// provider needs one. Local servers usually don't.
    pub api_key_env: String,
    pub request_timeout_s: u64,
    /// Maximum provider→tool→provider round trips per utterance.
    pub max_tool_hops: usize,
    /// Conversation window size in messages.
    pub window_messages: usize,
    /// Idle time after which the conversation window is cleared.
    pub window_idle_timeout_s: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434/v1".to_string(),
            model: "llama3.1:8b".to_string(),
            api_key_env: "AI_API_KEY".to_string(),
            request_timeout_s: 30,
            max_tool_hops: 4,
            window_messages: 20,
            window_idle_timeout_s: 300,
        }
    }
}

impl AiConfig {
    /// Resolve the API key from the environment, if one is set.
    pub fn api_key(&self) -> Option<SecretBox<String>> {
        env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(|k| SecretBox::new(Box::new(k)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// HTTP synthesis endpoint returning a WAV body.
    pub endpoint: String,
    pub voice: String,
    pub speed: f32,
    /// Linear output gain, 0.0–2.0.
    pub volume: f32,
    pub timeout_s: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5002/api/tts".to_string(),
            voice: "en_US-lessac-medium".to_string(),
            speed: 1.0,
            volume: 1.0,
            timeout_s: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Prefix for the gateway's own topics (`voice/req`, `voice/res`, …).
    pub topic_prefix: String,
    /// Subscription filter for device state updates.
    pub device_status_filter: String,
    /// Prefix for outbound device commands (`<prefix>/<device>/set`).
    pub device_command_prefix: String,
    /// Non-retained publishes buffered while the broker is unreachable.
    pub offline_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "voice-gateway".to_string(),
            topic_prefix: "voice".to_string(),
            device_status_filter: "devices/+/status".to_string(),
            device_command_prefix: "devices".to_string(),
            offline_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct McpConfig {
    /// Command spawning the external tool server (stdio JSON-RPC).
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Web search endpoint (SearxNG-style JSON API). None disables search.
    pub search_endpoint: Option<String>,
    /// External tool-protocol server. None = built-ins only.
    pub mcp: Option<McpConfig>,
    pub call_timeout_s: u64,
    /// Retry budget for idempotent tools.
    pub retries: u32,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            search_endpoint: None,
            mcp: None,
            call_timeout_s: 10,
            retries: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub bind: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8726".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub audio: AudioConfig,
    pub wakeword: WakewordConfig,
    pub vad: VadSettings,
    pub stt: SttConfig,
    pub ai: AiConfig,
    pub tts: TtsConfig,
    pub bus: BusConfig,
    pub tools: ToolsConfig,
    pub health: HealthConfig,
    /// Spoken once after startup completes.
    pub welcome_phrase: String,
}

impl GatewayConfig {
    /// Load configuration: defaults, then the JSON file (if any), then
    /// environment overrides. `.env` is honored for development setups.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // absent .env is fine

        let mut config = match file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                serde_json::from_str::<GatewayConfig>(&raw).map_err(|e| {
                    ConfigError::FileParse {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?
            }
            None => GatewayConfig::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override file values for the keys an operator
    /// most often tweaks per host.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("VOICE_GATEWAY_DEVICE") {
            self.audio.device = Some(v);
        }
        if let Ok(v) = env::var("VOICE_GATEWAY_BUS_HOST") {
            self.bus.host = v;
        }
        if let Ok(v) = env::var("VOICE_GATEWAY_BUS_PORT") {
            if let Ok(port) = v.parse() {
                self.bus.port = port;
            }
        }
        if let Ok(v) = env::var("VOICE_GATEWAY_AI_BASE_URL") {
            self.ai.base_url = v;
        }
        if let Ok(v) = env::var("VOICE_GATEWAY_TTS_ENDPOINT") {
            self.tts.endpoint = v;
        }
        if let Ok(v) = env::var("VOICE_GATEWAY_WAKE_THRESHOLD") {
            if let Ok(t) = v.parse() {
                self.wakeword.threshold = t;
            }
        }
    }

    /// Validate every key that has a constraint. The first violation is
    /// reported with enough context to fix it without reading source.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.sample_rate != 16_000 {
            return Err(ConfigError::Invalid {
                key: "audio.sample_rate".into(),
                reason: format!("must be 16000, got {}", self.audio.sample_rate),
            });
        }
        if self.audio.channels != 1 {
            return Err(ConfigError::Invalid {
                key: "audio.channels".into(),
                reason: format!("must be 1 (mono), got {}", self.audio.channels),
            });
        }
        if self.audio.frame_samples != 1_280 {
            return Err(ConfigError::Invalid {
                key: "audio.frame_samples".into(),
                reason: format!("must be 1280 (80 ms), got {}", self.audio.frame_samples),
            });
        }
        if !(0.0..=1.0).contains(&self.wakeword.threshold) || self.wakeword.threshold == 0.0 {
            return Err(ConfigError::Invalid {
                key: "wakeword.threshold".into(),
                reason: format!("must be in (0, 1], got {}", self.wakeword.threshold),
            });
        }
        if self.wakeword.threshold < 0.10 {
            log::warn!(
                "wakeword.threshold {} is below 0.10, expect frequent false positives",
                self.wakeword.threshold
            );
        }
        if self.vad.max_utterance_ms <= self.vad.trailing_silence_ms {
            return Err(ConfigError::Invalid {
                key: "vad.max_utterance_ms".into(),
                reason: "must exceed vad.trailing_silence_ms".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.tts.volume) {
            return Err(ConfigError::Invalid {
                key: "tts.volume".into(),
                reason: format!("must be in [0, 2], got {}", self.tts.volume),
            });
        }
        if !(0.5..=2.0).contains(&self.tts.speed) {
            return Err(ConfigError::Invalid {
                key: "tts.speed".into(),
                reason: format!("must be in [0.5, 2], got {}", self.tts.speed),
            });
        }
        if self.ai.max_tool_hops == 0 {
            return Err(ConfigError::Invalid {
                key: "ai.max_tool_hops".into(),
                reason: "must be at least 1".into(),
            });
        }
        for (key, value) in [
            ("ai.base_url", &self.ai.base_url),
            ("tts.endpoint", &self.tts.endpoint),
        ] {
            if let Err(e) = url::Url::parse(value) {
                return Err(ConfigError::Invalid {
                    key: key.into(),
                    reason: format!("'{value}' is not a valid URL: {e}"),
                });
            }
        }
        if let Some(endpoint) = &self.tools.search_endpoint {
            if let Err(e) = url::Url::parse(endpoint) {
                return Err(ConfigError::Invalid {
                    key: "tools.search_endpoint".into(),
                    reason: format!("'{endpoint}' is not a valid URL: {e}"),
                });
            }
        }
        if self.bus.topic_prefix.is_empty() || self.bus.topic_prefix.contains('#') {
            return Err(ConfigError::Invalid {
                key: "bus.topic_prefix".into(),
                reason: "must be a non-empty literal topic segment".into(),
            });
        }
        Ok(())
    }

    pub fn welcome(&self) -> &str {
        if self.welcome_phrase.is_empty() {
            "Hello! I'm listening."
        } else {
            &self.welcome_phrase
        }
    }
}

/// Load configuration with helpful messages for common mistakes.
pub fn load_config(file: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    match GatewayConfig::load(file) {
        Ok(config) => {
            log::info!(
                "Configuration loaded (bus {}:{}, ai {}, tts {})",
                config.bus.host,
                config.bus.port,
                config.ai.base_url,
                config.tts.endpoint
            );
            Ok(config)
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            if let ConfigError::Invalid { key, .. } = &e {
                log::error!("Fix `{}` in the config file or the matching VOICE_GATEWAY_* override", key);
            }
            Err(e)
        }
    }
}
