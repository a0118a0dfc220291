use crate::config::ConfigError;
use crate::router::provider::ProviderError;
use crate::stt::TranscriptionError;
use crate::tools::ToolError;
use crate::tts::TtsError;
use crate::wakeword::ModelError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Transcription error: {0}")]
    Transcription(#[from] TranscriptionError),

    #[error("AI provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Speech synthesis error: {0}")]
    Tts(#[from] TtsError),

    #[error("Event bus error: {0}")]
    Bus(String),

    #[error("Invariant violation: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// Process exit code for fatal startup failures.
    ///
    /// 0 is reserved for clean signal shutdown; categorized codes let the
    /// supervising unit tell a missing model from a missing microphone.
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::Config(_) => 2,
            GatewayError::Model(_) => 3,
            GatewayError::Device(_) => 4,
            _ => 1,
        }
    }
}
