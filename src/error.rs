//! Error types for the turn-taking pipeline

use thiserror::Error;

/// Result type alias for parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the dialogue pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio data error (encoding, decoding, format)
    #[error("audio error: {0}")]
    Audio(String),

    /// Capture or playback device failure (process spawn, abnormal exit)
    #[error("device error: {0}")]
    Device(String),

    /// Malformed recognizer frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Streaming recognizer failure (connection, server error response)
    #[error("recognizer error: {0}")]
    Recognizer(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Language model error
    #[error("chat error: {0}")]
    Chat(String),

    /// Display sink error
    #[error("display error: {0}")]
    Display(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
