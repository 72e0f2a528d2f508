//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional: the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::MissingFinalFlag;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfigFile {
    /// Audio capture process
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Voice activity detection
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Streaming recognizer connection
    #[serde(default)]
    pub recognizer: RecognizerFileConfig,

    /// Sentence segmentation of replies
    #[serde(default)]
    pub sentencer: SentencerFileConfig,

    /// Audio playback process
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Language model
    #[serde(default)]
    pub chat: ChatFileConfig,

    /// File-based STT and TTS
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Status display
    #[serde(default)]
    pub display: DisplayFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Capture program (e.g. "arecord")
    pub program: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    /// Target chunk length in milliseconds
    pub chunk_ms: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub enabled: Option<bool>,
    /// RMS threshold over 16-bit samples
    pub energy_threshold: Option<f64>,
    pub min_speech_ms: Option<u64>,
    pub min_silence_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecognizerFileConfig {
    pub url: Option<String>,
    pub app_id: Option<String>,
    pub token: Option<String>,
    pub cluster: Option<String>,
    pub language: Option<String>,
    pub flush_interval_ms: Option<u64>,
    pub final_timeout_ms: Option<u64>,
    /// How to treat results that carry no final flag
    pub missing_final_flag: Option<MissingFinalFlag>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SentencerFileConfig {
    /// Short sentences are merged until the batch would exceed this many chars
    pub merge_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Player program (e.g. "mpg123")
    pub program: Option<String>,
    /// Player arguments; `{file}` is replaced with the audio path
    pub args: Option<Vec<String>>,
    pub poll_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatFileConfig {
    /// OpenAI-compatible API base URL
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    /// Number of previous exchanges sent with each request
    pub history_turns: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    pub stt_model: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_speed: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DisplayFileConfig {
    /// Display server address (e.g. "127.0.0.1:12345")
    pub addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
}

/// Load the TOML config file from `path`, or from the standard path
///
/// Returns `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> ParleyConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return ParleyConfigFile::default();
    };

    if !path.exists() {
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}
