//! Configuration management for the dialogue pipeline
//!
//! Values resolve as env > toml > default. CLI flags are applied on top by the binary.

pub mod file;

use std::path::Path;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::{Error, Result};

/// Resolved pipeline configuration
#[derive(Debug)]
pub struct Config {
    /// Audio capture process
    pub capture: CaptureConfig,

    /// Voice activity detection
    pub vad: VadConfig,

    /// Streaming recognizer
    pub recognizer: RecognizerConfig,

    /// Reply sentence segmentation
    pub sentencer: SentencerConfig,

    /// Audio playback
    pub playback: PlaybackConfig,

    /// Language model
    pub chat: ChatConfig,

    /// File-based STT and TTS models
    pub speech: SpeechConfig,

    /// Status display
    pub display: DisplayConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Capture program, resolved on `PATH`
    pub program: String,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Channel count
    pub channels: u16,

    /// Target chunk length in milliseconds
    pub chunk_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: "arecord".to_string(),
            sample_rate: 16_000,
            channels: 1,
            chunk_ms: 100,
        }
    }
}

impl CaptureConfig {
    /// Bytes per emitted chunk (16-bit samples)
    #[must_use]
    pub fn chunk_bytes(&self) -> usize {
        let samples = u64::from(self.sample_rate) * u64::from(self.chunk_ms) / 1000;
        let bytes = samples * u64::from(self.channels) * 2;
        usize::try_from(bytes).unwrap_or(usize::MAX).max(2)
    }

    /// Arguments for the capture program
    ///
    /// `arecord` and `rec` (sox) are understood; anything else gets the `arecord` flags.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let program = Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        if program == "rec" || program == "sox" {
            let mut args = Vec::new();
            if program == "sox" {
                args.push("-d".to_string());
            }
            args.extend([
                "-q".to_string(),
                "-r".to_string(),
                self.sample_rate.to_string(),
                "-c".to_string(),
                self.channels.to_string(),
                "-b".to_string(),
                "16".to_string(),
                "-e".to_string(),
                "signed-integer".to_string(),
                "-t".to_string(),
                "raw".to_string(),
                "-".to_string(),
            ]);
            return args;
        }

        vec![
            "-q".to_string(),
            "-f".to_string(),
            "S16_LE".to_string(),
            "-r".to_string(),
            self.sample_rate.to_string(),
            "-c".to_string(),
            self.channels.to_string(),
            "-t".to_string(),
            "raw".to_string(),
            "-".to_string(),
        ]
    }
}

/// Voice activity detection tunables
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Arm the detector while idle
    pub enabled: bool,

    /// RMS energy over 16-bit samples above which a chunk counts as speech
    pub energy_threshold: f64,

    /// Sustained energy required before declaring speech start
    pub min_speech: Duration,

    /// Sustained silence required before declaring speech end
    pub min_silence: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            energy_threshold: 1000.0,
            min_speech: Duration::from_millis(200),
            min_silence: Duration::from_millis(800),
        }
    }
}

/// How a recognition result without an explicit final flag is treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingFinalFlag {
    /// Treat the result as final
    #[default]
    Final,
    /// Treat the result as partial and keep waiting
    Partial,
}

/// Streaming recognizer configuration
#[derive(Debug)]
pub struct RecognizerConfig {
    /// WebSocket endpoint
    pub url: String,

    /// Application id (required to connect)
    pub app_id: Option<String>,

    /// Access token (required to connect)
    pub token: Option<SecretString>,

    /// Recognizer cluster
    pub cluster: String,

    /// Recognition language
    pub language: String,

    /// User id sent with the session request
    pub uid: String,

    /// Outbound audio flush period
    pub flush_interval: Duration,

    /// How long to wait for a final result after capture ends
    pub final_timeout: Duration,

    /// Policy for results without a final flag
    pub missing_final_flag: MissingFinalFlag,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            url: "wss://openspeech.bytedance.com/api/v2/asr".to_string(),
            app_id: None,
            token: None,
            cluster: "volcengine_streaming_common".to_string(),
            language: "en-US".to_string(),
            uid: "parley".to_string(),
            flush_interval: Duration::from_millis(500),
            final_timeout: Duration::from_millis(2000),
            missing_final_flag: MissingFinalFlag::Final,
        }
    }
}

impl RecognizerConfig {
    /// Whether the credentials needed to open a connection are present
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.app_id.as_deref().is_some_and(|id| !id.is_empty()) && self.token.is_some()
    }
}

/// Sentence segmentation configuration
#[derive(Debug, Clone)]
pub struct SentencerConfig {
    /// Merge short sentences until the batch would exceed this many chars
    pub merge_chars: usize,
}

impl Default for SentencerConfig {
    fn default() -> Self {
        Self { merge_chars: 60 }
    }
}

/// Audio playback configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Player program, resolved on `PATH`
    pub program: String,

    /// Player arguments; `{file}` is replaced with the audio path
    pub args: Vec<String>,

    /// Wait between checks for new synthesis jobs
    pub poll_backoff: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            program: "mpg123".to_string(),
            args: vec!["-q".to_string(), "{file}".to_string()],
            poll_backoff: Duration::from_millis(1000),
        }
    }
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// OpenAI-compatible API base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// System prompt
    pub system_prompt: String,

    /// Previous exchanges sent with each request
    pub history_turns: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a voice assistant. Keep responses concise and conversational."
                .to_string(),
            history_turns: 5,
        }
    }
}

/// File-based STT and TTS configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Transcription model (e.g. "whisper-1")
    pub stt_model: String,

    /// Speech model (e.g. "tts-1")
    pub tts_model: String,

    /// Voice identifier
    pub tts_voice: String,

    /// Speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_speed: 1.0,
        }
    }
}

/// Status display configuration
#[derive(Debug, Clone, Default)]
pub struct DisplayConfig {
    /// Display server address; log-only display when unset
    pub addr: Option<String>,
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (chat, Whisper, TTS)
    pub openai: Option<SecretString>,
}

impl ApiKeys {
    /// A copy of the `OpenAI` key for handing to a client
    #[must_use]
    pub fn openai_key(&self) -> Option<SecretString> {
        self.openai
            .as_ref()
            .map(|k| SecretString::from(k.expose_secret().to_string()))
    }
}

impl Config {
    /// Load configuration from the standard file location (or `path`) and environment
    ///
    /// # Errors
    ///
    /// Returns error if the resolved values are out of range
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path);

        let capture_default = CaptureConfig::default();
        let capture = CaptureConfig {
            program: fc.capture.program.unwrap_or(capture_default.program),
            sample_rate: fc.capture.sample_rate.unwrap_or(capture_default.sample_rate),
            channels: fc.capture.channels.unwrap_or(capture_default.channels),
            chunk_ms: fc.capture.chunk_ms.unwrap_or(capture_default.chunk_ms),
        };

        let vad_default = VadConfig::default();
        let vad = VadConfig {
            enabled: env_bool("PARLEY_VAD_ENABLED")
                .or(fc.vad.enabled)
                .unwrap_or(vad_default.enabled),
            energy_threshold: fc
                .vad
                .energy_threshold
                .unwrap_or(vad_default.energy_threshold),
            min_speech: fc
                .vad
                .min_speech_ms
                .map_or(vad_default.min_speech, Duration::from_millis),
            min_silence: fc
                .vad
                .min_silence_ms
                .map_or(vad_default.min_silence, Duration::from_millis),
        };

        let rec_default = RecognizerConfig::default();
        let recognizer = RecognizerConfig {
            url: std::env::var("PARLEY_RECOGNIZER_URL")
                .ok()
                .or(fc.recognizer.url)
                .unwrap_or(rec_default.url),
            app_id: std::env::var("PARLEY_RECOGNIZER_APP_ID")
                .ok()
                .or(fc.recognizer.app_id),
            token: std::env::var("PARLEY_RECOGNIZER_TOKEN")
                .ok()
                .or(fc.recognizer.token)
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            cluster: std::env::var("PARLEY_RECOGNIZER_CLUSTER")
                .ok()
                .or(fc.recognizer.cluster)
                .unwrap_or(rec_default.cluster),
            language: fc.recognizer.language.unwrap_or(rec_default.language),
            uid: rec_default.uid,
            flush_interval: fc
                .recognizer
                .flush_interval_ms
                .map_or(rec_default.flush_interval, Duration::from_millis),
            final_timeout: fc
                .recognizer
                .final_timeout_ms
                .map_or(rec_default.final_timeout, Duration::from_millis),
            missing_final_flag: fc
                .recognizer
                .missing_final_flag
                .unwrap_or(rec_default.missing_final_flag),
        };

        let sentencer = SentencerConfig {
            merge_chars: fc
                .sentencer
                .merge_chars
                .unwrap_or(SentencerConfig::default().merge_chars),
        };

        let playback_default = PlaybackConfig::default();
        let playback = PlaybackConfig {
            program: fc.playback.program.unwrap_or(playback_default.program),
            args: fc.playback.args.unwrap_or(playback_default.args),
            poll_backoff: fc
                .playback
                .poll_backoff_ms
                .map_or(playback_default.poll_backoff, Duration::from_millis),
        };

        let chat_default = ChatConfig::default();
        let chat = ChatConfig {
            base_url: std::env::var("PARLEY_CHAT_BASE_URL")
                .ok()
                .or(fc.chat.base_url)
                .unwrap_or(chat_default.base_url),
            model: std::env::var("PARLEY_CHAT_MODEL")
                .ok()
                .or(fc.chat.model)
                .unwrap_or(chat_default.model),
            system_prompt: fc.chat.system_prompt.unwrap_or(chat_default.system_prompt),
            history_turns: fc.chat.history_turns.unwrap_or(chat_default.history_turns),
        };

        let speech_default = SpeechConfig::default();
        let speech = SpeechConfig {
            stt_model: fc.speech.stt_model.unwrap_or(speech_default.stt_model),
            tts_model: fc.speech.tts_model.unwrap_or(speech_default.tts_model),
            tts_voice: fc.speech.tts_voice.unwrap_or(speech_default.tts_voice),
            tts_speed: fc.speech.tts_speed.unwrap_or(speech_default.tts_speed),
        };

        let display = DisplayConfig {
            addr: std::env::var("PARLEY_DISPLAY_ADDR")
                .ok()
                .or(fc.display.addr)
                .filter(|a| !a.is_empty()),
        };

        let api_keys = ApiKeys {
            openai: std::env::var("OPENAI_API_KEY")
                .ok()
                .or(fc.api_keys.openai)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        };

        let config = Self {
            capture,
            vad,
            recognizer,
            sentencer,
            playback,
            chat,
            speech,
            display,
            api_keys,
        };
        config.validate()?;

        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.capture.sample_rate == 0 || self.capture.channels == 0 {
            return Err(Error::Config(
                "capture sample_rate and channels must be non-zero".to_string(),
            ));
        }
        if self.capture.chunk_ms == 0 {
            return Err(Error::Config("capture chunk_ms must be non-zero".to_string()));
        }
        if !(self.vad.energy_threshold.is_finite() && self.vad.energy_threshold >= 0.0) {
            return Err(Error::Config(
                "vad energy_threshold must be a non-negative number".to_string(),
            ));
        }
        if self.recognizer.flush_interval.is_zero() {
            return Err(Error::Config(
                "recognizer flush_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.sentencer.merge_chars == 0 {
            return Err(Error::Config("sentencer merge_chars must be non-zero".to_string()));
        }
        if !(0.25..=4.0).contains(&self.speech.tts_speed) {
            return Err(Error::Config("speech tts_speed must be within 0.25..=4.0".to_string()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            vad: VadConfig::default(),
            recognizer: RecognizerConfig::default(),
            sentencer: SentencerConfig::default(),
            playback: PlaybackConfig::default(),
            chat: ChatConfig::default(),
            speech: SpeechConfig::default(),
            display: DisplayConfig::default(),
            api_keys: ApiKeys::default(),
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
