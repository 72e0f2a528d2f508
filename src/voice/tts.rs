//! Text-to-speech (TTS) processing

use std::io::Cursor;
use std::path::PathBuf;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::SpeechConfig;
use crate::{Error, Result};

/// Where synthesized audio lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// Encoded audio bytes (e.g. MP3)
    Data(Vec<u8>),
    /// Audio file on disk
    File(PathBuf),
}

/// Output of one synthesis job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub source: AudioSource,
    pub duration_ms: u64,
}

/// Converts text to speech
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize one sentence
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio>;
}

/// Synthesizes speech with an OpenAI-compatible `/audio/speech` endpoint
pub struct TextToSpeech {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    voice: String,
    speed: f32,
    model: String,
}

impl TextToSpeech {
    /// Create a new TTS instance
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(base_url: &str, api_key: Option<SecretString>, speech: &SpeechConfig) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.expose_secret().is_empty())
            .ok_or_else(|| Error::Config("OpenAI API key required for TTS".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            voice: speech.tts_voice.clone(),
            speed: speech.tts_speed,
            model: speech.tts_model.clone(),
        })
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "mp3",
        };

        tracing::debug!(chars = text.chars().count(), "synthesizing");

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?.to_vec();
        let duration_ms = mp3_duration_ms(&audio)?;

        Ok(SynthesizedAudio {
            source: AudioSource::Data(audio),
            duration_ms,
        })
    }
}

/// Measure the playback length of MP3 bytes
///
/// # Errors
///
/// Returns error if the data is not decodable MP3
pub fn mp3_duration_ms(mp3_data: &[u8]) -> Result<u64> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut total_ms = 0u64;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                let channels = frame.channels.max(1);
                let samples_per_channel = frame.data.len() / channels;
                if let Ok(rate) = u64::try_from(frame.sample_rate) {
                    if rate > 0 {
                        total_ms += samples_per_channel as u64 * 1000 / rate;
                    }
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => {}
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(total_ms)
}
