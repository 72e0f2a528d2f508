//! Energy-based voice activity detection
//!
//! Emits speech-start / speech-end edges with hysteresis: energy must stay above
//! the threshold for `min_speech` before a start is declared, and below it for
//! `min_silence` before an end is declared.

use tokio::time::Instant;

use crate::config::VadConfig;

/// PCM audio captured between a speech-start and speech-end edge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeechSegment {
    pcm: Vec<u8>,
}

impl SpeechSegment {
    /// Raw 16-bit little-endian PCM bytes
    #[must_use]
    pub fn pcm(&self) -> &[u8] {
        &self.pcm
    }

    /// Consume the segment, returning its PCM bytes
    #[must_use]
    pub fn into_pcm(self) -> Vec<u8> {
        self.pcm
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pcm.len()
    }
}

/// Edge emitted by the detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VadEvent {
    /// Sustained energy rose above the threshold
    SpeechStart,
    /// Sustained silence after speech; carries the finalized segment
    SpeechEnd(SpeechSegment),
}

/// Voice activity detector over 16-bit PCM chunks
#[derive(Debug)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    speaking: bool,
    last_speech_at: Option<Instant>,
    last_silence_at: Option<Instant>,
    segment: Vec<u8>,
}

impl VoiceActivityDetector {
    #[must_use]
    pub fn new(config: VadConfig) -> Self {
        tracing::debug!(
            threshold = config.energy_threshold,
            min_speech_ms = config.min_speech.as_millis(),
            min_silence_ms = config.min_silence.as_millis(),
            "voice activity detector initialized"
        );

        Self {
            config,
            speaking: false,
            last_speech_at: None,
            last_silence_at: None,
            segment: Vec::new(),
        }
    }

    /// Process a chunk observed now
    pub fn process(&mut self, chunk: &[u8]) -> Option<VadEvent> {
        self.process_at(chunk, Instant::now())
    }

    /// Process a chunk observed at `now`
    ///
    /// Returns at most one edge per call, and at most one start/end pair per
    /// sustained transition regardless of how fast chunks arrive.
    pub fn process_at(&mut self, chunk: &[u8], now: Instant) -> Option<VadEvent> {
        let energy = rms_energy(chunk);

        // First chunk after a reset anchors both timers
        let last_silence = *self.last_silence_at.get_or_insert(now);
        let last_speech = *self.last_speech_at.get_or_insert(now);

        if self.speaking {
            self.segment.extend_from_slice(chunk);
        }

        if energy > self.config.energy_threshold {
            self.last_speech_at = Some(now);

            if !self.speaking && now.duration_since(last_silence) >= self.config.min_speech {
                self.speaking = true;
                self.segment.clear();
                self.segment.extend_from_slice(chunk);
                tracing::debug!(energy, "speech start");
                return Some(VadEvent::SpeechStart);
            }
        } else {
            self.last_silence_at = Some(now);

            if self.speaking && now.duration_since(last_speech) >= self.config.min_silence {
                self.speaking = false;
                let segment = SpeechSegment {
                    pcm: std::mem::take(&mut self.segment),
                };
                tracing::debug!(bytes = segment.len(), "speech end");
                return Some(VadEvent::SpeechEnd(segment));
            }
        }

        tracing::trace!(energy, speaking = self.speaking, "vad chunk");
        None
    }

    /// Clear timers and force the not-speaking state
    ///
    /// Called whenever a new listening turn begins so timers from an earlier
    /// turn cannot produce an immediate edge.
    pub fn reset(&mut self) {
        self.speaking = false;
        self.last_speech_at = None;
        self.last_silence_at = None;
        self.segment.clear();
    }

    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    #[must_use]
    pub const fn config(&self) -> &VadConfig {
        &self.config
    }
}

/// RMS energy of 16-bit signed little-endian samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_energy(pcm: &[u8]) -> f64 {
    let samples = pcm.len() / 2;
    if samples == 0 {
        return 0.0;
    }

    let sum_squares: f64 = pcm
        .chunks_exact(2)
        .map(|b| {
            let s = f64::from(i16::from_le_bytes([b[0], b[1]]));
            s * s
        })
        .sum();

    (sum_squares / samples as f64).sqrt()
}
