//! Voice processing module
//!
//! Handles audio capture, voice activity detection, file-based STT, TTS, and playback.
//! Streaming recognition lives in `recognizer`.

mod capture;
mod playback;
mod stt;
mod tts;
mod vad;

pub use capture::{AudioCaptureStream, CaptureDevice, CaptureEvent};
pub use playback::{AudioOutput, ProcessAudioOutput};
pub use stt::{SpeechToText, Transcriber, pcm_to_wav};
pub use tts::{AudioSource, SynthesizedAudio, Synthesizer, TextToSpeech, mp3_duration_ms};
pub use vad::{SpeechSegment, VadEvent, VoiceActivityDetector, rms_energy};
