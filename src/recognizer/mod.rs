//! Streaming speech recognition over a binary WebSocket protocol

pub mod protocol;
mod session;

pub use session::{
    RecognitionResult, RecognizerEvent, RecognizerSession, SpeechRecognizer, StreamingRecognizer,
};
