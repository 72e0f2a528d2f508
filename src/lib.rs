//! Parley - Real-time spoken-dialogue turn-taking
//!
//! This library provides the pipeline behind a push-to-talk / voice-activated
//! assistant:
//! - Audio capture and energy-based voice activity detection
//! - Streaming recognition over a binary WebSocket protocol
//! - Sentence-by-sentence synthesis with in-order playback
//! - A turn-taking state machine with barge-in
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────┐   ┌──────────────────────┐
//! │ Capture      ├──►│   VAD   ├──►│ StreamingRecognizer  │
//! └──────────────┘   └────┬────┘   └──────────┬───────────┘
//!                         │                   │ final text
//! ┌───────────────────────▼───────────────────▼───────────┐
//! │              ConversationController                   │
//! │   sleep → listening → recognizing → answering         │
//! └───────────────────────┬───────────────────────────────┘
//!                         │ reply fragments
//! ┌───────────────────────▼──────┐   ┌──────────────────────┐
//! │ ResponseSentencer (N jobs)   ├──►│ PlaybackSequencer    │
//! └──────────────────────────────┘   └──────────────────────┘
//! ```

pub mod chat;
pub mod config;
pub mod conversation;
pub mod display;
pub mod error;
pub mod recognizer;
pub mod trigger;
pub mod voice;

pub use chat::{ChatEvent, ChatMessage, ChatModel, OpenAiChat};
pub use config::Config;
pub use conversation::{Collaborators, ControllerSettings, ConversationController, State};
pub use display::{DisplaySink, DisplayUpdate, LogDisplay, SocketDisplay};
pub use error::{Error, Result};
pub use recognizer::{RecognitionResult, RecognizerEvent, SpeechRecognizer, StreamingRecognizer};
pub use trigger::{LineTrigger, TriggerEvent};
