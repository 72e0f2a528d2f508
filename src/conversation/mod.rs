//! Conversation turn-taking
//!
//! The controller drives one turn at a time through
//! `sleep -> listening -> recognizing -> answering -> sleep`, streaming the
//! reply through the sentencer into the playback sequencer.

mod controller;
pub mod sentencer;
pub mod sequencer;
mod state;

pub use controller::{Collaborators, ControllerSettings, ConversationController, Status};
pub use sentencer::{ResponseSentencer, Sentence, split_sentences};
pub use sequencer::{AudioPlaybackSequencer, PlaybackOutcome, PlaybackQueue, SynthesisJob};
pub use state::{ListenMode, State, TriggerAction, TriggerBindings};
