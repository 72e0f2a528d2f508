//! Conversation states and the trigger handlers valid in each

use std::fmt;

use crate::display::DisplayUpdate;
use crate::trigger::TriggerEvent;

/// How a listening turn was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Voice activity started the turn; speech end finishes it
    Vad,
    /// The button started the turn; release finishes it
    Button,
}

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Sleep,
    Listening(ListenMode),
    Recognizing,
    Answering,
    ShowingImage,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sleep => f.write_str("sleep"),
            Self::Listening(ListenMode::Vad) => f.write_str("listening (vad)"),
            Self::Listening(ListenMode::Button) => f.write_str("listening (button)"),
            Self::Recognizing => f.write_str("recognizing"),
            Self::Answering => f.write_str("answering"),
            Self::ShowingImage => f.write_str("showing image"),
        }
    }
}

impl State {
    /// Status shown on entering the state
    #[must_use]
    pub fn display_update(self) -> DisplayUpdate {
        let (status, emoji, rgb) = match self {
            Self::Sleep => ("idle", "😴", "#000055"),
            Self::Listening(_) => ("listening", "😐", "#00ff00"),
            Self::Recognizing => ("recognizing", "🤔", "#ff6800"),
            Self::Answering => ("answering", "😊", "#0055ff"),
            Self::ShowingImage => ("image", "🖼️", "#ffffff"),
        };

        DisplayUpdate {
            status: Some(status.to_string()),
            emoji: Some(emoji.to_string()),
            text: matches!(self, Self::Sleep).then(|| "Press the button or start speaking".to_string()),
            rgb: Some(rgb.to_string()),
            brightness: Some(100),
        }
    }
}

/// What the controller does in response to a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    /// Begin a button-driven listening turn
    StartListening,
    /// Abandon the current capture and begin a new button-driven turn
    RestartListening,
    /// Finish a button-driven recording
    FinishRecording,
    /// Cut off the reply and listen
    BargeIn,
    /// Cut off the reply and go idle
    Dismiss,
    /// Clear the shown image and go idle
    Clear,
}

/// Trigger handlers installed on entering a state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerBindings {
    pub pressed: Option<TriggerAction>,
    pub released: Option<TriggerAction>,
    pub double: Option<TriggerAction>,
}

impl TriggerBindings {
    /// Exactly the handlers valid in `state`
    #[must_use]
    pub const fn for_state(state: State) -> Self {
        match state {
            State::Sleep => Self {
                pressed: Some(TriggerAction::StartListening),
                released: None,
                double: None,
            },
            State::Listening(ListenMode::Vad) => Self {
                pressed: Some(TriggerAction::RestartListening),
                released: None,
                double: None,
            },
            State::Listening(ListenMode::Button) => Self {
                pressed: Some(TriggerAction::RestartListening),
                released: Some(TriggerAction::FinishRecording),
                double: None,
            },
            State::Recognizing => Self {
                pressed: None,
                released: None,
                double: None,
            },
            State::Answering => Self {
                pressed: Some(TriggerAction::BargeIn),
                released: None,
                double: Some(TriggerAction::Dismiss),
            },
            State::ShowingImage => Self {
                pressed: Some(TriggerAction::Clear),
                released: None,
                double: None,
            },
        }
    }

    #[must_use]
    pub const fn action(&self, event: TriggerEvent) -> Option<TriggerAction> {
        match event {
            TriggerEvent::Pressed => self.pressed,
            TriggerEvent::Released => self.released,
            TriggerEvent::DoubleTrigger => self.double,
        }
    }
}
