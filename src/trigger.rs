//! Manual trigger sources
//!
//! A trigger is the push-to-talk button: press, release, and a double press.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Button event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Pressed,
    Released,
    DoubleTrigger,
}

/// Trigger driven by lines on a reader (normally stdin)
///
/// An empty line toggles between pressed and released; `d` sends a double trigger.
#[derive(Debug, Default)]
pub struct LineTrigger {
    pressed: bool,
}

impl LineTrigger {
    #[must_use]
    pub const fn new() -> Self {
        Self { pressed: false }
    }

    /// Interpret one input line
    pub fn interpret(&mut self, line: &str) -> Option<TriggerEvent> {
        match line.trim() {
            "" => {
                self.pressed = !self.pressed;
                Some(if self.pressed {
                    TriggerEvent::Pressed
                } else {
                    TriggerEvent::Released
                })
            }
            "d" | "D" => Some(TriggerEvent::DoubleTrigger),
            _ => None,
        }
    }

    /// Read `reader` line by line in the background
    #[must_use]
    pub fn spawn<R>(mut self, reader: R) -> mpsc::Receiver<TriggerEvent>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = self.interpret(&line) {
                            tracing::debug!(?event, "trigger");
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "trigger input failed");
                        break;
                    }
                }
            }
        });

        rx
    }

    /// Trigger on the process's stdin
    #[must_use]
    pub fn stdin() -> mpsc::Receiver<TriggerEvent> {
        Self::new().spawn(tokio::io::stdin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_toggles() {
        let mut trigger = LineTrigger::new();
        assert_eq!(trigger.interpret(""), Some(TriggerEvent::Pressed));
        assert_eq!(trigger.interpret("\r"), Some(TriggerEvent::Released));
        assert_eq!(trigger.interpret("d"), Some(TriggerEvent::DoubleTrigger));
        assert_eq!(trigger.interpret("hello"), None);
        assert_eq!(trigger.interpret(""), Some(TriggerEvent::Pressed));
    }

    #[tokio::test]
    async fn test_spawn_reads_lines() {
        let input: &[u8] = b"\nd\n\n";
        let mut rx = LineTrigger::new().spawn(input);

        assert_eq!(rx.recv().await, Some(TriggerEvent::Pressed));
        assert_eq!(rx.recv().await, Some(TriggerEvent::DoubleTrigger));
        assert_eq!(rx.recv().await, Some(TriggerEvent::Released));
        assert_eq!(rx.recv().await, None);
    }
}
