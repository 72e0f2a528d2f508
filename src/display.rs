//! Status display sinks
//!
//! Updates are fire-and-forget: a slow or absent display never blocks the
//! conversation.

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// One display update; unset fields leave the display unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DisplayUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Status light color, e.g. "#00ff00"
    #[serde(rename = "RGB", skip_serializing_if = "Option::is_none")]
    pub rgb: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
}

impl DisplayUpdate {
    /// Text-only update
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

/// Receives status updates
pub trait DisplaySink: Send + Sync {
    fn display(&self, update: DisplayUpdate);
}

/// Display that only logs
#[derive(Debug, Default)]
pub struct LogDisplay;

impl DisplaySink for LogDisplay {
    fn display(&self, update: DisplayUpdate) {
        tracing::info!(
            status = update.status.as_deref().unwrap_or_default(),
            text = update.text.as_deref().unwrap_or_default(),
            "display"
        );
    }
}

/// Drives a display server over TCP with newline-delimited JSON
///
/// The connection is opened lazily and re-opened after write failures.
#[derive(Debug)]
pub struct SocketDisplay {
    tx: mpsc::UnboundedSender<DisplayUpdate>,
}

impl SocketDisplay {
    /// Spawn the writer task for `addr` (e.g. "127.0.0.1:12345")
    #[must_use]
    pub fn spawn(addr: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_updates(addr, rx));
        Self { tx }
    }
}

impl DisplaySink for SocketDisplay {
    fn display(&self, update: DisplayUpdate) {
        let _ = self.tx.send(update);
    }
}

async fn write_updates(addr: String, mut rx: mpsc::UnboundedReceiver<DisplayUpdate>) {
    let mut stream: Option<TcpStream> = None;

    while let Some(update) = rx.recv().await {
        let mut line = match serde_json::to_vec(&update) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode display update");
                continue;
            }
        };
        line.push(b'\n');

        if stream.is_none() {
            match TcpStream::connect(&addr).await {
                Ok(s) => {
                    tracing::debug!(addr = %addr, "display connected");
                    stream = Some(s);
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "display unavailable");
                    continue;
                }
            }
        }

        if let Some(s) = stream.as_mut() {
            if let Err(e) = s.write_all(&line).await {
                tracing::debug!(error = %e, "display write failed, reconnecting on next update");
                stream = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_update_serializes_sparse() {
        let update = DisplayUpdate {
            status: Some("listening".to_string()),
            rgb: Some("#00ff00".to_string()),
            ..DisplayUpdate::default()
        };
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r##"{"status":"listening","RGB":"#00ff00"}"##
        );
    }

    #[tokio::test]
    async fn test_socket_display_writes_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let display = SocketDisplay::spawn(addr);
        display.display(DisplayUpdate::text("hello"));
        display.display(DisplayUpdate::text("world"));

        let (socket, _) = listener.accept().await.unwrap();
        let mut lines = tokio::io::BufReader::new(socket).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"text":"hello"}"#);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"text":"world"}"#);
    }
}
