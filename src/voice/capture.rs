//! Audio capture from a system recording process
//!
//! Spawns the configured recorder (e.g. `arecord`) writing raw 16-bit PCM to
//! stdout and re-chunks its output into ~100 ms buffers.

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::CaptureConfig;
use crate::{Error, Result};

/// Capacity of the capture event channel
const EVENT_CHANNEL_SIZE: usize = 64;

/// Event emitted by the capture stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A chunk of raw PCM bytes
    Data(Vec<u8>),
    /// The capture process failed or exited abnormally
    Error(String),
    /// The capture process exited cleanly on its own
    Exited,
}

/// Start/stop control over an audio input
///
/// Chunks are delivered on the receiver handed out alongside the device.
pub trait CaptureDevice: Send {
    /// Begin capturing; no-op if already capturing
    ///
    /// # Errors
    ///
    /// Returns error if the input cannot be opened
    fn start(&mut self) -> Result<()>;

    /// Stop capturing and release the input; idempotent
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Captures audio from the default input device via a child process
///
/// Each `start` after `stop` spawns a fresh process; processes are never reused.
pub struct AudioCaptureStream {
    config: CaptureConfig,
    events: mpsc::Sender<CaptureEvent>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl AudioCaptureStream {
    /// Create a capture stream and the receiver its events are delivered on
    #[must_use]
    pub fn new(config: CaptureConfig) -> (Self, mpsc::Receiver<CaptureEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        (
            Self {
                config,
                events,
                stop_tx: None,
            },
            rx,
        )
    }

    /// Start capturing audio
    ///
    /// No-op if already capturing.
    ///
    /// # Errors
    ///
    /// Returns error if the capture program cannot be found or spawned
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let program = which::which(&self.config.program).map_err(|e| {
            Error::Device(format!("capture program '{}' not found: {e}", self.config.program))
        })?;

        let child = Command::new(&program)
            .args(self.config.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Device(format!("failed to spawn {}: {e}", program.display())))?;

        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        let chunk_bytes = self.config.chunk_bytes();
        let events = self.events.clone();
        tokio::spawn(pump(child, chunk_bytes, events, stop_rx));

        tracing::debug!(
            program = %program.display(),
            sample_rate = self.config.sample_rate,
            channels = self.config.channels,
            chunk_bytes,
            "audio capture started"
        );
        Ok(())
    }

    /// Stop capturing and terminate the process
    ///
    /// Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
            tracing::debug!("audio capture stopped");
        }
    }

    /// Check if a capture process is currently attached and alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.stop_tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    #[must_use]
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

impl CaptureDevice for AudioCaptureStream {
    fn start(&mut self) -> Result<()> {
        Self::start(self)
    }

    fn stop(&mut self) {
        Self::stop(self);
    }

    fn is_running(&self) -> bool {
        Self::is_running(self)
    }
}

impl Drop for AudioCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read the child's stdout into fixed-size chunks until stopped or EOF
async fn pump(
    mut child: Child,
    chunk_bytes: usize,
    events: mpsc::Sender<CaptureEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let Some(mut stdout) = child.stdout.take() else {
        let _ = events
            .send(CaptureEvent::Error("capture stdout unavailable".to_string()))
            .await;
        return;
    };

    let mut chunk = Vec::with_capacity(chunk_bytes);
    let mut buf = vec![0u8; chunk_bytes];

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill capture process");
                }
                return;
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    chunk.extend_from_slice(&buf[..n]);
                    while chunk.len() >= chunk_bytes {
                        let rest = chunk.split_off(chunk_bytes);
                        let full = std::mem::replace(&mut chunk, rest);
                        if events.send(CaptureEvent::Data(full)).await.is_err() {
                            let _ = child.kill().await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "audio capture read error");
                    let _ = child.kill().await;
                    let _ = events.send(CaptureEvent::Error(e.to_string())).await;
                    return;
                }
            }
        }
    }

    // Keep sample alignment when flushing the tail
    chunk.truncate(chunk.len() & !1);
    if !chunk.is_empty() {
        let _ = events.send(CaptureEvent::Data(chunk)).await;
    }

    let event = match child.wait().await {
        Ok(status) if status.success() => CaptureEvent::Exited,
        Ok(status) => CaptureEvent::Error(format!("capture process exited with {status}")),
        Err(e) => CaptureEvent::Error(format!("failed to wait for capture process: {e}")),
    };
    tracing::debug!(?event, "audio capture process ended");
    let _ = events.send(event).await;
}
