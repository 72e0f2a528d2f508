//! Audio playback through a system player process

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;

use super::tts::{AudioSource, SynthesizedAudio};
use crate::config::PlaybackConfig;
use crate::{Error, Result};

/// Audio-output device
///
/// At most one playback is active at a time: starting a new one terminates the old one.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play audio, resolving when playback completes or is halted
    async fn play(&self, audio: &SynthesizedAudio) -> Result<()>;

    /// Halt the current playback immediately
    fn stop(&self);
}

/// Plays audio by spawning the configured player (e.g. `mpg123`)
pub struct ProcessAudioOutput {
    config: PlaybackConfig,
    current: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessAudioOutput {
    #[must_use]
    pub const fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            current: Mutex::new(None),
        }
    }

    fn player_args(&self, path: &Path) -> Vec<String> {
        let file = path.display().to_string();
        self.config
            .args
            .iter()
            .map(|a| a.replace("{file}", &file))
            .collect()
    }

    /// Install a kill switch for a new playback, halting the previous one
    fn claim(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut current) = self.current.lock() {
            if let Some(previous) = current.replace(tx) {
                let _ = previous.send(());
            }
        }
        rx
    }
}

#[async_trait]
impl AudioOutput for ProcessAudioOutput {
    async fn play(&self, audio: &SynthesizedAudio) -> Result<()> {
        let mut halt = self.claim();

        // Held until the player exits
        let mut temp = None;
        let path = match &audio.source {
            AudioSource::File(path) => path.clone(),
            AudioSource::Data(data) => {
                let mut file = tempfile::Builder::new()
                    .prefix("parley-")
                    .suffix(".mp3")
                    .tempfile()?;
                file.write_all(data)?;
                file.flush()?;
                let path = file.path().to_path_buf();
                temp = Some(file);
                path
            }
        };

        let program = which::which(&self.config.program).map_err(|e| {
            Error::Device(format!("player '{}' not found: {e}", self.config.program))
        })?;

        let mut child = Command::new(&program)
            .args(self.player_args(&path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Device(format!("failed to spawn {}: {e}", program.display())))?;

        tracing::debug!(duration_ms = audio.duration_ms, "playback started");

        let result = tokio::select! {
            _ = &mut halt => {
                let _ = child.kill().await;
                tracing::debug!("playback halted");
                Ok(())
            }
            status = child.wait() => match status {
                Ok(status) if status.success() => {
                    tracing::debug!("playback complete");
                    Ok(())
                }
                Ok(status) => Err(Error::Device(format!("player exited with {status}"))),
                Err(e) => Err(Error::Device(format!("failed to wait for player: {e}"))),
            }
        };

        drop(temp);
        result
    }

    fn stop(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(tx) = current.take() {
                let _ = tx.send(());
            }
        }
    }
}
