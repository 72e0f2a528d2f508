//! In-order playback of concurrently synthesized sentences
//!
//! Synthesis jobs start as soon as a sentence is known and may finish in any
//! order. The sequencer plays job `i` only after job `i - 1` has finished
//! playing, blocking on job `i` if it is still synthesizing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

use crate::Result;
use crate::voice::{AudioOutput, SynthesizedAudio, Synthesizer};

/// One sentence's synthesis, running in the background
///
/// Dropping the job aborts the synthesis if it is still running.
#[derive(Debug)]
pub struct SynthesisJob {
    index: usize,
    handle: JoinHandle<Result<SynthesizedAudio>>,
}

impl SynthesisJob {
    /// Start synthesizing `text` immediately
    #[must_use]
    pub fn spawn(index: usize, text: String, synthesizer: Arc<dyn Synthesizer>) -> Self {
        let handle = tokio::spawn(async move { synthesizer.synthesize(&text).await });
        Self { index, handle }
    }

    /// Sentence index this job was created for
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SynthesisJob {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: VecDeque<SynthesisJob>,
    ended: bool,
    stopped: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Ordered synthesis jobs awaiting playback
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct PlaybackQueue {
    shared: Arc<Shared>,
}

impl PlaybackQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job; ignored once the queue is stopped
    pub fn push(&self, job: SynthesisJob) {
        {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            state.jobs.push_back(job);
        }
        self.shared.notify.notify_one();
    }

    /// Signal that no further jobs will be pushed
    pub fn end(&self) {
        self.lock().ended = true;
        self.shared.notify.notify_one();
    }

    /// Jobs not yet taken for playback
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().jobs.len()
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    fn stop(&self) {
        let dropped = {
            let mut state = self.lock();
            state.stopped = true;
            std::mem::take(&mut state.jobs)
        };
        // Aborts outstanding synthesis outside the lock
        drop(dropped);
        self.shared.notify.notify_one();
    }

    fn next(&self) -> Next {
        let mut state = self.lock();
        if state.stopped {
            return Next::Stopped;
        }
        match state.jobs.pop_front() {
            Some(job) => Next::Job(job),
            None if state.ended => Next::Exhausted,
            None => Next::Wait,
        }
    }

    fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

enum Next {
    Job(SynthesisJob),
    Wait,
    Exhausted,
    Stopped,
}

/// How a playback run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Every queued sentence played and the queue ended
    Completed,
    /// [`AudioPlaybackSequencer::stop`] was called
    Stopped,
    /// The output device failed; remaining sentences were dropped
    Failed(String),
}

/// Fires the finished signal at most once
#[derive(Debug, Clone)]
struct FinishedSignal(Arc<Mutex<Option<oneshot::Sender<PlaybackOutcome>>>>);

impl FinishedSignal {
    fn fire(&self, outcome: PlaybackOutcome) {
        let sender = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(outcome);
        }
    }
}

/// Plays a [`PlaybackQueue`] strictly in index order
pub struct AudioPlaybackSequencer {
    queue: PlaybackQueue,
    output: Arc<dyn AudioOutput>,
    finished: FinishedSignal,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for AudioPlaybackSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPlaybackSequencer")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl AudioPlaybackSequencer {
    /// Start playing `queue`
    ///
    /// The returned receiver resolves exactly once: when every job has played
    /// and the queue has ended, when the output device fails, or when the
    /// sequencer is stopped.
    #[must_use]
    pub fn spawn(
        queue: PlaybackQueue,
        output: Arc<dyn AudioOutput>,
        poll_backoff: Duration,
    ) -> (Self, oneshot::Receiver<PlaybackOutcome>) {
        let (tx, rx) = oneshot::channel();
        let finished = FinishedSignal(Arc::new(Mutex::new(Some(tx))));

        let task = tokio::spawn(run(
            queue.clone(),
            Arc::clone(&output),
            poll_backoff,
            finished.clone(),
        ));

        (
            Self {
                queue,
                output,
                finished,
                task,
            },
            rx,
        )
    }

    /// Cut off playback: drop pending jobs, halt the device, signal finished
    pub fn stop(&self) {
        self.queue.stop();
        self.task.abort();
        self.output.stop();
        self.finished.fire(PlaybackOutcome::Stopped);
        tracing::debug!("playback stopped");
    }

    #[must_use]
    pub const fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }
}

async fn run(
    queue: PlaybackQueue,
    output: Arc<dyn AudioOutput>,
    poll_backoff: Duration,
    finished: FinishedSignal,
) {
    let mut expected = 0;

    let outcome = loop {
        match queue.next() {
            Next::Job(mut job) => {
                if job.index != expected {
                    tracing::warn!(index = job.index, expected, "sentence index out of sequence");
                }
                expected = job.index + 1;

                let audio = match (&mut job.handle).await {
                    Ok(Ok(audio)) => audio,
                    Ok(Err(e)) => {
                        tracing::warn!(index = job.index, error = %e, "synthesis failed, skipping sentence");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(index = job.index, error = %e, "synthesis task failed");
                        continue;
                    }
                };

                if queue.is_stopped() {
                    break PlaybackOutcome::Stopped;
                }

                tracing::debug!(index = job.index, duration_ms = audio.duration_ms, "playing sentence");
                if let Err(e) = output.play(&audio).await {
                    tracing::warn!(index = job.index, error = %e, "playback failed, dropping reply");
                    queue.stop();
                    break PlaybackOutcome::Failed(e.to_string());
                }
            }
            Next::Wait => {
                tokio::select! {
                    () = queue.shared.notify.notified() => {}
                    () = tokio::time::sleep(poll_backoff) => {}
                }
            }
            Next::Exhausted => {
                tracing::debug!(sentences = expected, "playback finished");
                break PlaybackOutcome::Completed;
            }
            Next::Stopped => break PlaybackOutcome::Stopped,
        }
    };

    finished.fire(outcome);
}
