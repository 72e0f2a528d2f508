//! Turn-taking state machine
//!
//! The controller is the only owner of conversation state. Capture chunks,
//! triggers, and the results of background work (recognition, transcription,
//! chat, playback) all arrive as messages on its loop; background results are
//! tagged with the turn that started them and dropped if that turn is no
//! longer current.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

use super::sentencer::{ResponseSentencer, Sentence};
use super::sequencer::{AudioPlaybackSequencer, PlaybackOutcome, PlaybackQueue};
use super::state::{ListenMode, State, TriggerAction, TriggerBindings};
use crate::Result;
use crate::chat::{ChatEvent, ChatMessage, ChatModel};
use crate::config::{Config, SentencerConfig, VadConfig};
use crate::display::{DisplaySink, DisplayUpdate};
use crate::recognizer::{RecognizerEvent, RecognizerSession, SpeechRecognizer};
use crate::trigger::TriggerEvent;
use crate::voice::{
    AudioOutput, CaptureDevice, CaptureEvent, SpeechSegment, Synthesizer, Transcriber, VadEvent,
    VoiceActivityDetector, pcm_to_wav,
};

/// External services the controller drives
pub struct Collaborators {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub chat: Arc<dyn ChatModel>,
    pub output: Arc<dyn AudioOutput>,
    pub display: Arc<dyn DisplaySink>,
}

/// Controller tunables
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub vad: VadConfig,
    pub sample_rate: u32,
    pub channels: u16,
    /// Wait for a final recognition result after speech ends
    pub final_timeout: Duration,
    /// Playback poll interval while the reply is still streaming
    pub poll_backoff: Duration,
    pub sentencer: SentencerConfig,
    pub system_prompt: String,
    /// Previous exchanges sent with each chat request
    pub history_turns: usize,
}

impl ControllerSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            vad: config.vad.clone(),
            sample_rate: config.capture.sample_rate,
            channels: config.capture.channels,
            final_timeout: config.recognizer.final_timeout,
            poll_backoff: config.playback.poll_backoff,
            sentencer: config.sentencer.clone(),
            system_prompt: config.chat.system_prompt.clone(),
            history_turns: config.chat.history_turns,
        }
    }
}

/// Observable controller status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: State,
    pub turn: u64,
}

#[derive(Debug)]
struct TurnEvent {
    turn: u64,
    kind: EventKind,
}

#[derive(Debug)]
enum EventKind {
    Recognizer(RecognizerEvent),
    Transcribed(Result<String>),
    Chat(ChatEvent),
    ChatEnded,
    ChatFailed(String),
    PlaybackFinished,
    PlaybackFailed(String),
}

/// Data for the turn currently capturing or awaiting recognition
#[derive(Debug)]
struct ListenTurn {
    session: Option<RecognizerSession>,
    /// Latest partial result
    partial: String,
    /// Finished speech, kept for file-based fallback while awaiting the final result
    segment: Option<SpeechSegment>,
    /// Button-mode recording
    recording: Vec<u8>,
    /// Final-result timeout, armed once speech ends
    deadline: Option<Pin<Box<Sleep>>>,
}

impl ListenTurn {
    const fn new() -> Self {
        Self {
            session: None,
            partial: String::new(),
            segment: None,
            recording: Vec::new(),
            deadline: None,
        }
    }
}

/// Data for the turn currently answering
struct AnswerTurn {
    question: String,
    reply: String,
    spoken: Vec<String>,
    sentencer: ResponseSentencer,
    sequencer: AudioPlaybackSequencer,
    chat_task: JoinHandle<()>,
    image: Option<PathBuf>,
}

impl AnswerTurn {
    fn cancel(self) {
        self.chat_task.abort();
        self.sequencer.stop();
    }
}

/// Delay before re-arming voice activation after the recorder is lost
const CAPTURE_RETRY: Duration = Duration::from_secs(2);

/// Owns one conversation: capture, recognition, reply, playback
pub struct ConversationController {
    settings: ControllerSettings,
    parts: Collaborators,
    streaming: bool,
    capture: Box<dyn CaptureDevice>,
    capture_rx: mpsc::Receiver<CaptureEvent>,
    vad: VoiceActivityDetector,
    state: State,
    bindings: TriggerBindings,
    turn: u64,
    events_tx: mpsc::UnboundedSender<TurnEvent>,
    events_rx: mpsc::UnboundedReceiver<TurnEvent>,
    listen: Option<ListenTurn>,
    answer: Option<AnswerTurn>,
    history: VecDeque<ChatMessage>,
    status: watch::Sender<Status>,
    /// Pending restart of a lost recorder while asleep
    capture_retry: Option<Pin<Box<Sleep>>>,
}

impl ConversationController {
    #[must_use]
    pub fn new(
        settings: ControllerSettings,
        parts: Collaborators,
        capture: Box<dyn CaptureDevice>,
        capture_rx: mpsc::Receiver<CaptureEvent>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(Status {
            state: State::Sleep,
            turn: 0,
        });
        let streaming = parts.recognizer.is_available();
        if !streaming {
            tracing::info!("streaming recognizer unavailable, using file-based recognition");
        }

        Self {
            vad: VoiceActivityDetector::new(settings.vad.clone()),
            settings,
            parts,
            streaming,
            capture,
            capture_rx,
            state: State::Sleep,
            bindings: TriggerBindings::for_state(State::Sleep),
            turn: 0,
            events_tx,
            events_rx,
            listen: None,
            answer: None,
            history: VecDeque::new(),
            status,
            capture_retry: None,
        }
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub const fn turn(&self) -> u64 {
        self.turn
    }

    /// Run until `shutdown` resolves
    pub async fn run<F>(mut self, mut triggers: mpsc::Receiver<TriggerEvent>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        self.enter_sleep();

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(trigger) = triggers.recv() => self.on_trigger(trigger),
                Some(event) = self.capture_rx.recv() => self.on_capture(event),
                Some(event) = self.events_rx.recv() => self.on_event(event),
                () = recognition_deadline(self.listen.as_mut()) => self.on_recognition_timeout(),
                () = pending_deadline(self.capture_retry.as_mut()) => self.on_capture_retry(),
            }
        }

        tracing::info!("conversation stopped");
        self.listen = None;
        self.cancel_answer();
        self.capture.stop();
    }

    fn enter(&mut self, state: State) {
        let previous = self.state;
        self.state = state;
        self.bindings = TriggerBindings::for_state(state);

        tracing::info!(turn = self.turn, from = %previous, to = %state, "state transition");
        self.parts.display.display(state.display_update());
        self.status.send_replace(Status {
            state,
            turn: self.turn,
        });
    }

    fn enter_sleep(&mut self) {
        self.listen = None;
        self.cancel_answer();
        self.capture_retry = None;
        self.enter(State::Sleep);

        if self.settings.vad.enabled {
            self.vad.reset();
            if let Err(e) = self.capture.start() {
                tracing::warn!(error = %e, "voice activity detection unavailable");
                self.schedule_capture_retry();
            }
        } else {
            self.capture.stop();
        }
    }

    const fn next_turn(&mut self) -> u64 {
        self.turn += 1;
        self.turn
    }

    fn cancel_answer(&mut self) {
        if let Some(answer) = self.answer.take() {
            answer.cancel();
        }
    }

    fn on_trigger(&mut self, trigger: TriggerEvent) {
        let Some(action) = self.bindings.action(trigger) else {
            tracing::debug!(?trigger, state = %self.state, "trigger ignored");
            return;
        };
        tracing::debug!(?trigger, ?action, state = %self.state, "trigger");

        match action {
            TriggerAction::StartListening | TriggerAction::RestartListening => {
                self.start_listening(ListenMode::Button, None);
            }
            TriggerAction::FinishRecording => self.finish_recording(),
            TriggerAction::BargeIn => {
                tracing::info!(turn = self.turn, "barge-in");
                self.cancel_answer();
                self.start_listening(ListenMode::Button, None);
            }
            TriggerAction::Dismiss => {
                tracing::info!(turn = self.turn, "reply dismissed");
                self.enter_sleep();
            }
            TriggerAction::Clear => self.enter_sleep(),
        }
    }

    fn start_listening(&mut self, mode: ListenMode, first_chunk: Option<&[u8]>) {
        self.listen = None;
        self.cancel_answer();
        let turn = self.next_turn();
        let mut listen = ListenTurn::new();

        match mode {
            ListenMode::Vad => {
                if self.streaming {
                    let (session, events) = self.parts.recognizer.start_session();
                    self.forward_recognizer(turn, events);
                    if let Some(chunk) = first_chunk {
                        session.send(chunk);
                    }
                    listen.session = Some(session);
                }
            }
            ListenMode::Button => {
                self.vad.reset();
                if let Err(e) = self.capture.start() {
                    tracing::warn!(turn, error = %e, "cannot record");
                    self.enter_sleep();
                    return;
                }
            }
        }

        self.listen = Some(listen);
        self.enter(State::Listening(mode));
    }

    fn forward_recognizer(&self, turn: u64, mut events: mpsc::UnboundedReceiver<RecognizerEvent>) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let kind = EventKind::Recognizer(event);
                if tx.send(TurnEvent { turn, kind }).is_err() {
                    break;
                }
            }
        });
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Data(chunk) => self.on_audio(&chunk),
            CaptureEvent::Error(e) => {
                tracing::warn!(error = %e, state = %self.state, "capture device failed");
                self.on_capture_lost();
            }
            CaptureEvent::Exited => {
                tracing::info!(state = %self.state, "capture process exited");
                self.on_capture_lost();
            }
        }
    }

    fn on_capture_lost(&mut self) {
        self.capture.stop();
        match self.state {
            State::Listening(ListenMode::Button) => self.finish_recording(),
            State::Listening(ListenMode::Vad) => {
                let awaiting = self.listen.as_ref().is_some_and(|l| l.segment.is_some());
                if !awaiting {
                    self.listen = None;
                    self.enter(State::Sleep);
                    self.schedule_capture_retry();
                }
            }
            State::Sleep => self.schedule_capture_retry(),
            _ => {}
        }
    }

    /// Re-arm voice activation later rather than respawning a failing recorder at once
    fn schedule_capture_retry(&mut self) {
        if !self.settings.vad.enabled || self.capture_retry.is_some() {
            return;
        }
        tracing::debug!(delay = ?CAPTURE_RETRY, "voice activation re-arm scheduled");
        self.capture_retry = Some(Box::pin(tokio::time::sleep(CAPTURE_RETRY)));
    }

    fn on_capture_retry(&mut self) {
        self.capture_retry = None;
        if self.state == State::Sleep {
            tracing::info!("re-arming voice activation");
            self.enter_sleep();
        }
    }

    fn on_audio(&mut self, chunk: &[u8]) {
        match self.state {
            State::Sleep if self.settings.vad.enabled => {
                if let Some(VadEvent::SpeechStart) = self.vad.process(chunk) {
                    self.start_listening(ListenMode::Vad, Some(chunk));
                }
            }
            State::Listening(ListenMode::Vad) => {
                let Some(listen) = self.listen.as_mut() else {
                    return;
                };
                if listen.segment.is_some() {
                    return;
                }
                if let Some(session) = &listen.session {
                    session.send(chunk);
                }
                if let Some(VadEvent::SpeechEnd(segment)) = self.vad.process(chunk) {
                    self.end_speech(segment);
                }
            }
            State::Listening(ListenMode::Button) => {
                if let Some(listen) = self.listen.as_mut() {
                    listen.recording.extend_from_slice(chunk);
                }
            }
            _ => tracing::trace!(state = %self.state, bytes = chunk.len(), "audio ignored"),
        }
    }

    fn end_speech(&mut self, segment: SpeechSegment) {
        self.capture.stop();
        let turn = self.turn;
        let Some(listen) = self.listen.as_mut() else {
            return;
        };
        tracing::info!(turn, bytes = segment.len(), "speech ended");

        let connected = listen
            .session
            .as_ref()
            .is_some_and(RecognizerSession::is_connected);

        if connected {
            if let Some(session) = &listen.session {
                session.end();
            }
            listen.segment = Some(segment);
            listen.deadline = Some(Box::pin(tokio::time::sleep(self.settings.final_timeout)));
        } else {
            self.transcribe(segment.into_pcm());
        }
    }

    fn finish_recording(&mut self) {
        self.capture.stop();
        let pcm = self
            .listen
            .take()
            .map(|l| l.recording)
            .unwrap_or_default();
        tracing::info!(turn = self.turn, bytes = pcm.len(), "recording finished");
        self.transcribe(pcm);
    }

    /// File-based recognition of a complete recording
    fn transcribe(&mut self, pcm: Vec<u8>) {
        self.listen = None;
        if pcm.is_empty() {
            self.enter_sleep();
            return;
        }

        let wav = match pcm_to_wav(&pcm, self.settings.sample_rate, self.settings.channels) {
            Ok(wav) => wav,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode recording");
                self.enter_sleep();
                return;
            }
        };

        self.enter(State::Recognizing);

        let turn = self.turn;
        let transcriber = Arc::clone(&self.parts.transcriber);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = transcriber.transcribe(wav).await;
            let _ = tx.send(TurnEvent {
                turn,
                kind: EventKind::Transcribed(result),
            });
        });
    }

    fn on_event(&mut self, event: TurnEvent) {
        if event.turn != self.turn {
            tracing::debug!(
                event_turn = event.turn,
                turn = self.turn,
                "discarding stale event"
            );
            return;
        }

        match event.kind {
            EventKind::Recognizer(event) => self.on_recognizer(event),
            EventKind::Transcribed(result) => {
                if self.state != State::Recognizing {
                    return;
                }
                match result {
                    Ok(text) => self.resolve_recognition(text),
                    Err(e) => {
                        tracing::warn!(error = %e, "transcription failed");
                        self.enter_sleep();
                    }
                }
            }
            EventKind::Chat(event) => self.on_chat(event),
            EventKind::ChatEnded => self.on_chat_end(),
            EventKind::ChatFailed(e) => {
                tracing::warn!(error = %e, "chat failed");
                self.enter_sleep();
            }
            EventKind::PlaybackFinished => self.on_playback_finished(),
            EventKind::PlaybackFailed(e) => {
                if self.state == State::Answering {
                    tracing::warn!(error = %e, "audio output failed, abandoning reply");
                    self.enter_sleep();
                }
            }
        }
    }

    fn on_recognizer(&mut self, event: RecognizerEvent) {
        let Some(listen) = self.listen.as_mut() else {
            return;
        };

        match event {
            RecognizerEvent::Result(result) if result.is_final => {
                self.resolve_recognition(result.text);
            }
            RecognizerEvent::Result(result) => {
                tracing::debug!(partial = %result.text, "partial result");
                listen.partial.clone_from(&result.text);
                self.parts.display.display(DisplayUpdate::text(result.text));
            }
            RecognizerEvent::Error(e) => {
                tracing::warn!(error = %e, "streaming recognition disabled, falling back to file recognition");
                self.streaming = false;
                self.recognizer_lost();
            }
            RecognizerEvent::Closed => {
                tracing::debug!("recognizer closed before a final result");
                self.recognizer_lost();
            }
        }
    }

    fn recognizer_lost(&mut self) {
        let Some(listen) = self.listen.as_mut() else {
            return;
        };
        listen.session = None;
        listen.deadline = None;

        // Still capturing: speech end takes the file route
        if let Some(segment) = listen.segment.take() {
            self.transcribe(segment.into_pcm());
        }
    }

    fn on_recognition_timeout(&mut self) {
        let Some(listen) = self.listen.as_mut() else {
            return;
        };
        listen.deadline = None;
        let partial = std::mem::take(&mut listen.partial);
        tracing::info!(turn = self.turn, partial = %partial, "no final result, using partial");
        self.resolve_recognition(partial);
    }

    fn resolve_recognition(&mut self, text: String) {
        // Drops the session and its timeout
        self.listen = None;

        let text = text.trim().to_string();
        if text.is_empty() {
            tracing::info!(turn = self.turn, "nothing recognized");
            self.enter_sleep();
            return;
        }

        tracing::info!(turn = self.turn, text = %text, "recognized");
        if self.state != State::Recognizing {
            self.enter(State::Recognizing);
        }
        self.start_answering(text);
    }

    fn start_answering(&mut self, question: String) {
        // Release the input before any output
        self.capture.stop();
        self.enter(State::Answering);
        self.parts.display.display(DisplayUpdate::text(question.clone()));

        let turn = self.turn;
        let queue = PlaybackQueue::new();
        let sentencer = ResponseSentencer::new(
            &self.settings.sentencer,
            Arc::clone(&self.parts.synthesizer),
            queue.clone(),
        );
        let (sequencer, finished) = AudioPlaybackSequencer::spawn(
            queue,
            Arc::clone(&self.parts.output),
            self.settings.poll_backoff,
        );

        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let kind = match finished.await {
                Ok(PlaybackOutcome::Completed) => EventKind::PlaybackFinished,
                Ok(PlaybackOutcome::Failed(e)) => EventKind::PlaybackFailed(e),
                // Stopped by the controller itself
                Ok(PlaybackOutcome::Stopped) | Err(_) => return,
            };
            let _ = tx.send(TurnEvent { turn, kind });
        });

        let messages = self.build_messages(&question);
        let chat = Arc::clone(&self.parts.chat);
        let tx = self.events_tx.clone();
        let chat_task = tokio::spawn(async move {
            let (chat_tx, mut chat_rx) = mpsc::unbounded_channel();
            let mut stream = chat.stream_chat(messages, chat_tx);

            let result = loop {
                tokio::select! {
                    biased;
                    Some(event) = chat_rx.recv() => {
                        let _ = tx.send(TurnEvent { turn, kind: EventKind::Chat(event) });
                    }
                    result = &mut stream => break result,
                }
            };
            while let Ok(event) = chat_rx.try_recv() {
                let _ = tx.send(TurnEvent {
                    turn,
                    kind: EventKind::Chat(event),
                });
            }

            let kind = match result {
                Ok(()) => EventKind::ChatEnded,
                Err(e) => EventKind::ChatFailed(e.to_string()),
            };
            let _ = tx.send(TurnEvent { turn, kind });
        });

        self.answer = Some(AnswerTurn {
            question,
            reply: String::new(),
            spoken: Vec::new(),
            sentencer,
            sequencer,
            chat_task,
            image: None,
        });
    }

    fn build_messages(&self, question: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if !self.settings.system_prompt.is_empty() {
            messages.push(ChatMessage::system(&self.settings.system_prompt));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(question));
        messages
    }

    fn on_chat(&mut self, event: ChatEvent) {
        let Some(answer) = self.answer.as_mut() else {
            return;
        };

        match event {
            ChatEvent::Text(fragment) => {
                answer.reply.push_str(&fragment);
                let sentences = answer.sentencer.push(&fragment);
                show_sentences(answer, &sentences, self.parts.display.as_ref());
            }
            ChatEvent::Thinking(thinking) => {
                tracing::trace!(thinking = %thinking, "model thinking");
            }
            ChatEvent::ToolInvoked { name, artifact } => {
                tracing::info!(tool = %name, artifact = ?artifact, "tool invoked");
                if artifact.is_some() {
                    answer.image = artifact;
                }
            }
        }
    }

    fn on_chat_end(&mut self) {
        let Some(answer) = self.answer.as_mut() else {
            return;
        };

        let sentences = answer.sentencer.finish();
        show_sentences(answer, &sentences, self.parts.display.as_ref());
        tracing::debug!(
            turn = self.turn,
            sentences = answer.sentencer.dispatched(),
            "reply complete"
        );

        let reply = answer.reply.trim().to_string();
        if reply.is_empty() {
            tracing::info!(turn = self.turn, "empty reply");
            return;
        }

        let question = answer.question.clone();
        self.remember(question, reply);
    }

    fn remember(&mut self, question: String, reply: String) {
        self.history.push_back(ChatMessage::user(question));
        self.history.push_back(ChatMessage::assistant(reply));
        while self.history.len() > self.settings.history_turns * 2 {
            self.history.pop_front();
        }
    }

    fn on_playback_finished(&mut self) {
        if self.state != State::Answering {
            return;
        }
        let Some(answer) = self.answer.take() else {
            return;
        };
        answer.chat_task.abort();

        match answer.image {
            Some(path) => {
                self.enter(State::ShowingImage);
                self.parts
                    .display
                    .display(DisplayUpdate::text(path.display().to_string()));
            }
            None => self.enter_sleep(),
        }
    }
}

fn show_sentences(answer: &mut AnswerTurn, sentences: &[Sentence], display: &dyn DisplaySink) {
    if sentences.is_empty() {
        return;
    }
    answer
        .spoken
        .extend(sentences.iter().map(|s| s.text.clone()));
    display.display(DisplayUpdate::text(answer.spoken.join(" ")));
}

async fn recognition_deadline(listen: Option<&mut ListenTurn>) {
    pending_deadline(listen.and_then(|l| l.deadline.as_mut())).await;
}

/// Resolves when `deadline` elapses; never resolves without one
async fn pending_deadline(deadline: Option<&mut Pin<Box<Sleep>>>) {
    match deadline {
        Some(deadline) => deadline.as_mut().await,
        None => std::future::pending().await,
    }
}
