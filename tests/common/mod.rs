//! Shared test utilities: fake collaborators and a scripted recognizer server

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;

use parley::chat::{ChatEvent, ChatMessage, ChatModel};
use parley::config::{RecognizerConfig, SentencerConfig, VadConfig};
use parley::conversation::{Collaborators, ControllerSettings, ConversationController, State, Status};
use parley::display::{DisplaySink, DisplayUpdate};
use parley::recognizer::protocol::{
    self, Compression, Frame, Header, MessageType, Serialization, flags,
};
use parley::recognizer::{RecognizerEvent, RecognizerSession, SpeechRecognizer, StreamingRecognizer};
use parley::trigger::TriggerEvent;
use parley::voice::{
    AudioOutput, AudioSource, CaptureDevice, CaptureEvent, SynthesizedAudio, Synthesizer,
    Transcriber,
};
use parley::{Error, Result};

pub const SAMPLE_RATE: u32 = 16_000;

/// 100 ms of 16-bit mono PCM at a constant amplitude
#[must_use]
pub fn pcm_chunk(amplitude: i16) -> Vec<u8> {
    let samples = SAMPLE_RATE as usize / 10;
    amplitude
        .to_le_bytes()
        .into_iter()
        .cycle()
        .take(samples * 2)
        .collect()
}

#[must_use]
pub fn loud() -> Vec<u8> {
    pcm_chunk(5000)
}

#[must_use]
pub fn quiet() -> Vec<u8> {
    pcm_chunk(0)
}

/// Let every task run until the runtime is idle
///
/// Under a paused clock the sleep only completes once nothing else can make
/// progress.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Ordered record of what the fakes did, shared between them
#[derive(Debug, Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    #[must_use]
    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == entry)
    }

    #[must_use]
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }

    /// Wait (in virtual time) until `entry` has been recorded
    pub async fn wait_for(&self, entry: &str) {
        for _ in 0..10_000 {
            if self.contains(entry) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("'{entry}' never recorded; log: {:?}", self.entries());
    }
}

/// Capture device whose audio is injected by the test
#[derive(Debug, Clone, Default)]
pub struct FakeCapture {
    running: Arc<AtomicBool>,
    starts: Arc<AtomicUsize>,
}

impl FakeCapture {
    #[must_use]
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for FakeCapture {
    fn start(&mut self) -> Result<()> {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running()
    }
}

/// Transcriber that always hears the same words
#[derive(Debug, Clone)]
pub struct FakeTranscriber {
    text: String,
    calls: Arc<AtomicUsize>,
}

impl FakeTranscriber {
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: Arc::default(),
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        assert_eq!(&wav[..4], b"RIFF");
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(self.text.clone())
    }
}

/// Synthesizer that records `synth:<text>` and returns the text as audio
#[derive(Debug, Clone)]
pub struct FakeSynth {
    log: Log,
}

impl FakeSynth {
    #[must_use]
    pub const fn new(log: Log) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Synthesizer for FakeSynth {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        self.log.push(format!("synth:{text}"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(SynthesizedAudio {
            source: AudioSource::Data(text.as_bytes().to_vec()),
            duration_ms: 3000,
        })
    }
}

/// Output that records `play:<text>`, `done:<text>`, and `stop`
#[derive(Debug, Clone)]
pub struct FakeOutput {
    log: Log,
    unplugged: bool,
}

impl FakeOutput {
    #[must_use]
    pub const fn new(log: Log) -> Self {
        Self {
            log,
            unplugged: false,
        }
    }

    /// Every play attempt fails after logging `play:<text>`
    #[must_use]
    pub const fn unplugged(log: Log) -> Self {
        Self {
            log,
            unplugged: true,
        }
    }
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn play(&self, audio: &SynthesizedAudio) -> Result<()> {
        let AudioSource::Data(data) = &audio.source else {
            return Err(Error::Device("expected in-memory audio".to_string()));
        };
        let text = String::from_utf8_lossy(data).into_owned();
        self.log.push(format!("play:{text}"));
        if self.unplugged {
            return Err(Error::Device("speaker unplugged".to_string()));
        }
        tokio::time::sleep(Duration::from_millis(audio.duration_ms)).await;
        self.log.push(format!("done:{text}"));
        Ok(())
    }

    fn stop(&self) {
        self.log.push("stop");
    }
}

/// Chat model that streams scripted events and records every request
#[derive(Debug, Clone, Default)]
pub struct FakeChat {
    events: Vec<ChatEvent>,
    delay: Duration,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl FakeChat {
    /// Reply with `fragments`, one every `delay`
    #[must_use]
    pub fn replying(fragments: &[&str], delay: Duration) -> Self {
        Self {
            events: fragments
                .iter()
                .map(|f| ChatEvent::Text((*f).to_string()))
                .collect(),
            delay,
            requests: Arc::default(),
        }
    }

    /// Add an image-producing tool call before the reply
    #[must_use]
    pub fn with_image(mut self, path: &str) -> Self {
        self.events.insert(
            0,
            ChatEvent::ToolInvoked {
                name: "generate_image".to_string(),
                artifact: Some(PathBuf::from(path)),
            },
        );
        self
    }

    #[must_use]
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    /// Content of the final user message of each request
    #[must_use]
    pub fn questions(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|messages| messages.last().map(|m| m.content.clone()))
            .collect()
    }

    pub async fn wait_for_requests(&self, count: usize) {
        for _ in 0..10_000 {
            if self.requests.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("chat never received {count} requests");
    }
}

#[async_trait]
impl ChatModel for FakeChat {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<()> {
        self.requests.lock().unwrap().push(messages);
        for event in &self.events {
            tokio::time::sleep(self.delay).await;
            if events.send(event.clone()).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Display that keeps every update
#[derive(Debug, Clone, Default)]
pub struct RecordingDisplay {
    updates: Arc<Mutex<Vec<DisplayUpdate>>>,
}

impl RecordingDisplay {
    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter_map(|u| u.text.clone())
            .collect()
    }
}

impl DisplaySink for RecordingDisplay {
    fn display(&self, update: DisplayUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

/// What the scripted server sends back
#[derive(Debug, Clone)]
pub enum Reply {
    Partial(String),
    Final(String),
    Error(u32, String),
    Close,
}

/// Recognizer config with fake credentials and a short flush period
#[must_use]
pub fn recognizer_config() -> RecognizerConfig {
    RecognizerConfig {
        app_id: Some("test-app".to_string()),
        token: Some("test-token".to_string().into()),
        flush_interval: Duration::from_millis(100),
        ..RecognizerConfig::default()
    }
}

/// Open a client session over an in-memory socket, returning the server end
#[must_use]
pub fn attach_pair(
    config: RecognizerConfig,
) -> (
    RecognizerSession,
    mpsc::UnboundedReceiver<RecognizerEvent>,
    DuplexStream,
) {
    let (client, server) = tokio::io::duplex(1 << 16);
    let recognizer = StreamingRecognizer::new(config, SAMPLE_RATE, 1);
    let (session, events) = recognizer.attach(client);
    (session, events, server)
}

/// Accept the server side of an in-memory WebSocket
pub async fn accept(socket: DuplexStream) -> WebSocketStream<DuplexStream> {
    WebSocketStream::from_raw_socket(socket, Role::Server, None).await
}

/// Next binary frame from the client, decoded; `None` once the client closes
pub async fn next_frame(ws: &mut WebSocketStream<DuplexStream>) -> Option<Frame> {
    while let Some(message) = ws.next().await {
        match message.ok()? {
            Message::Binary(data) => return Some(protocol::decode(&data).unwrap()),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// A gzipped full-server-response frame carrying one result
#[must_use]
pub fn response_frame(text: &str, definite: Option<bool>, sequence: i32, last: bool) -> Vec<u8> {
    let mut item = serde_json::json!({ "text": text });
    if let Some(definite) = definite {
        item["definite"] = definite.into();
    }
    let body = serde_json::json!({
        "reqid": "test",
        "code": 1000,
        "message": "Success",
        "sequence": sequence,
        "result": [item],
    });

    let header = Header::new(
        MessageType::FullServerResponse,
        flags::SEQUENCE | if last { flags::LAST } else { flags::NONE },
        Serialization::Json,
        Compression::Gzip,
    );
    let payload = gzip(&serde_json::to_vec(&body).unwrap());

    let mut frame = header.to_bytes().to_vec();
    frame.extend_from_slice(&sequence.to_be_bytes());
    frame.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// A server-error frame
#[must_use]
pub fn error_frame(code: u32, message: &str) -> Vec<u8> {
    let header = Header::new(
        MessageType::ServerError,
        flags::NONE,
        Serialization::None,
        Compression::None,
    );
    let mut frame = header.to_bytes().to_vec();
    frame.extend_from_slice(&code.to_be_bytes());
    frame.extend_from_slice(&u32::try_from(message.len()).unwrap().to_be_bytes());
    frame.extend_from_slice(message.as_bytes());
    frame
}

/// Send one reply; false once the connection is gone
pub async fn send_reply(
    ws: &mut WebSocketStream<DuplexStream>,
    reply: &Reply,
    sequence: &mut i32,
) -> bool {
    *sequence += 1;
    let message = match reply {
        Reply::Partial(text) => Message::binary(response_frame(text, Some(false), *sequence, false)),
        Reply::Final(text) => Message::binary(response_frame(text, Some(true), -*sequence, true)),
        Reply::Error(code, message) => Message::binary(error_frame(*code, message)),
        Reply::Close => Message::Close(None),
    };
    ws.send(message).await.is_ok()
}

/// Recognizer whose sessions talk to an in-process scripted server
///
/// The server answers the first non-terminal audio frames with `on_audio`
/// (one reply per frame, in order) and the terminal frame with `on_last`.
#[derive(Debug, Clone)]
pub struct ScriptedRecognizer {
    on_audio: Vec<Reply>,
    on_last: Vec<Reply>,
    sessions: Arc<AtomicUsize>,
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl ScriptedRecognizer {
    #[must_use]
    pub fn new(on_audio: Vec<Reply>, on_last: Vec<Reply>) -> Self {
        Self {
            on_audio,
            on_last,
            sessions: Arc::default(),
            frames: Arc::default(),
        }
    }

    #[must_use]
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    async fn serve(self, socket: DuplexStream) {
        let mut ws = accept(socket).await;
        let mut audio_replies = self.on_audio.iter();
        let mut sequence = 0;

        while let Some(frame) = next_frame(&mut ws).await {
            let message_type = frame.header.message_type;
            let last = frame.header.is_last();
            self.frames.lock().unwrap().push(frame);

            if message_type != MessageType::AudioOnly {
                continue;
            }
            if last {
                for reply in &self.on_last {
                    if !send_reply(&mut ws, reply, &mut sequence).await {
                        return;
                    }
                }
            } else if let Some(reply) = audio_replies.next() {
                if !send_reply(&mut ws, reply, &mut sequence).await {
                    return;
                }
            }
        }
    }
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn is_available(&self) -> bool {
        true
    }

    fn start_session(&self) -> (RecognizerSession, mpsc::UnboundedReceiver<RecognizerEvent>) {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        let (session, events, server) = attach_pair(recognizer_config());
        tokio::spawn(self.clone().serve(server));
        (session, events)
    }
}

/// Controller settings for tests: one sentence per synthesis job
#[must_use]
pub fn settings(vad_enabled: bool) -> ControllerSettings {
    ControllerSettings {
        vad: VadConfig {
            enabled: vad_enabled,
            energy_threshold: 1000.0,
            min_speech: Duration::from_millis(200),
            min_silence: Duration::from_millis(500),
        },
        sample_rate: SAMPLE_RATE,
        channels: 1,
        final_timeout: Duration::from_secs(2),
        poll_backoff: Duration::from_millis(200),
        sentencer: SentencerConfig { merge_chars: 1 },
        system_prompt: "You are a voice assistant.".to_string(),
        history_turns: 5,
    }
}

/// A running controller wired to fakes
pub struct Harness {
    pub triggers: mpsc::Sender<TriggerEvent>,
    pub audio: mpsc::Sender<CaptureEvent>,
    pub status: watch::Receiver<Status>,
    pub log: Log,
    pub chat: FakeChat,
    pub transcriber: FakeTranscriber,
    pub display: RecordingDisplay,
    pub capture: FakeCapture,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Harness {
    pub fn spawn(
        settings: ControllerSettings,
        recognizer: Arc<dyn SpeechRecognizer>,
        transcriber: FakeTranscriber,
        chat: FakeChat,
    ) -> Self {
        Self::spawn_with_output(settings, recognizer, transcriber, chat, FakeOutput::new)
    }

    pub fn spawn_with_output(
        settings: ControllerSettings,
        recognizer: Arc<dyn SpeechRecognizer>,
        transcriber: FakeTranscriber,
        chat: FakeChat,
        output: fn(Log) -> FakeOutput,
    ) -> Self {
        let log = Log::default();
        let display = RecordingDisplay::default();
        let capture = FakeCapture::default();
        let (audio, capture_rx) = mpsc::channel(64);
        let (triggers, triggers_rx) = mpsc::channel(16);
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let controller = ConversationController::new(
            settings,
            Collaborators {
                recognizer,
                transcriber: Arc::new(transcriber.clone()),
                synthesizer: Arc::new(FakeSynth::new(log.clone())),
                chat: Arc::new(chat.clone()),
                output: Arc::new(output(log.clone())),
                display: Arc::new(display.clone()),
            },
            Box::new(capture.clone()),
            capture_rx,
        );
        let status = controller.subscribe();
        let task = tokio::spawn(controller.run(triggers_rx, async {
            let _ = shutdown_rx.await;
        }));

        Self {
            triggers,
            audio,
            status,
            log,
            chat,
            transcriber,
            display,
            capture,
            shutdown: Some(shutdown),
            task,
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.status.borrow().state
    }

    #[must_use]
    pub fn turn(&self) -> u64 {
        self.status.borrow().turn
    }

    pub async fn trigger(&self, event: TriggerEvent) {
        self.triggers.send(event).await.unwrap();
        settle().await;
    }

    /// Feed one chunk and advance the clock by its duration
    pub async fn speak(&self, chunk: Vec<u8>) {
        self.audio.send(CaptureEvent::Data(chunk)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    pub async fn wait_for(&mut self, state: State) {
        let reached = tokio::time::timeout(
            Duration::from_secs(60),
            self.status.wait_for(|s| s.state == state),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(reached, "never reached {state}; stuck in {}", self.state());
    }

    /// Press, record one chunk, release
    pub async fn ask_by_button(&mut self) {
        self.trigger(TriggerEvent::Pressed).await;
        self.wait_for(State::Listening(parley::conversation::ListenMode::Button))
            .await;
        self.audio
            .send(CaptureEvent::Data(loud()))
            .await
            .unwrap();
        settle().await;
        self.trigger(TriggerEvent::Released).await;
    }

    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.await.unwrap();
    }
}
