//! Streaming recognition sessions over a WebSocket connection
//!
//! A [`RecognizerSession`] is a handle to a background task that owns the
//! connection. Audio handed to [`RecognizerSession::send`] is buffered and
//! flushed on a fixed tick; inbound frames are decoded into
//! [`RecognizerEvent`]s delivered on the receiver returned with the session.

use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Role;

use super::protocol::{
    self, AppInfo, AudioInfo, FullClientRequest, RecognitionResponse, RequestInfo, ServerMessage,
    UserInfo,
};
use crate::config::{MissingFinalFlag, RecognizerConfig};
use crate::{Error, Result};

/// One recognition hypothesis
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecognitionResult {
    pub text: String,
    /// A final result terminates the recognition turn
    pub is_final: bool,
}

/// Event emitted by a recognizer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Partial or final recognition result
    Result(RecognitionResult),
    /// Connection or server failure; the session is finished
    Error(String),
    /// The server closed the connection
    Closed,
}

enum Command {
    Audio(Vec<u8>),
    End,
    Close,
}

/// Opens recognition sessions
pub trait SpeechRecognizer: Send + Sync {
    /// Whether sessions will actually connect
    fn is_available(&self) -> bool;

    /// Open a new session and the receiver its events arrive on
    fn start_session(&self) -> (RecognizerSession, mpsc::UnboundedReceiver<RecognizerEvent>);
}

/// Factory for recognizer sessions over the binary WebSocket protocol
///
/// Without credentials every session is inert: nothing connects and
/// `send`/`end` return immediately.
#[derive(Debug)]
pub struct StreamingRecognizer {
    config: RecognizerConfig,
    sample_rate: u32,
    channels: u16,
}

impl StreamingRecognizer {
    #[must_use]
    pub const fn new(config: RecognizerConfig, sample_rate: u32, channels: u16) -> Self {
        Self {
            config,
            sample_rate,
            channels,
        }
    }

    /// Whether sessions will actually connect
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.config.has_credentials()
    }

    /// Build the session-opening request with a fresh request id
    #[must_use]
    pub fn session_request(&self) -> FullClientRequest {
        FullClientRequest {
            app: AppInfo {
                appid: self.config.app_id.clone().unwrap_or_default(),
                token: self
                    .config
                    .token
                    .as_ref()
                    .map(|t| t.expose_secret().to_string())
                    .unwrap_or_default(),
                cluster: self.config.cluster.clone(),
            },
            user: UserInfo {
                uid: self.config.uid.clone(),
            },
            request: RequestInfo {
                reqid: uuid::Uuid::new_v4().to_string(),
                nbest: 1,
                workflow: "audio_in,resample,partition,vad,fe,decode,itn,nlu_punctuate"
                    .to_string(),
                show_utterances: false,
                result_type: "full".to_string(),
                sequence: 1,
            },
            audio: AudioInfo {
                format: "raw".to_string(),
                codec: "raw".to_string(),
                rate: self.sample_rate,
                bits: 16,
                channel: self.channels,
                language: self.config.language.clone(),
            },
        }
    }

    /// Open a new session
    ///
    /// Connection happens in the background; failures arrive as
    /// [`RecognizerEvent::Error`].
    #[must_use]
    pub fn start_session(&self) -> (RecognizerSession, mpsc::UnboundedReceiver<RecognizerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        if !self.is_available() {
            tracing::debug!("recognizer credentials missing, session is inert");
            return (RecognizerSession::inert(), events_rx);
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let request = self.session_request();
        let url = self.config.url.clone();
        let token = self
            .config
            .token
            .as_ref()
            .map(|t| t.expose_secret().to_string())
            .unwrap_or_default();
        let options = self.options();

        let task = tokio::spawn(async move {
            let ws = match connect(&url, &token).await {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::warn!(error = %e, "recognizer connection failed");
                    let _ = events_tx.send(RecognizerEvent::Error(e.to_string()));
                    return;
                }
            };
            run(ws, request, options, commands_rx, events_tx).await;
        });

        (
            RecognizerSession {
                commands: Some(commands_tx),
                task: Some(task),
            },
            events_rx,
        )
    }

    /// Run a session over an already-connected transport
    ///
    /// The WebSocket handshake is assumed done; frames are exchanged directly
    /// on `socket`.
    #[must_use]
    pub fn attach<S>(&self, socket: S) -> (RecognizerSession, mpsc::UnboundedReceiver<RecognizerEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let request = self.session_request();
        let options = self.options();

        let task = tokio::spawn(async move {
            let ws = WebSocketStream::from_raw_socket(socket, Role::Client, None).await;
            run(ws, request, options, commands_rx, events_tx).await;
        });

        (
            RecognizerSession {
                commands: Some(commands_tx),
                task: Some(task),
            },
            events_rx,
        )
    }

    const fn options(&self) -> SessionOptions {
        SessionOptions {
            flush_interval: self.config.flush_interval,
            missing_final_flag: self.config.missing_final_flag,
        }
    }
}

impl SpeechRecognizer for StreamingRecognizer {
    fn is_available(&self) -> bool {
        Self::is_available(self)
    }

    fn start_session(&self) -> (RecognizerSession, mpsc::UnboundedReceiver<RecognizerEvent>) {
        Self::start_session(self)
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionOptions {
    flush_interval: std::time::Duration,
    missing_final_flag: MissingFinalFlag,
}

/// Handle to one recognition session
///
/// Dropping the handle closes the connection.
#[derive(Debug)]
pub struct RecognizerSession {
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio(data) => write!(f, "Audio({} bytes)", data.len()),
            Self::End => f.write_str("End"),
            Self::Close => f.write_str("Close"),
        }
    }
}

impl RecognizerSession {
    const fn inert() -> Self {
        Self {
            commands: None,
            task: None,
        }
    }

    /// Whether this session has a live connection task
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.commands.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Queue audio for the next flush; never blocks
    pub fn send(&self, audio: &[u8]) {
        if let Some(tx) = &self.commands {
            let _ = tx.send(Command::Audio(audio.to_vec()));
        }
    }

    /// Flush buffered audio as the terminal frame; the connection stays open
    pub fn end(&self) {
        if let Some(tx) = &self.commands {
            let _ = tx.send(Command::End);
        }
    }

    /// Cancel the flush timer and close the connection
    pub fn close(&mut self) {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(Command::Close);
        }
        // The task exits on its own after closing the socket
        self.task.take();
    }
}

impl Drop for RecognizerSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn connect(
    url: &str,
    token: &str,
) -> Result<WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>> {
    let mut request = url.into_client_request()?;
    let auth = HeaderValue::from_str(&format!("Bearer; {token}"))
        .map_err(|e| Error::Recognizer(format!("invalid token header: {e}")))?;
    request.headers_mut().insert("Authorization", auth);

    let (ws, response) = tokio_tungstenite::connect_async(request).await?;
    tracing::debug!(status = %response.status(), "recognizer connected");
    Ok(ws)
}

async fn run<S>(
    ws: WebSocketStream<S>,
    request: FullClientRequest,
    options: SessionOptions,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<RecognizerEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let reqid = request.request.reqid.clone();

    let opening = match protocol::encode_full_client_request(&request) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = events.send(RecognizerEvent::Error(e.to_string()));
            return;
        }
    };
    if let Err(e) = sink.send(Message::binary(opening)).await {
        tracing::warn!(error = %e, "failed to send recognizer request");
        let _ = events.send(RecognizerEvent::Error(e.to_string()));
        return;
    }
    tracing::debug!(reqid = %reqid, "recognizer session opened");

    let mut ticker = tokio::time::interval(options.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    let mut buffer: Vec<u8> = Vec::new();
    let mut ended = false;

    loop {
        tokio::select! {
            _ = ticker.tick(), if !ended => {
                if buffer.is_empty() {
                    continue;
                }
                let audio = std::mem::take(&mut buffer);
                tracing::trace!(bytes = audio.len(), "flushing audio");
                if let Err(e) = send_audio(&mut sink, &audio, false).await {
                    let _ = events.send(RecognizerEvent::Error(e.to_string()));
                    break;
                }
            }
            command = commands.recv() => match command {
                Some(Command::Audio(data)) => {
                    if ended {
                        tracing::trace!(bytes = data.len(), "audio after end dropped");
                    } else {
                        buffer.extend_from_slice(&data);
                    }
                }
                Some(Command::End) => {
                    if ended {
                        continue;
                    }
                    ended = true;
                    let audio = std::mem::take(&mut buffer);
                    tracing::debug!(bytes = audio.len(), "sending terminal audio frame");
                    if let Err(e) = send_audio(&mut sink, &audio, true).await {
                        let _ = events.send(RecognizerEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = sink.close().await;
                    tracing::debug!(reqid = %reqid, "recognizer session closed");
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => match handle_frame(&data, options.missing_final_flag) {
                    Ok(Some(result)) => {
                        tracing::debug!(text = %result.text, is_final = result.is_final, "recognition result");
                        let _ = events.send(RecognizerEvent::Result(result));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "recognizer error");
                        let _ = events.send(RecognizerEvent::Error(e.to_string()));
                        break;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "recognizer closed connection");
                    let _ = events.send(RecognizerEvent::Closed);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "recognizer connection error");
                    let _ = events.send(RecognizerEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    let _ = events.send(RecognizerEvent::Closed);
                    break;
                }
            },
        }
    }
}

async fn send_audio<K>(sink: &mut K, audio: &[u8], last: bool) -> Result<()>
where
    K: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let frame = protocol::encode_audio(audio, last)?;
    sink.send(Message::binary(frame)).await?;
    Ok(())
}

/// Decode one inbound frame into a result, if it carries one
fn handle_frame(data: &[u8], policy: MissingFinalFlag) -> Result<Option<RecognitionResult>> {
    match ServerMessage::decode(data)? {
        ServerMessage::Response { last, body } => interpret(&body, last, policy),
        ServerMessage::Ack { sequence, body } => {
            tracing::trace!(sequence, "recognizer ack");
            match body {
                Some(body) if !body.result.is_empty() => interpret(&body, false, policy),
                _ => Ok(None),
            }
        }
        ServerMessage::Error { code, message } => Err(Error::Recognizer(format!(
            "server error {code}: {message}"
        ))),
    }
}

fn interpret(
    body: &RecognitionResponse,
    last: bool,
    policy: MissingFinalFlag,
) -> Result<Option<RecognitionResult>> {
    if body.is_error() {
        return Err(Error::Recognizer(format!(
            "recognition failed ({}): {}",
            body.code, body.message
        )));
    }

    let Some(first) = body.result.first() else {
        return Ok(None);
    };

    let is_final = last
        || first.is_final.unwrap_or(match policy {
            MissingFinalFlag::Final => true,
            MissingFinalFlag::Partial => false,
        });

    Ok(Some(RecognitionResult {
        text: first.text.trim().to_string(),
        is_final,
    }))
}
