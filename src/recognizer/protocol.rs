//! Binary frame codec for the streaming recognizer
//!
//! ```text
//! Header (4 bytes): [ (header_words<<4 | version), (message_type<<4 | flags),
//!                     (serialization<<4 | compression), reserved ]
//! Payload length (4 bytes, big-endian u32)
//! Payload (compressed per `compression`, serialized per `serialization`)
//! ```
//!
//! Server acks carry a 4-byte sequence number before an optional length-prefixed
//! body; server errors carry a 4-byte code before a length-prefixed message.

use std::io::{Read, Write};

use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size in 4-byte words
pub const HEADER_WORDS: u8 = 0b0001;

/// Header flag bits (low nibble of byte 1)
pub mod flags {
    /// No flags
    pub const NONE: u8 = 0b0000;
    /// A 4-byte sequence number precedes the payload length
    pub const SEQUENCE: u8 = 0b0001;
    /// Terminal packet of the session
    pub const LAST: u8 = 0b0010;
}

/// Message type (high nibble of byte 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Session-opening request with app credentials and audio format
    FullClientRequest,
    /// Buffered audio
    AudioOnly,
    /// Recognition results
    FullServerResponse,
    /// Acknowledgement of an audio frame
    ServerAck,
    /// Server-side failure
    ServerError,
}

impl MessageType {
    const fn bits(self) -> u8 {
        match self {
            Self::FullClientRequest => 0b0001,
            Self::AudioOnly => 0b0010,
            Self::FullServerResponse => 0b1001,
            Self::ServerAck => 0b1011,
            Self::ServerError => 0b1111,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0b0001 => Ok(Self::FullClientRequest),
            0b0010 => Ok(Self::AudioOnly),
            0b1001 => Ok(Self::FullServerResponse),
            0b1011 => Ok(Self::ServerAck),
            0b1111 => Ok(Self::ServerError),
            other => Err(Error::Protocol(format!("unknown message type {other:#06b}"))),
        }
    }
}

/// Payload serialization (high nibble of byte 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    /// Raw bytes
    None,
    /// JSON text
    Json,
}

impl Serialization {
    const fn bits(self) -> u8 {
        match self {
            Self::None => 0b0000,
            Self::Json => 0b0001,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0b0000 => Ok(Self::None),
            0b0001 => Ok(Self::Json),
            other => Err(Error::Protocol(format!("unsupported serialization {other:#06b}"))),
        }
    }
}

/// Payload compression (low nibble of byte 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Uncompressed
    None,
    /// Gzip
    Gzip,
}

impl Compression {
    const fn bits(self) -> u8 {
        match self {
            Self::None => 0b0000,
            Self::Gzip => 0b0001,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0b0000 => Ok(Self::None),
            0b0001 => Ok(Self::Gzip),
            other => Err(Error::Protocol(format!("unsupported compression {other:#06b}"))),
        }
    }
}

/// Decoded 4-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub header_words: u8,
    pub message_type: MessageType,
    pub flags: u8,
    pub serialization: Serialization,
    pub compression: Compression,
}

impl Header {
    #[must_use]
    pub const fn new(
        message_type: MessageType,
        flags: u8,
        serialization: Serialization,
        compression: Compression,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            header_words: HEADER_WORDS,
            message_type,
            flags,
            serialization,
            compression,
        }
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; 4] {
        [
            (self.header_words << 4) | (self.version & 0x0f),
            (self.message_type.bits() << 4) | (self.flags & 0x0f),
            (self.serialization.bits() << 4) | self.compression.bits(),
            0,
        ]
    }

    /// Parse the first four bytes of a frame
    ///
    /// # Errors
    ///
    /// Returns error on short input or unknown field values
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let [b0, b1, b2, _reserved] = *bytes
            .get(..4)
            .and_then(|h| <&[u8; 4]>::try_from(h).ok())
            .ok_or_else(|| Error::Protocol(format!("frame too short: {} bytes", bytes.len())))?;

        let header_words = b0 >> 4;
        if header_words == 0 {
            return Err(Error::Protocol("header size of zero words".to_string()));
        }

        Ok(Self {
            version: b0 & 0x0f,
            header_words,
            message_type: MessageType::from_bits(b1 >> 4)?,
            flags: b1 & 0x0f,
            serialization: Serialization::from_bits(b2 >> 4)?,
            compression: Compression::from_bits(b2 & 0x0f)?,
        })
    }

    /// Whether this frame is the terminal packet of the session
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.flags & flags::LAST != 0
    }

    const fn len(&self) -> usize {
        self.header_words as usize * 4
    }
}

/// A decoded frame with its payload decompressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    /// Sequence number (acks, or frames flagged with `SEQUENCE`)
    pub sequence: Option<i32>,
    /// Error code (server errors only)
    pub code: Option<u32>,
    /// Decompressed payload, still serialized
    pub payload: Vec<u8>,
}

impl Frame {
    /// Deserialize a JSON payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not JSON or does not match `T`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.header.serialization != Serialization::Json {
            return Err(Error::Protocol("payload is not JSON".to_string()));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Encode the session-opening request frame
///
/// # Errors
///
/// Returns error if serialization or compression fails
pub fn encode_full_client_request<T: Serialize>(request: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(request)?;
    let header = Header::new(
        MessageType::FullClientRequest,
        flags::NONE,
        Serialization::Json,
        Compression::Gzip,
    );
    Ok(encode(header, &gzip(&json)?))
}

/// Encode an audio-only frame; `last` marks the terminal chunk of the session
///
/// # Errors
///
/// Returns error if compression fails
pub fn encode_audio(audio: &[u8], last: bool) -> Result<Vec<u8>> {
    let header = Header::new(
        MessageType::AudioOnly,
        if last { flags::LAST } else { flags::NONE },
        Serialization::None,
        Compression::Gzip,
    );
    Ok(encode(header, &gzip(audio)?))
}

/// Assemble header, big-endian payload length, and payload
#[must_use]
pub fn encode(header: Header, payload: &[u8]) -> Vec<u8> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode any frame, client- or server-originated
///
/// # Errors
///
/// Returns error on truncated frames, unknown header values, or bad compression
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    let header = Header::parse(bytes)?;
    let mut rest = bytes
        .get(header.len()..)
        .ok_or_else(|| Error::Protocol("frame shorter than its header".to_string()))?;

    let mut sequence = None;
    let mut code = None;

    let body = match header.message_type {
        MessageType::ServerAck => {
            sequence = Some(i32::from_be_bytes(take_word(&mut rest, "ack sequence")?));
            // Body is optional on acks
            if rest.len() >= 4 {
                take_sized(&mut rest)?
            } else {
                &[][..]
            }
        }
        MessageType::ServerError => {
            code = Some(u32::from_be_bytes(take_word(&mut rest, "error code")?));
            take_sized(&mut rest)?
        }
        _ => {
            if header.flags & flags::SEQUENCE != 0 {
                sequence = Some(i32::from_be_bytes(take_word(&mut rest, "sequence")?));
            }
            take_sized(&mut rest)?
        }
    };

    let payload = match header.compression {
        Compression::Gzip if !body.is_empty() => gunzip(body)?,
        _ => body.to_vec(),
    };

    Ok(Frame {
        header,
        sequence,
        code,
        payload,
    })
}

fn take_word(rest: &mut &[u8], what: &str) -> Result<[u8; 4]> {
    let (word, tail) = rest
        .split_first_chunk::<4>()
        .ok_or_else(|| Error::Protocol(format!("frame truncated before {what}")))?;
    *rest = tail;
    Ok(*word)
}

fn take_sized<'a>(rest: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = u32::from_be_bytes(take_word(rest, "payload length")?) as usize;
    if rest.len() < len {
        return Err(Error::Protocol(format!(
            "payload length {len} exceeds remaining {} bytes",
            rest.len()
        )));
    }
    let (body, tail) = rest.split_at(len);
    *rest = tail;
    Ok(body)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::Protocol(format!("gzip decode failed: {e}")))?;
    Ok(out)
}

/// Session-opening request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullClientRequest {
    pub app: AppInfo,
    pub user: UserInfo,
    pub request: RequestInfo,
    pub audio: AudioInfo,
}

/// App credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub appid: String,
    pub token: String,
    pub cluster: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub uid: String,
}

/// Workflow stages and result mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub reqid: String,
    pub nbest: u32,
    pub workflow: String,
    pub show_utterances: bool,
    /// "full" returns the whole transcript so far, "single" only the latest utterance
    pub result_type: String,
    pub sequence: i32,
}

/// Audio format and codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub format: String,
    pub codec: String,
    pub rate: u32,
    pub bits: u16,
    pub channel: u16,
    pub language: String,
}

/// Full-response (or ack) body
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RecognitionResponse {
    #[serde(default)]
    pub reqid: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub sequence: i64,
    #[serde(default)]
    pub result: Vec<ResultItem>,
}

impl RecognitionResponse {
    /// Whether `code` signals failure (0 and 1000 are success)
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.code != 0 && self.code != 1000
    }
}

/// One entry of a response's result list
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResultItem {
    #[serde(default)]
    pub text: String,
    /// Absent on recognizers that do not flag finality
    #[serde(default, alias = "definite")]
    pub is_final: Option<bool>,
}

/// A classified server frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Recognition results; `last` when the header marks the terminal packet
    Response {
        last: bool,
        body: RecognitionResponse,
    },
    /// Acknowledgement, optionally with a body
    Ack {
        sequence: i32,
        body: Option<RecognitionResponse>,
    },
    /// Server error with its message
    Error { code: u32, message: String },
}

impl ServerMessage {
    /// Decode and classify a server frame
    ///
    /// # Errors
    ///
    /// Returns error on malformed frames or client-only message types
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let frame = decode(bytes)?;

        match frame.header.message_type {
            MessageType::FullServerResponse => Ok(Self::Response {
                last: frame.header.is_last() || frame.sequence.is_some_and(|s| s < 0),
                body: frame.json()?,
            }),
            MessageType::ServerAck => Ok(Self::Ack {
                sequence: frame.sequence.unwrap_or_default(),
                body: if frame.payload.is_empty() {
                    None
                } else {
                    Some(frame.json()?)
                },
            }),
            MessageType::ServerError => Ok(Self::Error {
                code: frame.code.unwrap_or_default(),
                message: String::from_utf8_lossy(&frame.payload).into_owned(),
            }),
            other => Err(Error::Protocol(format!("unexpected {other:?} from server"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bytes() {
        let header = Header::new(
            MessageType::FullClientRequest,
            flags::NONE,
            Serialization::Json,
            Compression::Gzip,
        );
        assert_eq!(header.to_bytes(), [0x11, 0x10, 0x11, 0x00]);

        let audio_last = Header::new(
            MessageType::AudioOnly,
            flags::LAST,
            Serialization::None,
            Compression::Gzip,
        );
        assert_eq!(audio_last.to_bytes(), [0x11, 0x22, 0x01, 0x00]);
    }

    #[test]
    fn test_length_is_big_endian() {
        let header = Header::new(
            MessageType::AudioOnly,
            flags::NONE,
            Serialization::None,
            Compression::None,
        );
        let frame = encode(header, &[7u8; 258]);
        assert_eq!(&frame[4..8], &[0, 0, 1, 2]);
        assert_eq!(frame.len(), 8 + 258);
    }

    #[test]
    fn test_audio_frame_marks_last() {
        let frame = decode(&encode_audio(&[1, 2, 3, 4], true).unwrap()).unwrap();
        assert_eq!(frame.header.message_type, MessageType::AudioOnly);
        assert!(frame.header.is_last());
        assert_eq!(frame.payload, vec![1, 2, 3, 4]);

        let frame = decode(&encode_audio(&[9], false).unwrap()).unwrap();
        assert!(!frame.header.is_last());
    }

    #[test]
    fn test_extended_header_skipped() {
        // Two-word header: the extra word is ignored
        let mut bytes = vec![0x21, 0x90, 0x10, 0x00, 0xde, 0xad, 0xbe, 0xef];
        let body = br#"{"result":[{"text":"hi"}]}"#;
        bytes.extend_from_slice(&u32::try_from(body.len()).unwrap().to_be_bytes());
        bytes.extend_from_slice(body);

        let ServerMessage::Response { body, .. } = ServerMessage::decode(&bytes).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(body.result[0].text, "hi");
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut bytes = encode_audio(&[1, 2, 3], false).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(decode(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        assert!(matches!(
            decode(&[0x11, 0x30, 0x00, 0x00, 0, 0, 0, 0]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_definite_alias() {
        let item: ResultItem = serde_json::from_str(r#"{"text":"a","definite":true}"#).unwrap();
        assert_eq!(item.is_final, Some(true));

        let item: ResultItem = serde_json::from_str(r#"{"text":"a"}"#).unwrap();
        assert_eq!(item.is_final, None);
    }

    #[test]
    fn test_full_client_request_decodes_to_same_value() {
        let request = FullClientRequest {
            app: AppInfo {
                appid: "app".to_string(),
                token: "secret".to_string(),
                cluster: "volcengine_streaming_common".to_string(),
            },
            user: UserInfo {
                uid: "parley".to_string(),
            },
            request: RequestInfo {
                reqid: "6f1c2a".to_string(),
                nbest: 1,
                workflow: "audio_in,resample,partition,vad,fe,decode".to_string(),
                show_utterances: true,
                result_type: "full".to_string(),
                sequence: 1,
            },
            audio: AudioInfo {
                format: "raw".to_string(),
                codec: "raw".to_string(),
                rate: 16_000,
                bits: 16,
                channel: 1,
                language: "zh-CN".to_string(),
            },
        };

        let frame = decode(&encode_full_client_request(&request).unwrap()).unwrap();
        assert_eq!(frame.header.message_type, MessageType::FullClientRequest);
        assert_eq!(frame.json::<FullClientRequest>().unwrap(), request);
    }

    #[test]
    fn test_terminal_audio_frame_decodes_exactly() {
        let audio: Vec<u8> = (0..=255).collect();
        let frame = decode(&encode_audio(&audio, true).unwrap()).unwrap();
        assert_eq!(
            frame,
            Frame {
                header: Header::new(
                    MessageType::AudioOnly,
                    flags::LAST,
                    Serialization::None,
                    Compression::Gzip,
                ),
                sequence: None,
                code: None,
                payload: audio,
            }
        );
    }
}
