//! Packet Types
//!
//! The immutable envelope exchanged between connections and the hub,
//! plus the frame-type and close-code vocabulary of RFC 6455.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Maximum size of a control frame payload (RFC 6455 §5.5)
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Kind of frame carried by a [`Packet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// UTF-8 text data message
    Text,
    /// Binary data message
    Binary,
    /// Close control message (2-byte code + optional reason)
    Close,
    /// Ping control message
    Ping,
    /// Pong control message
    Pong,
    /// Internal pseudo-type signalling abnormal termination.
    /// Goes out on the wire as a close frame with [`CloseCode::INTERNAL_ERROR`].
    ControlError,
}

impl FrameType {
    /// Text and binary frames carry application data; everything else is control
    pub fn is_data(self) -> bool {
        matches!(self, FrameType::Text | FrameType::Binary)
    }

    /// Frames that end the conversation once written
    pub fn is_terminal(self) -> bool {
        matches!(self, FrameType::Close | FrameType::ControlError)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Text => "text",
            FrameType::Binary => "binary",
            FrameType::Close => "close",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::ControlError => "control_error",
        };
        f.write_str(name)
    }
}

/// Close status code (RFC 6455 §11.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNSUPPORTED_DATA: CloseCode = CloseCode(1003);
    pub const NO_STATUS: CloseCode = CloseCode(1005);
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    pub const INVALID_PAYLOAD: CloseCode = CloseCode(1007);
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);
    pub const MANDATORY_EXTENSION: CloseCode = CloseCode(1010);
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);
    pub const SERVICE_RESTART: CloseCode = CloseCode(1012);
    pub const TRY_AGAIN_LATER: CloseCode = CloseCode(1013);
    pub const TLS_HANDSHAKE: CloseCode = CloseCode(1015);
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        CloseCode(code)
    }
}

/// Immutable `{frame type, payload}` envelope
///
/// The payload is reference counted so a broadcast to many connections
/// clones a pointer, not the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    frame: FrameType,
    payload: Arc<[u8]>,
}

impl Packet {
    /// Create a packet with an arbitrary frame type
    pub fn new(frame: FrameType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            frame,
            payload: Arc::from(payload.into()),
        }
    }

    /// Create a text packet
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameType::Text, text.into().into_bytes())
    }

    /// Create a binary packet
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameType::Binary, data)
    }

    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameType::Ping, data)
    }

    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameType::Pong, data)
    }

    /// Create a close packet with a status code and reason
    pub fn close(code: CloseCode, reason: &str) -> Self {
        Self::new(FrameType::Close, format_close_payload(code, reason))
    }

    /// Create the internal control-error packet
    pub fn control_error(reason: &str) -> Self {
        Self::new(FrameType::ControlError, reason.as_bytes().to_vec())
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as UTF-8, if valid
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Decode the close code and reason of a close or control-error packet
    ///
    /// A close payload shorter than two bytes carries no status and decodes
    /// to [`CloseCode::NO_STATUS`].
    pub fn close_frame(&self) -> Option<(CloseCode, String)> {
        match self.frame {
            FrameType::Close => Some(parse_close_payload(&self.payload)),
            FrameType::ControlError => Some((
                CloseCode::INTERNAL_ERROR,
                String::from_utf8_lossy(&self.payload).into_owned(),
            )),
            _ => None,
        }
    }

    /// Translate internal pseudo-types into their on-the-wire form
    pub fn into_wire(self) -> Packet {
        match self.frame {
            FrameType::ControlError => {
                let reason = String::from_utf8_lossy(&self.payload).into_owned();
                Packet::close(CloseCode::INTERNAL_ERROR, &reason)
            }
            _ => self,
        }
    }
}

/// Encode a close payload: 2-byte big-endian code followed by the reason
///
/// [`CloseCode::NO_STATUS`] must never be sent, so it encodes to an empty
/// payload. The reason is truncated on a character boundary so the frame
/// fits in a control frame.
pub fn format_close_payload(code: CloseCode, reason: &str) -> Vec<u8> {
    if code == CloseCode::NO_STATUS {
        return Vec::new();
    }

    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.0.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

/// Decode a close payload produced by [`format_close_payload`]
pub fn parse_close_payload(payload: &[u8]) -> (CloseCode, String) {
    if payload.len() < 2 {
        return (CloseCode::NO_STATUS, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (CloseCode(code), reason)
}
