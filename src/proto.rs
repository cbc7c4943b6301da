//! Tunnel frame protocol
//!
//! Every frame on the shared stream is either a payload frame carrying raw
//! connection bytes or a control frame negotiating socket lifecycle for one
//! logical connection. The distinction is made once, at the stream boundary,
//! by decoding into the [`Message`] sum type; downstream code never inspects
//! raw frames.
//!
//! Wire layout: one marker byte (0 = payload, 1 = control), the fixed-width
//! [`ConnId`] encoding, then either the payload bytes or one control code
//! byte followed by optional extra bytes.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::connid::ConnId;
use crate::error::ProtocolError;

const MARKER_PAYLOAD: u8 = 0;
const MARKER_CONTROL: u8 = 1;

/// Lifecycle control codes exchanged in-band on the shared stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    /// Ask the peer to open a socket to the id's destination
    Connect = 1,
    /// The peer's socket is open
    ConnectOk = 2,
    /// The peer could not open the socket
    ConnectReject = 3,
    /// Ask the peer to close its socket
    Disconnect = 4,
    /// The peer closed its socket
    DisconnectOk = 5,
    /// The peer's socket reached end of stream (TCP only)
    ReadClosed = 6,
    /// The peer's socket rejected a write (TCP only)
    WriteClosed = 7,
}

impl ControlCode {
    /// Decode a control code byte
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownControlCode` for unassigned values.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(Self::Connect),
            2 => Ok(Self::ConnectOk),
            3 => Ok(Self::ConnectReject),
            4 => Ok(Self::Disconnect),
            5 => Ok(Self::DisconnectOk),
            6 => Ok(Self::ReadClosed),
            7 => Ok(Self::WriteClosed),
            other => Err(ProtocolError::UnknownControlCode(other)),
        }
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "CONNECT",
            Self::ConnectOk => "CONNECT_OK",
            Self::ConnectReject => "CONNECT_REJECT",
            Self::Disconnect => "DISCONNECT",
            Self::DisconnectOk => "DISCONNECT_OK",
            Self::ReadClosed => "READ_CLOSED",
            Self::WriteClosed => "WRITE_CLOSED",
        };
        f.write_str(s)
    }
}

/// A parsed control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Connection the lifecycle event applies to
    pub id: ConnId,
    /// Lifecycle code
    pub code: ControlCode,
    /// Optional extra bytes (reject reasons and the like); often empty
    pub extra: Bytes,
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.id)
    }
}

/// One frame on the shared stream, decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Raw connection bytes for one logical connection
    Payload {
        /// Connection the bytes belong to
        id: ConnId,
        /// The bytes
        data: Bytes,
    },
    /// A lifecycle control frame
    Control(ControlMessage),
}

impl Message {
    /// Build a payload frame
    #[must_use]
    pub fn payload(id: ConnId, data: Bytes) -> Self {
        Self::Payload { id, data }
    }

    /// Build a control frame without extra bytes
    #[must_use]
    pub fn control(id: ConnId, code: ControlCode) -> Self {
        Self::Control(ControlMessage {
            id,
            code,
            extra: Bytes::new(),
        })
    }

    /// The connection id this frame belongs to
    #[must_use]
    pub fn id(&self) -> ConnId {
        match self {
            Self::Payload { id, .. } => *id,
            Self::Control(cm) => cm.id,
        }
    }

    /// Check if this frame is a control frame
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control(_))
    }

    /// Encode to the wire layout
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Payload { id, data } => {
                let mut buf = BytesMut::with_capacity(1 + id.encoded_len() + data.len());
                buf.put_u8(MARKER_PAYLOAD);
                id.encode_into(&mut buf);
                buf.put_slice(data);
                buf.freeze()
            }
            Self::Control(cm) => {
                let mut buf = BytesMut::with_capacity(2 + cm.id.encoded_len() + cm.extra.len());
                buf.put_u8(MARKER_CONTROL);
                cm.id.encode_into(&mut buf);
                buf.put_u8(cm.code as u8);
                buf.put_slice(&cm.extra);
                buf.freeze()
            }
        }
    }

    /// Decode one frame
    ///
    /// # Errors
    ///
    /// Returns a `ProtocolError` for empty frames, unknown markers, bad
    /// connection ids, and control frames with a missing or unassigned code.
    pub fn decode(frame: &Bytes) -> Result<Self, ProtocolError> {
        let Some(&marker) = frame.first() else {
            return Err(ProtocolError::ShortFrame { len: 0 });
        };
        let (id, consumed) = ConnId::decode(&frame[1..])?;
        let rest = frame.slice(1 + consumed..);
        match marker {
            MARKER_PAYLOAD => Ok(Self::Payload { id, data: rest }),
            MARKER_CONTROL => {
                let Some(&code) = rest.first() else {
                    return Err(ProtocolError::Truncated {
                        expected: 1 + consumed + 1,
                        actual: frame.len(),
                    });
                };
                Ok(Self::Control(ControlMessage {
                    id,
                    code: ControlCode::from_u8(code)?,
                    extra: rest.slice(1..),
                }))
            }
            other => Err(ProtocolError::UnknownMarker(other)),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payload { id, data } => write!(f, "PAYLOAD {} len {}", id, data.len()),
            Self::Control(cm) => cm.fmt(f),
        }
    }
}
