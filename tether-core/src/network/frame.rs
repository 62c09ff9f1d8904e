// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Frame Codec
//!
//! Binary framing for the multiplexed request/response protocol. Every
//! WebSocket binary message carries exactly one frame: either a request or a
//! response, correlated by a numeric id.
//!
//! Frames are protobuf encoded. The wire structs are private; callers work
//! with [`Frame`], [`RequestFrame`] and [`ResponseFrame`].

use prost::Message;

use super::error::{NetworkError, NetworkResult};

/// Maximum size of an encoded frame (256 KiB).
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Envelope discriminator on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
enum MessageType {
    Unknown = 0,
    Request = 1,
    Response = 2,
}

#[derive(Clone, PartialEq, Message)]
struct WireRequest {
    #[prost(string, optional, tag = "1")]
    verb: Option<String>,
    #[prost(string, optional, tag = "2")]
    path: Option<String>,
    #[prost(bytes = "vec", optional, tag = "3")]
    body: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "4")]
    id: Option<u64>,
    #[prost(string, repeated, tag = "5")]
    headers: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
struct WireResponse {
    #[prost(uint64, optional, tag = "1")]
    id: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    status: Option<u32>,
    #[prost(string, optional, tag = "3")]
    message: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    body: Option<Vec<u8>>,
    #[prost(string, repeated, tag = "5")]
    headers: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
struct WireMessage {
    #[prost(enumeration = "MessageType", optional, tag = "1")]
    kind: Option<i32>,
    #[prost(message, optional, tag = "2")]
    request: Option<WireRequest>,
    #[prost(message, optional, tag = "3")]
    response: Option<WireResponse>,
}

/// An outgoing or incoming request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestFrame {
    /// Correlation id, unique among pending requests of one sender.
    pub id: u64,
    /// HTTP-like verb (`GET`, `PUT`, ...).
    pub verb: String,
    /// Request path, including any query string.
    pub path: String,
    /// Optional body.
    pub body: Option<Vec<u8>>,
    /// Header lines in `name:value` form.
    pub headers: Vec<String>,
}

/// A response correlated to a request by id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseFrame {
    /// Id of the request being answered.
    pub id: u64,
    /// HTTP-like status code.
    pub status: u32,
    /// Status text.
    pub message: String,
    /// Optional body.
    pub body: Option<Vec<u8>>,
    /// Header lines in `name:value` form.
    pub headers: Vec<String>,
}

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Request from either side.
    Request(RequestFrame),
    /// Response from either side.
    Response(ResponseFrame),
}

impl Frame {
    /// Returns the correlation id of this frame.
    pub fn id(&self) -> u64 {
        match self {
            Frame::Request(request) => request.id,
            Frame::Response(response) => response.id,
        }
    }
}

/// Encodes a frame, rejecting anything larger than [`MAX_FRAME_SIZE`].
pub fn encode_frame(frame: &Frame) -> NetworkResult<Vec<u8>> {
    let wire = match frame {
        Frame::Request(request) => WireMessage {
            kind: Some(MessageType::Request as i32),
            request: Some(WireRequest {
                verb: Some(request.verb.clone()),
                path: Some(request.path.clone()),
                body: request.body.clone(),
                id: Some(request.id),
                headers: request.headers.clone(),
            }),
            response: None,
        },
        Frame::Response(response) => WireMessage {
            kind: Some(MessageType::Response as i32),
            request: None,
            response: Some(WireResponse {
                id: Some(response.id),
                status: Some(response.status),
                message: Some(response.message.clone()),
                body: response.body.clone(),
                headers: response.headers.clone(),
            }),
        },
    };

    let size = wire.encoded_len();
    if size > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(wire.encode_to_vec())
}

/// Decodes a frame.
///
/// Fails with [`NetworkError::ProtocolViolation`] on malformed bytes, an
/// unknown envelope type, or a request/response missing its id.
pub fn decode_frame(bytes: &[u8]) -> NetworkResult<Frame> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let wire = WireMessage::decode(bytes)
        .map_err(|e| NetworkError::ProtocolViolation(format!("Malformed frame: {}", e)))?;

    let kind = wire
        .kind
        .and_then(|k| MessageType::try_from(k).ok())
        .unwrap_or(MessageType::Unknown);

    match kind {
        MessageType::Request => {
            let request = wire.request.ok_or_else(|| {
                NetworkError::ProtocolViolation("Request frame without request".into())
            })?;
            let id = request
                .id
                .ok_or_else(|| NetworkError::ProtocolViolation("Request without id".into()))?;
            Ok(Frame::Request(RequestFrame {
                id,
                verb: request.verb.unwrap_or_default(),
                path: request.path.unwrap_or_default(),
                body: request.body,
                headers: request.headers,
            }))
        }
        MessageType::Response => {
            let response = wire.response.ok_or_else(|| {
                NetworkError::ProtocolViolation("Response frame without response".into())
            })?;
            let id = response
                .id
                .ok_or_else(|| NetworkError::ProtocolViolation("Response without id".into()))?;
            Ok(Frame::Response(ResponseFrame {
                id,
                status: response.status.unwrap_or_default(),
                message: response.message.unwrap_or_default(),
                body: response.body,
                headers: response.headers,
            }))
        }
        MessageType::Unknown => Err(NetworkError::ProtocolViolation(
            "Unknown frame type".into(),
        )),
    }
}

// INLINE_TEST_REQUIRED: Exercises private wire structs directly to build malformed frames
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_id_is_violation() {
        let wire = WireMessage {
            kind: Some(MessageType::Request as i32),
            request: Some(WireRequest {
                verb: Some("GET".into()),
                path: Some("/".into()),
                ..Default::default()
            }),
            response: None,
        };
        let result = decode_frame(&wire.encode_to_vec());
        assert!(matches!(result, Err(NetworkError::ProtocolViolation(_))));
    }

    #[test]
    fn test_unknown_type_is_violation() {
        let wire = WireMessage {
            kind: Some(7),
            request: None,
            response: None,
        };
        let result = decode_frame(&wire.encode_to_vec());
        assert!(matches!(result, Err(NetworkError::ProtocolViolation(_))));
    }

    #[test]
    fn test_response_type_without_payload_is_violation() {
        let wire = WireMessage {
            kind: Some(MessageType::Response as i32),
            request: None,
            response: None,
        };
        assert!(decode_frame(&wire.encode_to_vec()).is_err());
    }

    #[test]
    fn test_missing_status_defaults_to_zero() {
        let wire = WireMessage {
            kind: Some(MessageType::Response as i32),
            request: None,
            response: Some(WireResponse {
                id: Some(9),
                ..Default::default()
            }),
        };
        let frame = decode_frame(&wire.encode_to_vec()).unwrap();
        match frame {
            Frame::Response(response) => {
                assert_eq!(response.id, 9);
                assert_eq!(response.status, 0);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
