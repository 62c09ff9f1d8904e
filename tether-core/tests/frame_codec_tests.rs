// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Frame Codec Tests
//!
//! Tests for the binary request/response envelope:
//! - Field preservation through encode and decode
//! - Size limit on both directions
//! - Robustness against arbitrary input

mod common;

use common::{open_resource, quiet_config};
use proptest::prelude::*;
use tether_core::network::{
    decode_frame, encode_frame, Frame, NetworkError, RequestFrame, ResponseFrame,
    SendRequestOptions, MAX_FRAME_SIZE,
};

/// Test: a request keeps every field
#[test]
fn test_request_fields_survive_encoding() {
    let frame = Frame::Request(RequestFrame {
        id: 42,
        verb: "PUT".into(),
        path: "/v1/messages/+15551234567?story=false".into(),
        body: Some(vec![1, 2, 3]),
        headers: vec!["content-type:application/json".into(), "x-signal-timestamp:1".into()],
    });

    let decoded = decode_frame(&encode_frame(&frame).unwrap()).unwrap();

    assert_eq!(decoded, frame);
    assert_eq!(decoded.id(), 42);
}

/// Test: a response keeps status, message and body
#[test]
fn test_response_fields_survive_encoding() {
    let frame = Frame::Response(ResponseFrame {
        id: 7,
        status: 409,
        message: "Conflict".into(),
        body: Some(br#"{"missingDevices":[2]}"#.to_vec()),
        headers: Vec::new(),
    });

    assert_eq!(decode_frame(&encode_frame(&frame).unwrap()).unwrap(), frame);
}

/// Test: an empty body is distinct from no body
#[test]
fn test_empty_body_is_not_absent_body() {
    let request = RequestFrame {
        id: 1,
        verb: "GET".into(),
        path: "/".into(),
        body: Some(Vec::new()),
        headers: Vec::new(),
    };
    let with_empty = Frame::Request(request.clone());
    let without = Frame::Request(RequestFrame {
        body: None,
        ..request
    });

    assert_eq!(decode_frame(&encode_frame(&with_empty).unwrap()).unwrap(), with_empty);
    assert_eq!(decode_frame(&encode_frame(&without).unwrap()).unwrap(), without);
}

/// Test: frames over the wire limit are refused on encode
#[test]
fn test_oversized_frame_rejected_on_encode() {
    let frame = Frame::Request(RequestFrame {
        id: 1,
        verb: "PUT".into(),
        path: "/v1/attachments".into(),
        body: Some(vec![0u8; MAX_FRAME_SIZE]),
        headers: Vec::new(),
    });

    match encode_frame(&frame) {
        Err(NetworkError::FrameTooLarge { size, max }) => {
            assert!(size > MAX_FRAME_SIZE);
            assert_eq!(max, MAX_FRAME_SIZE);
        }
        other => panic!("expected FrameTooLarge, got {:?}", other),
    }
}

/// Test: oversized input is refused before parsing
#[test]
fn test_oversized_input_rejected_on_decode() {
    let bytes = vec![0u8; MAX_FRAME_SIZE + 1];
    assert!(matches!(
        decode_frame(&bytes),
        Err(NetworkError::FrameTooLarge { .. })
    ));
}

/// Test: truncated bytes are a protocol violation
#[test]
fn test_truncated_frame_is_violation() {
    let bytes = encode_frame(&Frame::Response(ResponseFrame {
        id: 3,
        status: 200,
        message: "OK".into(),
        ..Default::default()
    }))
    .unwrap();

    assert!(matches!(
        decode_frame(&bytes[..bytes.len() - 1]),
        Err(NetworkError::ProtocolViolation(_))
    ));
}

/// Test: the Resource refuses to send an oversized request and stays open
#[tokio::test(start_paused = true)]
async fn test_resource_rejects_oversized_request() {
    let (resource, _server) = open_resource(quiet_config(), None).await;

    let result = resource
        .send_request(
            SendRequestOptions::new("PUT", "/v1/attachments").with_body(vec![0u8; MAX_FRAME_SIZE]),
        )
        .await;

    assert!(matches!(result, Err(NetworkError::FrameTooLarge { .. })));
    assert!(!resource.is_closed());
    assert_eq!(resource.in_flight().await, 0);
}

proptest! {
    /// Decoding arbitrary bytes returns an error or a frame, never panics.
    #[test]
    fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_frame(&bytes);
    }

    /// Any request that fits the limit comes back unchanged.
    #[test]
    fn prop_request_preserved(
        id in 1u64..=0x7fff_ffff,
        verb in "[A-Z]{3,6}",
        path in "/[a-z0-9/]{0,40}",
        body in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..256)),
    ) {
        let frame = Frame::Request(RequestFrame { id, verb, path, body, headers: Vec::new() });
        prop_assert_eq!(decode_frame(&encode_frame(&frame).unwrap()).unwrap(), frame);
    }
}
