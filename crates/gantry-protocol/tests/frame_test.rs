// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame encoding/decoding tests for gantry-protocol.

use bytes::Bytes;
use gantry_protocol::controller::rpc_request::Request;
use gantry_protocol::controller::{RpcRequest, StreamAppsRequest, StreamScalesRequest};
use gantry_protocol::frame::{
    Frame, FrameError, HEADER_SIZE, MessageType, PREAMBLE, read_frame, read_preamble, write_frame,
    write_preamble,
};

#[test]
fn message_type_conversions() {
    assert_eq!(MessageType::try_from(1u16).unwrap(), MessageType::Request);
    assert_eq!(MessageType::try_from(2u16).unwrap(), MessageType::Response);
    assert_eq!(
        MessageType::try_from(3u16).unwrap(),
        MessageType::StreamStart
    );
    assert_eq!(MessageType::try_from(4u16).unwrap(), MessageType::StreamData);
    assert_eq!(MessageType::try_from(5u16).unwrap(), MessageType::StreamEnd);
    assert_eq!(MessageType::try_from(6u16).unwrap(), MessageType::Error);

    assert!(MessageType::try_from(0u16).is_err());
    assert!(MessageType::try_from(7u16).is_err());
    assert!(MessageType::try_from(100u16).is_err());
}

#[test]
fn frame_encode_decode_roundtrip() {
    let msg = RpcRequest {
        request: Some(Request::StreamApps(StreamAppsRequest {
            page_size: 2,
            stream_creates: true,
            ..Default::default()
        })),
    };
    let original = Frame::request(&msg).unwrap();

    let encoded = original.encode();
    let decoded = Frame::decode_from_bytes(encoded).unwrap();

    assert_eq!(original.message_type, decoded.message_type);
    assert_eq!(original.payload, decoded.payload);

    let roundtripped: RpcRequest = decoded.decode().unwrap();
    assert_eq!(msg, roundtripped);
}

#[test]
fn frame_header_format() {
    let msg = StreamScalesRequest {
        name_filters: vec!["apps/app1".to_string()],
    };
    let frame = Frame::request(&msg).unwrap();
    let encoded = frame.encode();

    // First 4 bytes are length (big-endian).
    let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
    assert_eq!(length, frame.payload.len());

    // Next 2 bytes are message type (big-endian).
    let msg_type = u16::from_be_bytes([encoded[4], encoded[5]]);
    assert_eq!(msg_type, MessageType::Request as u16);

    assert_eq!(encoded.len(), HEADER_SIZE + frame.payload.len());
}

#[test]
fn frame_decode_incomplete_header() {
    let incomplete = Bytes::from_static(&[0, 0, 0, 10, 0]);
    let result = Frame::decode_from_bytes(incomplete);
    assert!(matches!(result, Err(FrameError::Io(_))));
}

#[test]
fn frame_decode_truncated_payload() {
    // Header promises 8 payload bytes but only 2 follow.
    let truncated = Bytes::from_static(&[0, 0, 0, 8, 0, 2, 1, 2]);
    let result = Frame::decode_from_bytes(truncated);
    assert!(matches!(result, Err(FrameError::Io(_))));
}

#[test]
fn frame_decode_invalid_message_type() {
    let bad_type = Bytes::from_static(&[0, 0, 0, 0, 0, 99]);
    let result = Frame::decode_from_bytes(bad_type);
    assert!(matches!(result, Err(FrameError::InvalidMessageType(99))));
}

#[tokio::test]
async fn frame_io_roundtrip() {
    let msg = StreamScalesRequest {
        name_filters: vec!["apps/app1".to_string(), "apps/app2".to_string()],
    };
    let frame = Frame::request(&msg).unwrap();

    let mut buf = Vec::new();
    write_frame(&mut buf, &frame).await.unwrap();

    let mut reader = buf.as_slice();
    let decoded = read_frame(&mut reader).await.unwrap();
    assert_eq!(decoded.message_type, MessageType::Request);
    let decoded_msg: StreamScalesRequest = decoded.decode().unwrap();
    assert_eq!(decoded_msg, msg);
}

#[tokio::test]
async fn read_frame_reports_closed_connection() {
    let empty: &[u8] = &[];
    let mut reader = empty;
    let result = read_frame(&mut reader).await;
    assert!(matches!(result, Err(FrameError::ConnectionClosed)));
}

#[tokio::test]
async fn preamble_roundtrip() {
    let mut buf = Vec::new();
    write_preamble(&mut buf).await.unwrap();
    assert_eq!(buf, PREAMBLE);

    let mut reader = buf.as_slice();
    read_preamble(&mut reader).await.unwrap();
}

#[tokio::test]
async fn preamble_rejects_http_bytes() {
    // The first bytes of an HTTP request must never classify as native RPC.
    let mut reader: &[u8] = b"POST /rpc";
    let result = read_preamble(&mut reader).await;
    assert!(matches!(result, Err(FrameError::InvalidPreamble)));
}
