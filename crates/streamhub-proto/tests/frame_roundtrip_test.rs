//! Round-trip tests for every frame kind, plus property tests over arbitrary
//! field values and hostile input.

use bytes::Bytes;
use proptest::prelude::*;
use streamhub_proto::{Direction, Frame, MethodId, RemoteError, RequestId, StatusCode};

fn round_trip(frame: &Frame) -> Frame {
    let bytes = frame.to_bytes().expect("encode");
    Frame::decode(&bytes, frame.direction()).expect("decode")
}

fn boundary_method_ids() -> [MethodId; 4] {
    [MethodId::new(0), MethodId::new(i32::MAX), MethodId::new(i32::MIN), MethodId::new(-1)]
}

#[test]
fn every_kind_round_trips_at_method_id_boundaries() {
    let request_id = RequestId::from_random_bytes([0xab; 16]);
    let args = Bytes::from_static(&[0x92, 0x01, 0x02]);

    for method_id in boundary_method_ids() {
        let frames = vec![
            Frame::RequestFireAndForget { method_id, args: args.clone() },
            Frame::Request { message_id: 1, method_id, args: args.clone() },
            Frame::Response { message_id: i32::MAX, method_id, result: args.clone() },
            Frame::Broadcast { method_id, args: args.clone() },
            Frame::ClientInvokeRequest { request_id, method_id, args: args.clone() },
            Frame::ClientInvokeResponse { request_id, method_id, result: args.clone() },
            Frame::ClientInvokeResponseWithError {
                request_id,
                method_id,
                error: RemoteError::new(StatusCode::UNIMPLEMENTED, "no such method"),
            },
        ];
        for frame in frames {
            assert_eq!(round_trip(&frame), frame, "{:?}", frame.kind());
        }
    }
}

#[test]
fn zero_length_args_round_trip() {
    for method_id in boundary_method_ids() {
        let frames = vec![
            Frame::RequestFireAndForget { method_id, args: Bytes::new() },
            Frame::Request { message_id: 0, method_id, args: Bytes::new() },
            Frame::Response { message_id: 0, method_id, result: Bytes::new() },
            Frame::Broadcast { method_id, args: Bytes::new() },
        ];
        for frame in frames {
            assert_eq!(round_trip(&frame), frame, "{:?}", frame.kind());
        }
    }
}

#[test]
fn heartbeat_kinds_round_trip() {
    let frames = vec![
        Frame::ServerHeartbeat { sequence: 0, sent_at_ms: 1_700_000_000_000, metadata: Bytes::new() },
        Frame::ServerHeartbeat {
            sequence: u32::MAX,
            sent_at_ms: 1,
            metadata: Bytes::from_static(&[0x93, 0x01, 0x02, 0x03]),
        },
        Frame::ServerHeartbeatAck { sequence: 7, sent_at_ms: 1_700_000_000_000 },
        Frame::ClientHeartbeat { sequence: 0, sent_at_ms: 12, extra: Bytes::new() },
        Frame::ClientHeartbeat { sequence: 3, sent_at_ms: -5, extra: Bytes::from_static(&[0x01]) },
        Frame::ClientHeartbeatAck { sequence: 3, sent_at_ms: 12 },
    ];
    for frame in frames {
        assert_eq!(round_trip(&frame), frame, "{:?}", frame.kind());
    }
}

#[test]
fn error_response_round_trips() {
    let frame = Frame::ResponseWithError {
        message_id: -3,
        error: RemoteError {
            status: StatusCode::new(4242),
            detail: "handler failed".into(),
            message: Some("caused by: database unavailable".into()),
        },
    };
    assert_eq!(round_trip(&frame), frame);
}

fn arb_bytes() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..64).prop_map(Bytes::from)
}

fn arb_error() -> impl Strategy<Value = RemoteError> {
    (any::<i32>(), ".{0,24}", prop::option::of(".{0,24}")).prop_map(|(code, detail, message)| {
        RemoteError { status: StatusCode::new(code), detail, message }
    })
}

fn arb_frame() -> impl Strategy<Value = Frame> {
    let method = any::<i32>().prop_map(MethodId::new);
    let request_id = any::<[u8; 16]>().prop_map(RequestId::from_random_bytes);
    // Heartbeat metadata must be a single non-nil value to survive the nil
    // normalization, use a positive fixint.
    let metadata = prop_oneof![Just(Bytes::new()), (0u8..0x80).prop_map(|b| Bytes::from(vec![b]))];

    prop_oneof![
        (method.clone(), arb_bytes()).prop_map(|(method_id, args)| Frame::RequestFireAndForget {
            method_id,
            args
        }),
        (any::<i32>(), method.clone(), arb_bytes()).prop_map(|(message_id, method_id, args)| {
            Frame::Request { message_id, method_id, args }
        }),
        (any::<i32>(), method.clone(), arb_bytes()).prop_map(|(message_id, method_id, result)| {
            Frame::Response { message_id, method_id, result }
        }),
        (any::<i32>(), arb_error())
            .prop_map(|(message_id, error)| Frame::ResponseWithError { message_id, error }),
        (method.clone(), arb_bytes()).prop_map(|(method_id, args)| Frame::Broadcast { method_id, args }),
        (request_id.clone(), method.clone(), arb_bytes()).prop_map(|(request_id, method_id, args)| {
            Frame::ClientInvokeRequest { request_id, method_id, args }
        }),
        (request_id.clone(), method.clone(), arb_bytes()).prop_map(
            |(request_id, method_id, result)| Frame::ClientInvokeResponse {
                request_id,
                method_id,
                result
            }
        ),
        (request_id, method, arb_error()).prop_map(|(request_id, method_id, error)| {
            Frame::ClientInvokeResponseWithError { request_id, method_id, error }
        }),
        (any::<u32>(), any::<i64>(), metadata.clone()).prop_map(|(sequence, sent_at_ms, metadata)| {
            Frame::ServerHeartbeat { sequence, sent_at_ms, metadata }
        }),
        (any::<u32>(), any::<i64>())
            .prop_map(|(sequence, sent_at_ms)| Frame::ServerHeartbeatAck { sequence, sent_at_ms }),
        (any::<u32>(), any::<i64>(), metadata).prop_map(|(sequence, sent_at_ms, extra)| {
            Frame::ClientHeartbeat { sequence, sent_at_ms, extra }
        }),
        (any::<u32>(), any::<i64>())
            .prop_map(|(sequence, sent_at_ms)| Frame::ClientHeartbeatAck { sequence, sent_at_ms }),
    ]
}

proptest! {
    #[test]
    fn prop_frames_round_trip(frame in arb_frame()) {
        let bytes = frame.to_bytes().unwrap();
        let decoded = Frame::decode(&bytes, frame.direction()).unwrap();
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn prop_decode_never_panics(
        data in prop::collection::vec(any::<u8>(), 0..128),
        to_server in any::<bool>(),
    ) {
        let direction = if to_server { Direction::ToServer } else { Direction::ToClient };
        let _ = Frame::decode(&Bytes::from(data), direction);
    }

    #[test]
    fn prop_truncated_fixed_frames_are_rejected(
        sequence in any::<u32>(),
        sent_at_ms in any::<i64>(),
        cut in 1usize..4,
    ) {
        let frame = Frame::ClientHeartbeatAck { sequence, sent_at_ms };
        let bytes = frame.to_bytes().unwrap();
        let truncated = bytes.slice(..bytes.len() - cut);
        prop_assert!(Frame::decode(&truncated, Direction::ToClient).is_err());
    }

    #[test]
    fn prop_truncated_request_headers_are_rejected(
        message_id in any::<i32>(),
        method_id in any::<i32>(),
        cut in any::<prop::sample::Index>(),
    ) {
        // Without args the method id is the last element, so any cut lands in
        // the header
        let frame = Frame::Request { message_id, method_id: MethodId::new(method_id), args: Bytes::new() };
        let bytes = frame.to_bytes().unwrap();
        let cut = 1 + cut.index(bytes.len());
        let truncated = bytes.slice(..bytes.len() - cut);
        prop_assert!(Frame::decode(&truncated, Direction::ToServer).is_err());
    }
}
