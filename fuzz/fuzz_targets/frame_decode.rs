//! Arbitrary bytes must decode to a frame or a `ProtocolError`, never panic.
//! Whatever decodes must re-encode and decode to the same frame.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use streamhub_proto::{Direction, Frame};

fuzz_target!(|data: &[u8]| {
    let Some((&selector, message)) = data.split_first() else { return };
    let direction = if selector & 1 == 0 { Direction::ToServer } else { Direction::ToClient };

    if let Ok(frame) = Frame::decode(&Bytes::copy_from_slice(message), direction) {
        let encoded = frame.to_bytes().expect("decoded frames re-encode");
        let again = Frame::decode(&encoded, direction).expect("re-encoded frames decode");
        assert_eq!(frame, again);
    }
});
