#![no_main]

use bytes::BytesMut;
use grpc::{DEFAULT_MAX_RECEIVE_MESSAGE_SIZE, FrameError, decode_message, encode_message_with_compression};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    loop {
        match decode_message(&mut buf, DEFAULT_MAX_RECEIVE_MESSAGE_SIZE) {
            Ok(Some((message, compressed))) => {
                let reencoded = encode_message_with_compression(&message, compressed);
                let mut rebuf = BytesMut::from(&reencoded[..]);
                let Ok(Some((redecoded, recompressed))) =
                    decode_message(&mut rebuf, DEFAULT_MAX_RECEIVE_MESSAGE_SIZE)
                else {
                    panic!("re-encoded frame failed to decode");
                };
                assert_eq!(message, redecoded);
                assert_eq!(compressed, recompressed);
                assert!(rebuf.is_empty());
            }
            Ok(None) => break,
            Err(FrameError::MessageTooLarge { size, limit }) => {
                assert!(size > limit);
                break;
            }
            Err(_) => break,
        }
    }
});
