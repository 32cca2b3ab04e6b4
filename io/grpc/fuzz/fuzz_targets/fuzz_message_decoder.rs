#![no_main]

use grpc::MessageDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // First byte picks the receive limit, the rest is fed in three chunks.
    let Some((&limit, data)) = data.split_first() else {
        return;
    };
    let mut decoder = MessageDecoder::with_limit(limit as usize * 16);
    let chunk_size = (data.len() / 3).max(1);
    let mut consumed = 0;

    for chunk in data.chunks(chunk_size) {
        decoder.feed(chunk);
        loop {
            match decoder.decode() {
                Ok(Some((message, _))) => {
                    assert!(message.len() <= limit as usize * 16);
                    consumed += grpc::HEADER_SIZE + message.len();
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }

    assert_eq!(consumed + decoder.buffered_len(), data.len());
    assert_eq!(decoder.finish().is_ok(), !decoder.has_buffered_data());
});
