#![no_main]

use grpc::{Metadata, Status, percent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (status, message) = text.split_once('\n').unwrap_or((text, ""));

    let mut trailers = Metadata::new();
    trailers.insert("grpc-status", status);
    trailers.insert("grpc-message", message);
    let parsed = Status::from_trailers(trailers);

    // Anything we encode must decode back to the same message.
    let encoded = percent::encode(message);
    assert_eq!(percent::decode(&encoded).as_deref(), Ok(message));

    let roundtrip = Status::from_trailers(parsed.to_trailers());
    assert_eq!(roundtrip.code(), parsed.code());
    assert_eq!(roundtrip.message(), parsed.message());
});
