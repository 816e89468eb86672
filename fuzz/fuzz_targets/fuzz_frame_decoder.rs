#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use stream_protocol::core::frame::FrameDecoder;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary wire bytes through the incremental decoder, split at
    // an arbitrary point to exercise partial-frame state.
    let mut decoder = FrameDecoder::new(1024 * 1024);
    let split = data.first().copied().unwrap_or(0) as usize % (data.len().max(1));

    let mut buf = BytesMut::from(&data[..split]);
    while let Ok(Some(_)) = decoder.decode(&mut buf) {}

    buf.extend_from_slice(&data[split..]);
    while let Ok(Some(_)) = decoder.decode(&mut buf) {}
});
