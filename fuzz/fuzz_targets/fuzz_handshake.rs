#![no_main]

use libfuzzer_sys::fuzz_target;
use stream_protocol::filter::websocket::http::{HttpRequest, HttpResponse};

fuzz_target!(|data: &[u8]| {
    // Handshake parsing must never panic on arbitrary header blocks.
    let _ = HttpRequest::parse(data);
    let _ = HttpResponse::parse(data);
});
