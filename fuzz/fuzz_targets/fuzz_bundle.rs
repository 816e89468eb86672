#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use stream_protocol::error::Result;
use stream_protocol::protocol::{
    Bundle, BundleProcessor, IncomingMessage, InterfaceTable, LengthStyle, LengthWidth,
    MessageSpec, RequestTracker,
};

struct SinkTable;

impl InterfaceTable for SinkTable {
    fn spec(&self, id: u8) -> Option<MessageSpec> {
        match id {
            0x01 => Some(MessageSpec {
                id,
                name: "var2",
                length: LengthStyle::Variable(LengthWidth::Two),
            }),
            0x02 => Some(MessageSpec {
                id,
                name: "fixed3",
                length: LengthStyle::Fixed(3),
            }),
            0x03 => Some(MessageSpec {
                id,
                name: "var1",
                length: LengthStyle::Variable(LengthWidth::One),
            }),
            _ => None,
        }
    }

    fn handle(&mut self, _message: IncomingMessage<'_>, _replies: &mut Bundle) -> Result<()> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    // Walking a hostile bundle payload must never panic; corrupt chains
    // and truncated messages come back as errors.
    let mut table = SinkTable;
    let mut tracker = RequestTracker::new();
    let mut replies = Bundle::new();
    let _ = BundleProcessor::new(Bytes::copy_from_slice(data)).dispatch(
        &mut table,
        &mut tracker,
        &mut replies,
    );
});
