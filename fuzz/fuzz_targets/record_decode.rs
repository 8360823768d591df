#![no_main]

use gptscript_sdk::{decode_line, LineBuffer, StreamRecord};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed the input in two chunks so split records are exercised.
    let split = data.first().map(|byte| *byte as usize % (data.len() + 1)).unwrap_or(0);
    let mut buffer = LineBuffer::default();
    let mut lines = Vec::new();
    for chunk in [&data[..split], &data[split..]] {
        match buffer.push(chunk) {
            Ok(complete) => lines.extend(complete),
            Err(_) => return,
        }
    }
    if let Ok(Some(tail)) = buffer.finish() {
        lines.push(tail);
    }

    for line in lines {
        assert!(!line.contains('\n'));
        if let Ok(Some(StreamRecord::Event(frame))) = decode_line(&line) {
            let encoded = serde_json::to_string(&frame).expect("frames serialize");
            assert!(encoded.starts_with('{'));
        }
    }
});
