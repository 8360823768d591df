#![no_main]

use gptscript_schema::{Document, Node, Text};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);

    let text = Text::parse(&raw);
    assert!(!text.format.contains('\n'));
    if !text.format.is_empty() {
        let reparsed = Text::parse(&text.wire_text());
        assert_eq!(reparsed.format, text.format);
    }

    if let Ok(document) = serde_json::from_str::<Document>(&raw) {
        let encoded = serde_json::to_string(&document).expect("documents serialize");
        let decoded: Document = serde_json::from_str(&encoded).expect("re-decode document");
        assert_eq!(decoded.nodes.len(), document.nodes.len());
        for (before, after) in document.nodes.iter().zip(decoded.nodes.iter()) {
            assert_eq!(
                matches!(before, Node::Text(_)),
                matches!(after, Node::Text(_))
            );
        }
    }
});
