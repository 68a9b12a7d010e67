#![no_main]

use calbot_notify::{escape_html, to_chat_markup, to_plain_text, to_rich_text, RICH_TEXT_TAGS};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);

    let plain = to_plain_text(&raw);
    assert_eq!(plain.trim(), plain);

    let rich = to_rich_text(&raw);
    for name in RICH_TEXT_TAGS.iter().filter(|name| **name != "br") {
        assert_eq!(
            rich.matches(&format!("<{name}>")).count(),
            rich.matches(&format!("</{name}>")).count()
        );
    }
    let _ = to_chat_markup(&rich);
    let _ = to_plain_text(&rich);

    // Escaped text never grows tags of its own.
    let escaped = escape_html(&raw);
    assert!(!escaped.contains('<') && !escaped.contains('>'));
    assert_eq!(to_plain_text(&escaped), raw.trim());
});
