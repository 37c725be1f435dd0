#![no_main]

use feedhouse_core::AttributeMap;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Meta text is written by senders; parsing is lossy but must not panic,
    // and a parsed map must survive its own text form.
    let map = AttributeMap::from_meta_bytes(data);
    let reparsed = AttributeMap::parse_meta(&map.to_string());
    assert_eq!(map.len(), reparsed.len());
});
