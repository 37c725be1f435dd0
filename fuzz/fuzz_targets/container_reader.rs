#![no_main]

use feedhouse_core::ContainerReader;
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes posted with `Compression: ZIP` end up here.
    // The reader must reject, never panic, on:
    // - Truncated or corrupt archives
    // - Unpaired .meta/.dat members
    // - Duplicate members under one base name
    // - Member sizes that do not match the payload
    // - Members outside the naming scheme
    if let Ok(mut reader) = ContainerReader::new(Cursor::new(data)) {
        for index in 0..reader.len() {
            let _ = reader.read_attributes(index);
            let _ = reader.read_data(index);
        }
        let _ = reader.read_entry(reader.len());
    }
});
