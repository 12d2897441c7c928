//! Fuzz target: storage size strings such as `"2G"` or `"512M"`.
#![no_main]

use firefleet_core::StorageSize;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(size) = StorageSize::parse(text) {
        // Accepted sizes render back to a string that parses to the same size.
        let again = StorageSize::parse(size.as_str());
        assert_eq!(again.ok(), Some(size));
    }
});
