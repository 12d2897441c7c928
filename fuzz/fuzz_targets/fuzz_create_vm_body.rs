//! Fuzz target: JSON deserialization and validation of `CreateVmRequest`.
//!
//! Arbitrary bytes posted to `/create_vm` must never panic the parser or the
//! validator. Rejections are expected.

#![no_main]

use firefleet_core::CreateVmRequest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(request) = serde_json::from_slice::<CreateVmRequest>(data) {
        if request.validate().is_ok() {
            // A valid request always names a positive amount of each resource.
            assert!(request.template.cpu > 0);
            assert!(request.template.ram > 0);
            assert!(request.template.storage.bytes() > 0);
        }
    }
});
