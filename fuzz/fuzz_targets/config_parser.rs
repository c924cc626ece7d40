#![no_main]

use gpu_tracer::TracerConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = TracerConfig::from_json_str(text);
    }
});
