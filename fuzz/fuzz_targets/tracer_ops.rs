#![no_main]

use gpu_tracer::fuzz_tracer_ops;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    fuzz_tracer_ops(data);
});
