#![no_main]

use gperf_flamegraph::collapse::gperf::profile;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    profile::parse(data).ok();
});
