#![no_main]

use gperf_flamegraph::collapse::gperf::{Folder, Options};
use gperf_flamegraph::collapse::Collapse;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // No mapping can name a readable file, so nm and readelf are never run.
    let mut options = Options::default();
    options.executable_only = true;
    Folder::new("/nonexistent/fuzz-target", options)
        .collapse(data, std::io::sink())
        .ok();
});
