//! This crate turns CPU profiles written by the [gperftools] sampling profiler into [flame
//! graphs]. It follows the two "stages" of Brendan Gregg's original [flamegraph toolkit]: stack
//! collapsing and plotting. Collapsing is available through the [`collapse`] module, and plotting
//! is delegated to a renderer from the [`flamegraph`] module.
//!
//! # Command-line use
//!
//! ## Recording a profile
//!
//! Link your program against `libprofiler` (or preload it) and point `CPUPROFILE` at the file the
//! profile should be written to:
//!
//! ```console
//! $ CPUPROFILE=app.prof ./target/release/app
//! ```
//!
//! The resulting file holds the raw program counters of every sampled call stack, followed by a
//! copy of the process memory map at the time the profile was written.
//!
//! ## Collapsing stacks
//!
//! Raw program counters are runtime addresses, so before they can be looked up in a symbol table
//! they must be moved back into the address space of the object file they came from. For every
//! executable mapping in the profile's memory map, `gperf-flamegraph` asks `nm` for the object's
//! symbols and `readelf` for the load address of its `.text` section, and uses both to name each
//! frame. Identical stacks are then "collapsed" into a single line along with a count of how many
//! times they were seen:
//!
//! ```console
//! $ gperf-flamegraph ./target/release/app app.prof --text-output app.folded
//! ```
//!
//! ## Producing a flame graph
//!
//! Pass `--svg-output` to plot the folded stacks straight away. By default the image is rendered
//! in-process with [inferno]; `--flamegraph-script` hands the folded stacks to an external
//! `flamegraph.pl` instead:
//!
//! ```console
//! $ gperf-flamegraph ./target/release/app app.prof --svg-output app.svg --to-microsecond
//! ```
//!
//!   [gperftools]: https://github.com/gperftools/gperftools
//!   [flame graphs]: http://www.brendangregg.com/flamegraphs.html
//!   [flamegraph toolkit]: https://github.com/brendangregg/FlameGraph
//!   [inferno]: https://github.com/jonhoo/inferno

#![deny(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

#[macro_use]
extern crate log;

macro_rules! invalid_data_error {
    ($($arg:tt)*) => {
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!($($arg)*),
        ))
    };
}

/// Stack collapsing for gperftools CPU profiles.
///
/// See the [crate-level documentation] for details.
///
///   [crate-level documentation]: ../index.html
pub mod collapse;

/// Renderers that turn folded stack lines into flame graph SVGs.
///
/// See the [crate-level documentation] for details.
///
///   [crate-level documentation]: ../index.html
pub mod flamegraph;

/// Output files that only appear once they have been written completely.
pub mod output;
