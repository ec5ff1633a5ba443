/// Stack collapsing for the CPU profiles written by
/// [gperftools](https://github.com/gperftools/gperftools)' `libprofiler`.
///
/// See the [crate-level documentation] for details.
///
///   [crate-level documentation]: ../../index.html
pub mod gperf;

pub(crate) mod common;

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use is_terminal::IsTerminal;

pub(crate) const CAPACITY_READER: usize = 128 * 1024;

/// The abstract behavior of stack collapsing.
///
/// Implementors of this trait are providing a way to take the stack samples stored in a
/// particular profiler's output and produce lines in the folded stack format expected by flame
/// graph renderers such as the ones in [`crate::flamegraph`].
///
/// See also the [crate-level documentation] for details.
///
///   [crate-level documentation]: ../index.html
pub trait Collapse {
    /// Collapses the contents of the provided `reader` and writes folded stack lines to the
    /// provided `writer`.
    fn collapse<R, W>(&mut self, reader: R, writer: W) -> io::Result<()>
    where
        R: io::BufRead,
        W: io::Write;

    /// Collapses the contents of a file (or of STDIN if `infile` is `None`) and writes folded
    /// stack lines to provided `writer`.
    fn collapse_file<P, W>(&mut self, infile: Option<P>, writer: W) -> io::Result<()>
    where
        P: AsRef<Path>,
        W: Write,
    {
        match infile {
            Some(ref path) => {
                let file = File::open(path)?;
                let reader = io::BufReader::with_capacity(CAPACITY_READER, file);
                self.collapse(reader, writer)
            }
            None => {
                let stdio = io::stdin();
                let stdio_guard = stdio.lock();
                let reader = io::BufReader::with_capacity(CAPACITY_READER, stdio_guard);
                self.collapse(reader, writer)
            }
        }
    }

    /// Collapses the contents of a file (or of STDIN if `infile` is `None`) and writes folded
    /// stack lines to `STDOUT`.
    fn collapse_file_to_stdout<P>(&mut self, infile: Option<P>) -> io::Result<()>
    where
        P: AsRef<Path>,
    {
        if io::stdout().is_terminal() {
            self.collapse_file(infile, io::stdout().lock())
        } else {
            self.collapse_file(infile, io::BufWriter::new(io::stdout().lock()))
        }
    }
}
