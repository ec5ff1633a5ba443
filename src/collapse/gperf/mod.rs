/// Executable mappings from the memory map stored in a profile.
pub mod maps;

/// Decoding of the binary profile format.
pub mod profile;

/// Translation of runtime program counters into symbol names.
pub mod resolve;

/// Symbol tables of object files, read with binutils.
pub mod symbols;

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};

use self::profile::{Profile, StackSample};
use self::resolve::{Resolver, UNKNOWN_SYMBOL};
use self::symbols::{Nm, Readelf, SectionLookup, SymbolSource};
use crate::collapse::common::Occurrences;
use crate::collapse::{Collapse, CAPACITY_READER};
use crate::flamegraph;

/// What the counts of the folded stacks measure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Unit {
    /// The number of samples a stack was seen in.
    #[default]
    Samples,
    /// Samples multiplied by the sampling period, in microseconds.
    Microseconds,
}

/// Settings that change how frames are named and stacks are weighted.
///
/// All options default to off.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Options {
    /// Remove argument and template lists from symbol names.
    pub simplify_symbols: bool,

    /// Only resolve frames that belong to the executable, leaving library frames unresolved.
    pub executable_only: bool,

    /// Append `[libname.so]` to frames that belong to shared libraries.
    pub annotate_libname: bool,

    /// What stack counts measure. Default is `Unit::Samples`.
    pub unit: Unit,
}

/// A stack collapser for gperftools CPU profiles.
///
/// Symbols are looked up with `nm` and `readelf` by default; use [`Folder::with_tools`] to
/// supply other implementations.
pub struct Folder<S = Nm, L = Readelf> {
    /// The profiled executable.
    executable: PathBuf,
    opt: Options,
    symbols: S,
    sections: L,
}

impl Folder {
    /// Creates a folder for profiles of `executable`, inspecting object files with binutils.
    pub fn new<P: Into<PathBuf>>(executable: P, opt: Options) -> Self {
        Folder::with_tools(executable, opt, Nm::default(), Readelf::default())
    }
}

impl<S, L> Folder<S, L>
where
    S: SymbolSource,
    L: SectionLookup,
{
    /// Creates a folder that lists symbols with `symbols` and finds code sections with
    /// `sections`.
    pub fn with_tools<P: Into<PathBuf>>(
        executable: P,
        opt: Options,
        symbols: S,
        sections: L,
    ) -> Self {
        Folder {
            executable: executable.into(),
            opt,
            symbols,
            sections,
        }
    }

    /// Reads a profile from `reader` and folds its stacks.
    pub fn fold<R: Read>(&mut self, reader: R) -> io::Result<Folded> {
        let profile = profile::parse(reader)?;
        self.fold_profile(&profile)
    }

    /// Reads the profile stored at `path` and folds its stacks.
    pub fn fold_file<P: AsRef<Path>>(&mut self, path: P) -> io::Result<Folded> {
        let file = File::open(path)?;
        self.fold(io::BufReader::with_capacity(CAPACITY_READER, file))
    }

    /// Folds the stacks of an already decoded profile.
    pub fn fold_profile(&mut self, profile: &Profile) -> io::Result<Folded> {
        let regions = maps::parse(
            &self.executable,
            &profile.memory_map,
            self.opt.executable_only,
        );
        let mut resolver = Resolver::load(regions, &self.symbols, &self.sections)?
            .simplify_symbols(self.opt.simplify_symbols)
            .annotate_libname(self.opt.annotate_libname);

        let pcs: AHashSet<u64> = profile
            .samples
            .iter()
            .flat_map(|sample| sample.pcs.iter().copied())
            .collect();
        let symbols = resolver.resolve_batch(pcs);
        info!(
            "Resolved {} of {} distinct program counters",
            symbols.len(),
            resolver.resolved_count()
        );

        let mut occurrences = Occurrences::new();
        for sample in &profile.samples {
            self.on_sample(sample, profile.sampling_period, &symbols, &mut occurrences);
        }

        Ok(Folded {
            occurrences,
            unit: self.opt.unit,
        })
    }

    fn on_sample(
        &self,
        sample: &StackSample,
        sampling_period: u64,
        symbols: &AHashMap<u64, String>,
        occurrences: &mut Occurrences,
    ) {
        let stack = match fold_stack(&sample.pcs, symbols) {
            Some(stack) => stack,
            None => {
                trace!("Skipping empty stack sample");
                return;
            }
        };
        let count = match self.opt.unit {
            Unit::Samples => sample.weight,
            Unit::Microseconds => sample.weight.saturating_mul(sampling_period),
        };
        occurrences.insert_or_add(stack, count);
    }
}

impl<S, L> Collapse for Folder<S, L>
where
    S: SymbolSource,
    L: SectionLookup,
{
    fn collapse<R, W>(&mut self, reader: R, writer: W) -> io::Result<()>
    where
        R: io::BufRead,
        W: io::Write,
    {
        self.fold(reader)?.write(writer)
    }
}

/// Joins the names of a leaf-first stack of program counters into a root-first folded stack.
///
/// Unresolved frames at the leaf end of the stack are dropped, but at least one frame is always
/// kept. Returns `None` for an empty stack.
fn fold_stack(pcs: &[u64], symbols: &AHashMap<u64, String>) -> Option<String> {
    let mut frames: Vec<&str> = pcs
        .iter()
        .rev()
        .map(|pc| symbols.get(pc).map_or(UNKNOWN_SYMBOL, String::as_str))
        .collect();
    while frames.len() > 1 && frames.last() == Some(&UNKNOWN_SYMBOL) {
        frames.pop();
    }
    if frames.is_empty() {
        None
    } else {
        Some(frames.join(";"))
    }
}

/// The folded stacks of a profile.
#[derive(Clone, Debug)]
pub struct Folded {
    occurrences: Occurrences,
    unit: Unit,
}

impl Folded {
    /// Writes one `<stack> <count>` line per distinct stack.
    pub fn write<W: io::Write>(&self, writer: W) -> io::Result<()> {
        self.occurrences.write(writer)
    }

    /// The accumulated count of `stack`, if it was seen at all.
    pub fn get(&self, stack: &str) -> Option<u64> {
        self.occurrences.get(stack)
    }

    /// The number of distinct stacks.
    pub fn len(&self) -> usize {
        self.occurrences.len()
    }

    /// Whether the profile had no (non-empty) stacks at all.
    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }

    /// What the counts measure.
    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Renderer options matching these stacks; microsecond counts are labelled `us`.
    pub fn flamegraph_options(&self) -> flamegraph::Options {
        let mut options = flamegraph::Options::default();
        if self.unit == Unit::Microseconds {
            options.count_name = Some("us".to_string());
        }
        options
    }
}
