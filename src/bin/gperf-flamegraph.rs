use std::io::{self, Write};
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use env_logger::Env;
use gperf_flamegraph::collapse::gperf::symbols::{Nm, Readelf};
use gperf_flamegraph::collapse::gperf::{Folder, Options, Unit};
use gperf_flamegraph::collapse::Collapse;
use gperf_flamegraph::flamegraph::{Inferno, Render, Script};
use gperf_flamegraph::output::{self, StagedFile};

#[derive(Debug, Parser)]
#[clap(
    name = "gperf-flamegraph",
    about,
    after_help = "\
[1] Profiles are written by gperftools' libprofiler, eg:
        CPUPROFILE=app.prof ./app
    Symbols are read with nm and readelf from binutils.
    If neither --text-output nor --svg-output is given, folded stacks are written to STDOUT."
)]
struct Opt {
    // ************* //
    // *** FLAGS *** //
    // ************* //
    /// Simplify symbols, remove template args and function args
    #[clap(long = "simplify-symbol")]
    simplify_symbol: bool,

    /// Only resolve the executable binary
    #[clap(long = "executable-only")]
    executable_only: bool,

    /// Append "[libname.so]" to final symbols
    #[clap(long = "annotate-libname")]
    annotate_libname: bool,

    /// Use microsecond as the result unit
    #[clap(long = "to-microsecond")]
    to_microsecond: bool,

    /// Silence all log output
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose logging mode (-v, -vv, -vvv)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    // *************** //
    // *** OPTIONS *** //
    // *************** //
    /// The output .svg path
    #[clap(long = "svg-output", value_name = "PATH")]
    svg_output: Option<PathBuf>,

    /// The output .txt path for folded stacks
    #[clap(long = "text-output", value_name = "PATH")]
    text_output: Option<PathBuf>,

    /// Render with this flamegraph.pl-compatible script instead of the built-in renderer
    #[clap(long = "flamegraph-script", value_name = "PATH")]
    flamegraph_script: Option<PathBuf>,

    /// Extra argument for the flamegraph script (may be repeated)
    #[clap(
        long = "flamegraph-arg",
        value_name = "ARG",
        allow_hyphen_values = true,
        action = ArgAction::Append
    )]
    flamegraph_args: Vec<String>,

    /// nm executable used to list symbols
    #[clap(long = "nm", value_name = "PATH", default_value = "nm")]
    nm: PathBuf,

    /// readelf executable used to find code sections
    #[clap(long = "readelf", value_name = "PATH", default_value = "readelf")]
    readelf: PathBuf,

    // ************ //
    // *** ARGS *** //
    // ************ //
    /// Path to the executable binary
    #[clap(value_name = "EXE")]
    exe: PathBuf,

    /// Path to the cpu profiler result
    #[clap(value_name = "PROF")]
    prof: PathBuf,
}

struct Outputs {
    text: Option<PathBuf>,
    svg: Option<PathBuf>,
    renderer: Box<dyn Render>,
    flamegraph_args: Vec<String>,
}

impl Opt {
    fn into_parts(self) -> (PathBuf, PathBuf, Options, Nm, Readelf, Outputs) {
        let mut options = Options::default();
        options.simplify_symbols = self.simplify_symbol;
        options.executable_only = self.executable_only;
        options.annotate_libname = self.annotate_libname;
        options.unit = if self.to_microsecond {
            Unit::Microseconds
        } else {
            Unit::Samples
        };
        let renderer: Box<dyn Render> = match self.flamegraph_script {
            Some(script) => Box::new(Script::new(script)),
            None => Box::new(Inferno),
        };
        (
            self.exe,
            self.prof,
            options,
            Nm::new(self.nm),
            Readelf::new(self.readelf),
            Outputs {
                text: self.text_output,
                svg: self.svg_output,
                renderer,
                flamegraph_args: self.flamegraph_args,
            },
        )
    }
}

fn main() -> io::Result<()> {
    let opt = Opt::parse();

    // Initialize logger
    if !opt.quiet {
        env_logger::Builder::from_env(Env::default().default_filter_or(match opt.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }))
        .format_timestamp(None)
        .init();
    }

    let (exe, prof, options, nm, readelf, outputs) = opt.into_parts();
    let mut folder = Folder::with_tools(exe, options, nm, readelf);
    if outputs.text.is_none() && outputs.svg.is_none() {
        return folder.collapse_file_to_stdout(Some(&prof));
    }

    let folded = folder.fold_file(&prof)?;

    // Everything is staged first so that a failure leaves no output file behind.
    let mut text = Vec::new();
    folded.write(&mut text)?;
    let mut staged = Vec::new();
    if let Some(ref path) = outputs.text {
        let mut file = StagedFile::create(path)?;
        file.write_all(&text)?;
        staged.push(file);
    }
    if let Some(ref path) = outputs.svg {
        let mut flamegraph_options = folded.flamegraph_options();
        flamegraph_options.extra_args = outputs.flamegraph_args;
        let mut file = StagedFile::create(path)?;
        outputs
            .renderer
            .render(&text, &flamegraph_options, &mut file)?;
        staged.push(file);
    }
    output::persist_all(staged)
}
