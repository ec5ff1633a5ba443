use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

/// Settings passed on to a flame graph renderer.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// What the stack counts measure, e.g. `us`. Renderers fall back to `samples`.
    pub count_name: Option<String>,

    /// Additional command-line arguments for external renderers.
    pub extra_args: Vec<String>,
}

/// Something that can plot folded stack lines as an SVG flame graph.
pub trait Render {
    /// Renders the `<stack> <count>` lines in `folded` and writes the SVG to `writer`.
    fn render(&self, folded: &[u8], opt: &Options, writer: &mut dyn Write) -> io::Result<()>;
}

/// Renders flame graphs in-process with [inferno](https://github.com/jonhoo/inferno).
#[derive(Clone, Copy, Debug, Default)]
pub struct Inferno;

impl Render for Inferno {
    fn render(&self, folded: &[u8], opt: &Options, writer: &mut dyn Write) -> io::Result<()> {
        if !opt.extra_args.is_empty() {
            warn!(
                "Ignoring flame graph arguments {:?}, only external scripts take them",
                opt.extra_args
            );
        }
        let folded = std::str::from_utf8(folded)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut options = inferno::flamegraph::Options::default();
        if let Some(ref count_name) = opt.count_name {
            options.count_name = count_name.clone();
        }
        inferno::flamegraph::from_lines(&mut options, folded.lines(), writer)
    }
}

/// Renders flame graphs with an external script such as Brendan Gregg's `flamegraph.pl`.
///
/// The folded stacks are written to the script's standard input and the SVG is read from its
/// standard output.
#[derive(Clone, Debug)]
pub struct Script {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl Script {
    /// Uses the script at `program`.
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Script {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Passes `arg` before any flame graph options, e.g. the script path when `program` is an
    /// interpreter.
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.leading_args.push(arg.into());
        self
    }

    /// The script this renderer runs.
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn args(&self, opt: &Options) -> Vec<String> {
        let mut args = self.leading_args.clone();
        if let Some(ref count_name) = opt.count_name {
            args.push("--countname".to_string());
            args.push(count_name.clone());
        }
        args.extend(opt.extra_args.iter().cloned());
        args
    }
}

impl Render for Script {
    fn render(&self, folded: &[u8], opt: &Options, writer: &mut dyn Write) -> io::Result<()> {
        let args = self.args(opt);
        debug!("Running {} {:?}", self.program.display(), args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to run `{}`: {}", self.program.display(), e),
                )
            })?;

        // Feed stdin from another thread so a script that starts writing before it has read all
        // of its input cannot deadlock us.
        let stdin = child.stdin.take();
        let (output, fed) = thread::scope(|scope| {
            let feeder = scope.spawn(move || match stdin {
                Some(mut stdin) => stdin.write_all(folded),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            let fed = match feeder.join() {
                Ok(fed) => fed,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::Other,
                    "stdin feeder panicked",
                )),
            };
            (output, fed)
        });

        let output = output?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "`{}` exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        if let Err(e) = fed {
            // The script succeeded without reading all of its input.
            if e.kind() != io::ErrorKind::BrokenPipe {
                return Err(e);
            }
        }
        writer.write_all(&output.stdout)?;
        writer.flush()
    }
}
