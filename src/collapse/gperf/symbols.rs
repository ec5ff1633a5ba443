use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use once_cell::unsync::OnceCell;
use regex::Regex;

// readelf -W -S prints section headers as
//   [14] .text             PROGBITS        0000000000001060 001060 000185 00  AX  0   0 16
static TEXT_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.text\s+PROGBITS\s+([0-9a-fA-F]+)\s+([0-9a-fA-F]+)").unwrap());

/// A function symbol read from an object file.
#[derive(Debug)]
pub struct Symbol {
    /// The symbol's address in the object file, before it was loaded.
    pub address: u64,
    /// The (demangled) symbol name.
    pub name: String,
    simplified: OnceCell<String>,
}

impl Symbol {
    /// Creates a symbol at `address` named `name`.
    pub fn new<S: Into<String>>(address: u64, name: S) -> Self {
        Symbol {
            address,
            name: name.into(),
            simplified: OnceCell::new(),
        }
    }

    /// The symbol name without argument or template lists; see [`simplify`].
    ///
    /// Computed on first use and kept for subsequent calls.
    pub fn simplified_name(&self) -> &str {
        self.simplified.get_or_init(|| simplify(&self.name))
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.name == other.name
    }
}

impl Eq for Symbol {}

/// Something that can list the symbols defined by an object file.
pub trait SymbolSource {
    /// Returns the symbols defined in `object`, sorted by address.
    fn symbols(&self, object: &Path) -> io::Result<Vec<Symbol>>;
}

/// Where an object file's code section lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeSection {
    /// Virtual address of the section in the unlinked object.
    pub address: u64,
    /// Offset of the section within the object file.
    pub offset: u64,
}

impl CodeSection {
    /// The virtual address that file offset zero corresponds to.
    ///
    /// Adding a file offset to this yields the address used by the object's symbol table.
    pub fn pre_link_base(&self) -> u64 {
        self.address.wrapping_sub(self.offset)
    }
}

/// Something that can locate the code section of an object file.
pub trait SectionLookup {
    /// Returns the load information of the `.text` section of `object`, or `None` if the object
    /// has no such section.
    fn code_section(&self, object: &Path) -> io::Result<Option<CodeSection>>;
}

impl<T: SymbolSource + ?Sized> SymbolSource for &T {
    fn symbols(&self, object: &Path) -> io::Result<Vec<Symbol>> {
        (**self).symbols(object)
    }
}

impl<T: SectionLookup + ?Sized> SectionLookup for &T {
    fn code_section(&self, object: &Path) -> io::Result<Option<CodeSection>> {
        (**self).code_section(object)
    }
}

fn run<I, S>(program: &Path, args: I) -> io::Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to run `{}`: {}", program.display(), e),
            )
        })?;

    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "`{}` exited with {}: {}",
                program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Lists symbols with binutils' `nm`.
///
/// Defined symbols are listed first; if an object has none (a stripped shared library, for
/// example), its dynamic symbol table is used instead.
#[derive(Clone, Debug)]
pub struct Nm {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl Default for Nm {
    fn default() -> Self {
        Nm::new("nm")
    }
}

impl Nm {
    /// Uses `program` as the `nm` executable.
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Nm {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Passes `arg` before any `nm` options, e.g. the script path when `program` is an
    /// interpreter.
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.leading_args.push(arg.into());
        self
    }

    fn list(&self, object: &Path, dynamic: bool) -> io::Result<Vec<Symbol>> {
        let mut args: Vec<&OsStr> = self.leading_args.iter().map(OsStr::new).collect();
        args.extend([
            OsStr::new("-C"),
            OsStr::new("-n"),
            OsStr::new("--defined-only"),
            OsStr::new("--no-recurse-limit"),
        ]);
        if dynamic {
            args.push(OsStr::new("-D"));
        }
        args.push(object.as_os_str());
        Ok(parse_nm_output(&run(&self.program, args)?))
    }
}

impl SymbolSource for Nm {
    fn symbols(&self, object: &Path) -> io::Result<Vec<Symbol>> {
        let symbols = self.list(object, false)?;
        if !symbols.is_empty() {
            return Ok(symbols);
        }
        debug!(
            "No symbols in {}, falling back to dynamic symbols",
            object.display()
        );
        self.list(object, true)
    }
}

// Handle lines of the form:
//
// 0000000000001139 T main
// 0000000000001150 W std::vector<int, std::allocator<int> >::push_back(int const&)
fn parse_nm_output(output: &str) -> Vec<Symbol> {
    let mut symbols: Vec<Symbol> = output
        .lines()
        .filter_map(|line| {
            let (address, rest) = line.trim().split_once(char::is_whitespace)?;
            let (_kind, name) = rest.trim_start().split_once(char::is_whitespace)?;
            let address = u64::from_str_radix(address, 16).ok()?;
            Some(Symbol::new(address, name.trim_start()))
        })
        .collect();
    symbols.sort_by_key(|symbol| symbol.address);
    symbols
}

/// Reads section headers with binutils' `readelf`.
#[derive(Clone, Debug)]
pub struct Readelf {
    program: PathBuf,
}

impl Default for Readelf {
    fn default() -> Self {
        Readelf::new("readelf")
    }
}

impl Readelf {
    /// Uses `program` as the `readelf` executable.
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Readelf {
            program: program.into(),
        }
    }
}

impl SectionLookup for Readelf {
    fn code_section(&self, object: &Path) -> io::Result<Option<CodeSection>> {
        let output = run(
            &self.program,
            [OsStr::new("-W"), OsStr::new("-S"), object.as_os_str()],
        )?;
        Ok(parse_section_headers(&output))
    }
}

fn parse_section_headers(output: &str) -> Option<CodeSection> {
    let captures = TEXT_SECTION.captures(output)?;
    let address = u64::from_str_radix(&captures[1], 16).ok()?;
    let offset = u64::from_str_radix(&captures[2], 16).ok()?;
    Some(CodeSection { address, offset })
}

fn strip_brackets(s: &str, open: char, close: char) -> String {
    let mut result = String::with_capacity(s.len());
    let mut depth = 0usize;
    for c in s.chars() {
        if c == open {
            depth += 1;
        } else if c == close {
            // A stray closing bracket is dropped without affecting the depth.
            depth = depth.saturating_sub(1);
        } else if depth == 0 {
            result.push(c);
        }
    }
    result
}

/// Simplifies a demangled symbol name by removing every balanced `(...)`, `[...]` and `<...>`
/// group, including nested ones, and stripping leading and trailing `:`.
///
/// For example, `std::vector<int>::push_back(int const&)` becomes `std::vector::push_back`.
pub fn simplify(name: &str) -> String {
    let name = strip_brackets(name, '(', ')');
    let name = strip_brackets(&name, '[', ']');
    let name = strip_brackets(&name, '<', '>');
    name.trim_matches(':').to_string()
}

/// The symbols of one object file along with the information needed to look up runtime
/// addresses in it.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    pre_link_base: u64,
}

impl SymbolTable {
    /// Creates a table from `symbols` and the object's pre-link base address.
    ///
    /// `symbols` are (stably) sorted by address, so that among symbols sharing an address the
    /// last one given is the one found by [`SymbolTable::lookup`].
    pub fn new(mut symbols: Vec<Symbol>, pre_link_base: u64) -> Self {
        symbols.sort_by_key(|symbol| symbol.address);
        SymbolTable {
            symbols,
            pre_link_base,
        }
    }

    /// Loads the symbols of `object` and computes its pre-link base address.
    ///
    /// An object without a `.text` section gets a base address of zero; lookups in it are best
    /// effort.
    pub fn load<S, L>(object: &Path, symbols: &S, sections: &L) -> io::Result<Self>
    where
        S: SymbolSource + ?Sized,
        L: SectionLookup + ?Sized,
    {
        let list = symbols.symbols(object)?;
        let pre_link_base = match sections.code_section(object)? {
            Some(section) => section.pre_link_base(),
            None => {
                warn!(
                    "No .text section found in {}, symbols may be wrong",
                    object.display()
                );
                0
            }
        };
        info!(
            "Loaded {} symbols from {} (base address {:#x})",
            list.len(),
            object.display(),
            pre_link_base
        );
        Ok(SymbolTable::new(list, pre_link_base))
    }

    /// The address that file offset zero of the object maps to before linking.
    pub fn pre_link_base(&self) -> u64 {
        self.pre_link_base
    }

    /// The number of symbols in the table.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the table has no symbols at all.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Finds the last symbol at or before `address`.
    pub fn lookup(&self, address: u64) -> Option<&Symbol> {
        let idx = self
            .symbols
            .partition_point(|symbol| symbol.address <= address);
        idx.checked_sub(1).map(|idx| &self.symbols[idx])
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::HashMap;
    #[cfg(unix)]
    use std::fs;

    use super::*;

    #[test]
    fn lookup_finds_nearest_preceding_symbol() {
        let table = SymbolTable::new(
            vec![
                Symbol::new(300, "c"),
                Symbol::new(100, "a"),
                Symbol::new(200, "b"),
            ],
            0,
        );
        assert_eq!(table.lookup(250).map(|s| s.name.as_str()), Some("b"));
        assert_eq!(table.lookup(200).map(|s| s.name.as_str()), Some("b"));
        assert_eq!(table.lookup(100).map(|s| s.name.as_str()), Some("a"));
        assert_eq!(table.lookup(u64::MAX).map(|s| s.name.as_str()), Some("c"));
        assert_eq!(table.lookup(50), None);
        assert_eq!(table.lookup(99), None);
    }

    #[test]
    fn lookup_prefers_last_symbol_at_an_address() {
        let table = SymbolTable::new(
            vec![
                Symbol::new(100, "first"),
                Symbol::new(200, "alias_one"),
                Symbol::new(200, "alias_two"),
            ],
            0,
        );
        assert_eq!(
            table.lookup(250).map(|s| s.name.as_str()),
            Some("alias_two")
        );
    }

    #[test]
    fn empty_table_resolves_nothing() {
        let table = SymbolTable::default();
        assert!(table.is_empty());
        assert_eq!(table.lookup(0), None);
    }

    #[test]
    fn parses_nm_output() {
        let output = "\
                 U free@GLIBC_2.2.5
0000000000001000 T _init
0000000000001150 W std::vector<int, std::allocator<int> >::push_back(int const&)
0000000000001139 T main

/tmp/app:
";
        let symbols = parse_nm_output(output);
        assert_eq!(
            symbols,
            vec![
                Symbol::new(0x1000, "_init"),
                Symbol::new(0x1139, "main"),
                Symbol::new(
                    0x1150,
                    "std::vector<int, std::allocator<int> >::push_back(int const&)"
                ),
            ]
        );
    }

    #[test]
    fn parses_readelf_text_section() {
        let output = "\
  [12] .plt.got          PROGBITS        0000000000001030 001030 000008 08  AX  0   0  8
  [13] .rela.text        RELA            0000000000000000 0002f8 000018 18   I 21   1  8
  [14] .text             PROGBITS        0000000000401060 001060 000185 00  AX  0   0 16
  [15] .fini             PROGBITS        00000000004011e8 0011e8 00000d 00  AX  0   0  4
";
        let section = parse_section_headers(output).unwrap();
        assert_eq!(
            section,
            CodeSection {
                address: 0x401060,
                offset: 0x1060,
            }
        );
        assert_eq!(section.pre_link_base(), 0x400000);
    }

    #[test]
    fn missing_text_section() {
        let output = "  [1] .data  PROGBITS  0000000000004000 003000 000010 00  WA  0   0  8\n";
        assert_eq!(parse_section_headers(output), None);
    }

    struct FixedSymbols(HashMap<PathBuf, Vec<(u64, &'static str)>>);

    impl SymbolSource for FixedSymbols {
        fn symbols(&self, object: &Path) -> io::Result<Vec<Symbol>> {
            Ok(self.0[object]
                .iter()
                .map(|&(address, name)| Symbol::new(address, name))
                .collect())
        }
    }

    struct NoSections(Cell<usize>);

    impl SectionLookup for NoSections {
        fn code_section(&self, _: &Path) -> io::Result<Option<CodeSection>> {
            self.0.set(self.0.get() + 1);
            Ok(None)
        }
    }

    #[test]
    fn load_defaults_base_to_zero_without_text_section() {
        let path = PathBuf::from("/lib/libfoo.so");
        let mut map = HashMap::new();
        map.insert(path.clone(), vec![(0x20, "bar"), (0x10, "foo")]);
        let lookups = NoSections(Cell::new(0));

        let table = SymbolTable::load(&path, &FixedSymbols(map), &lookups).unwrap();
        assert_eq!(lookups.0.get(), 1);
        assert_eq!(table.pre_link_base(), 0);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(0x18).map(|s| s.name.as_str()), Some("foo"));
    }

    #[test]
    fn collaborator_failures_are_errors() {
        let nm = Nm::new("/nonexistent/bin/nm");
        assert!(nm.symbols(Path::new("/bin/true")).is_err());
        let readelf = Readelf::new("/nonexistent/bin/readelf");
        assert!(readelf.code_section(Path::new("/bin/true")).is_err());
    }

    // Run through `sh` rather than executing the freshly written file, which can fail with
    // ETXTBSY while other test threads fork.
    #[cfg(unix)]
    fn stand_in_nm(dir: &Path, body: &str) -> (Nm, PathBuf) {
        let script = dir.join("nm.sh");
        let calls = dir.join("calls.log");
        fs::write(
            &script,
            format!(
                "printf '%s\\n' \"$*\" >> '{}'\n{}\n",
                calls.display(),
                body
            ),
        )
        .unwrap();
        (Nm::new("/bin/sh").arg(script.to_string_lossy()), calls)
    }

    #[cfg(unix)]
    #[test]
    fn nm_falls_back_to_dynamic_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let (nm, calls) = stand_in_nm(
            dir.path(),
            r#"case " $* " in
  *" -D "*) printf '0000000000002000 T dyn_entry\n0000000000001000 T dyn_init\n' ;;
esac"#,
        );

        let symbols = nm.symbols(Path::new("/lib/libstripped.so")).unwrap();
        assert_eq!(
            symbols,
            vec![
                Symbol::new(0x1000, "dyn_init"),
                Symbol::new(0x2000, "dyn_entry"),
            ]
        );
        assert_eq!(
            fs::read_to_string(&calls).unwrap(),
            "-C -n --defined-only --no-recurse-limit /lib/libstripped.so\n\
             -C -n --defined-only --no-recurse-limit -D /lib/libstripped.so\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn nm_uses_defined_symbols_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let (nm, calls) = stand_in_nm(dir.path(), "echo '0000000000001139 T main'");

        let symbols = nm.symbols(Path::new("/opt/app")).unwrap();
        assert_eq!(symbols, vec![Symbol::new(0x1139, "main")]);
        assert_eq!(fs::read_to_string(&calls).unwrap().lines().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn nm_without_any_symbols_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (nm, calls) = stand_in_nm(dir.path(), "exit 0");

        let symbols = nm.symbols(Path::new("/opt/app")).unwrap();
        assert!(symbols.is_empty());
        assert_eq!(fs::read_to_string(&calls).unwrap().lines().count(), 2);

        let table = SymbolTable::new(symbols, 0);
        assert!(table.is_empty());
    }

    #[test]
    fn simplify_strips_argument_and_template_lists() {
        assert_eq!(
            simplify("std::vector<int, std::allocator<int> >::push_back(int const&)"),
            "std::vector::push_back"
        );
        assert_eq!(simplify("foo::bar(int) const"), "foo::bar const");
        assert_eq!(simplify("operator new[](unsigned long)"), "operator new");
        assert_eq!(simplify("main"), "main");
        assert_eq!(simplify("::global_fn()"), "global_fn");
    }

    // Whole groups go away, contents included. A stripper that forgets to increment its depth on
    // an opening bracket turns this into `fooint` instead, and keeping the argument list's
    // contents would give `foo::baz`; neither is a simplified name.
    #[test]
    fn simplify_removes_group_contents() {
        assert_eq!(simplify("foo<int>(bar::baz)"), "foo");
    }

    #[test]
    fn simplify_tracks_nesting() {
        assert_eq!(simplify("a<b<c<d>>>::e(f(g), h)"), "a::e");
        assert_eq!(simplify("a[[x]]b"), "ab");
    }

    #[test]
    fn simplify_ignores_stray_closing_brackets() {
        assert_eq!(simplify("a)b"), "ab");
        assert_eq!(simplify("a>b(c)"), "ab");
    }

    #[test]
    fn simplified_name_is_memoized() {
        let symbol = Symbol::new(0x10, "ns::f(int)");
        let first = symbol.simplified_name() as *const str;
        let second = symbol.simplified_name() as *const str;
        assert_eq!(symbol.simplified_name(), "ns::f");
        assert_eq!(first, second);
    }
}
