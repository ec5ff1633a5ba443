#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Cursor};
use std::path::Path;

use gperf_flamegraph::collapse::gperf::symbols::{
    CodeSection, SectionLookup, Symbol, SymbolSource,
};
use gperf_flamegraph::collapse::Collapse;
use pretty_assertions::assert_eq;
use testing_logger::CapturedLog;

pub fn compare_results<R, E>(result: R, mut expected: E, expected_file: &str)
where
    R: BufRead,
    E: BufRead,
{
    let mut buf = String::new();
    let mut line_num = 1;
    for line in result.lines() {
        let line = line.unwrap();
        if expected.read_line(&mut buf).unwrap() == 0 {
            panic!(
                "\noutput has more lines than expected result file: {}",
                expected_file
            );
        }
        assert_eq!(line, buf.trim_end(), "\n{}:{}", expected_file, line_num);
        buf.clear();
        line_num += 1;
    }

    if expected.read_line(&mut buf).unwrap() > 0 {
        panic!(
            "\n{} has more lines than output, beginning at line: {}",
            expected_file, line_num
        )
    }
}

pub fn test_collapse<C>(
    mut collapser: C,
    test_filename: &str,
    expected_filename: &str,
) -> io::Result<()>
where
    C: Collapse,
{
    if let Err(e) = fs::metadata(test_filename) {
        eprintln!("Failed to open input file '{}'", test_filename);
        return Err(e);
    }

    let mut result = Cursor::new(Vec::new());
    collapser.collapse_file(Some(test_filename), &mut result)?;
    result.set_position(0);

    let expected = match File::open(expected_filename) {
        Ok(f) => BufReader::new(f),
        Err(e) => {
            eprintln!("Tried to open {}.", expected_filename);
            return Err(e);
        }
    };
    compare_results(result, expected, expected_filename);
    Ok(())
}

pub fn test_collapse_logs<C, F>(mut collapser: C, input_file: &str, asserter: F)
where
    C: Collapse,
    F: Fn(&Vec<CapturedLog>),
{
    testing_logger::setup();
    let r = BufReader::new(File::open(input_file).unwrap());
    collapser.collapse(r, io::sink()).unwrap();
    testing_logger::validate(asserter);
}

pub fn test_collapse_error<C>(mut collapser: C, test_filename: &str) -> io::Error
where
    C: Collapse,
{
    if fs::metadata(test_filename).is_err() {
        panic!("Failed to open input file '{}'", test_filename);
    }
    collapser
        .collapse_file(Some(test_filename), io::sink())
        .expect_err("Expected an error")
}

/// Symbol tables for the files under `tests/data/collapse-gperf`, keyed by file name, so the
/// tests do not depend on binutils or on real object files.
#[derive(Default)]
pub struct Tools {
    symbols: HashMap<&'static str, Vec<(u64, &'static str)>>,
    sections: HashMap<&'static str, CodeSection>,
}

impl Tools {
    pub fn demo() -> Self {
        let mut tools = Tools::default();
        tools.symbols.insert(
            "app",
            vec![
                (0x1000, "main"),
                (0x1040, "parse_args(int, char**)"),
                (0x1100, "Engine::run()"),
                (0x1180, "Engine::step<double>(double)"),
                (
                    0x1200,
                    "std::vector<double, std::allocator<double> >::push_back(double const&)",
                ),
            ],
        );
        tools.symbols.insert(
            "libdemo.so",
            vec![(0x2000, "demo_compute"), (0x2080, "demo::helper(int)")],
        );
        tools.sections.insert(
            "app",
            CodeSection {
                address: 0x1060,
                offset: 0x1060,
            },
        );
        tools.sections.insert(
            "libdemo.so",
            CodeSection {
                address: 0x2100,
                offset: 0x1100,
            },
        );
        tools
    }

    pub fn without_sections(mut self) -> Self {
        self.sections.clear();
        self
    }
}

fn file_name(object: &Path) -> String {
    object
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl SymbolSource for Tools {
    fn symbols(&self, object: &Path) -> io::Result<Vec<Symbol>> {
        Ok(self
            .symbols
            .get(file_name(object).as_str())
            .map(|list| {
                list.iter()
                    .map(|&(address, name)| Symbol::new(address, name))
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl SectionLookup for Tools {
    fn code_section(&self, object: &Path) -> io::Result<Option<CodeSection>> {
        Ok(self.sections.get(file_name(object).as_str()).copied())
    }
}
