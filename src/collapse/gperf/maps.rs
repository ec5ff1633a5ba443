use std::fs::File;
use std::path::{Path, PathBuf};

// Lines of this form carry the build id of the profiled binary rather than a mapping.
static BUILD_ID_PREFIX: &str = "build=";

/// An executable mapping from the profiled process' address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedRegion {
    /// First runtime address of the mapping.
    pub start: u64,
    /// One past the last runtime address of the mapping.
    pub end: u64,
    /// Offset of the mapping within its backing file.
    pub offset: u64,
    /// The file backing the mapping.
    pub path: PathBuf,
    /// Whether the mapping belongs to the profiled executable itself, as opposed to a shared
    /// library.
    pub is_primary: bool,
}

impl MappedRegion {
    /// Whether `pc` falls within `[start, end)`.
    pub fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end
    }

    /// The file name of the backing file, used to annotate library frames.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

fn is_readable(path: &Path) -> bool {
    path.is_file() && File::open(path).is_ok()
}

// Handle lines of the form:
//
// 00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
fn parse_line(line: &str) -> Option<(u64, u64, u64, &str)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 6 || !fields[1].contains('x') {
        return None;
    }

    let (start, end) = fields[0].split_once('-')?;
    let parsed = (
        u64::from_str_radix(start, 16),
        u64::from_str_radix(end, 16),
        u64::from_str_radix(fields[2], 16),
    );
    match parsed {
        (Ok(start), Ok(end), Ok(offset)) if start < end => Some((start, end, offset, fields[5])),
        _ => {
            warn!("Ignoring malformed memory map line: {}", line);
            None
        }
    }
}

/// Extracts the executable mappings from the text of a `/proc/<pid>/maps` style memory map.
///
/// A mapping whose backing file has the same file name as `executable` is considered to be the
/// executable itself, and its path is replaced with `executable` so that relative or symlinked
/// paths in the map do not matter. With `executable_only`, every other mapping is ignored.
///
/// Mappings whose backing file cannot be read (`[vdso]`, deleted files, ...) are skipped; program
/// counters that fall inside them stay unresolved.
pub fn parse(executable: &Path, text: &str, executable_only: bool) -> Vec<MappedRegion> {
    let executable_name = executable.file_name();
    let mut regions = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(BUILD_ID_PREFIX) {
            continue;
        }

        let (start, end, offset, path) = match parse_line(line) {
            Some(parts) => parts,
            None => continue,
        };

        let mut path = PathBuf::from(path);
        let is_primary = executable_name.is_some() && path.file_name() == executable_name;
        if is_primary {
            path = executable.to_path_buf();
        } else if executable_only {
            continue;
        }

        if !is_readable(&path) {
            debug!("Skipping unreadable mapping {}", path.display());
            continue;
        }

        regions.push(MappedRegion {
            start,
            end,
            offset,
            path,
            is_primary,
        });
    }

    info!("Found {} readable executable mappings", regions.len());
    regions
}
