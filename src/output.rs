use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// An output file that is written to a temporary file next to its destination, and only moved
/// into place by [`StagedFile::persist`].
///
/// Dropping a `StagedFile` without persisting it removes the temporary file, so a failed run never
/// leaves a partially written output behind.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    file: io::BufWriter<NamedTempFile>,
}

impl StagedFile {
    /// Stages a new file that will eventually replace `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let file = NamedTempFile::new_in(dir).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "Failed to create output file next to {}: {}",
                    path.display(),
                    e
                ),
            )
        })?;
        Ok(StagedFile {
            path: path.to_path_buf(),
            file: io::BufWriter::new(file),
        })
    }

    /// Where the file will end up.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Moves the staged file to its destination, replacing any existing file.
    pub fn persist(self) -> io::Result<File> {
        let path = self.path;
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        let file = file.persist(&path).map_err(|e| e.error)?;
        debug!("Wrote {}", path.display());
        Ok(file)
    }

    // Everything that can be checked before the first rename, so that a bad destination fails
    // the run while all outputs are still staged.
    fn prepare(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "Cannot write output to {}: is a directory",
                    self.path.display()
                ),
            ));
        }
        Ok(())
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Persists every staged file, in order.
///
/// Either all files end up at their destinations or none do: destinations are checked before
/// anything is moved, and if moving a file still fails, the files already moved are removed
/// again.
pub fn persist_all<I>(files: I) -> io::Result<()>
where
    I: IntoIterator<Item = StagedFile>,
{
    let mut files: Vec<StagedFile> = files.into_iter().collect();
    for file in &mut files {
        file.prepare()?;
    }

    let mut persisted: Vec<PathBuf> = Vec::with_capacity(files.len());
    for file in files {
        let path = file.path.clone();
        if let Err(e) = file.persist() {
            for path in persisted {
                remove_persisted(&path);
            }
            return Err(e);
        }
        persisted.push(path);
    }
    Ok(())
}

fn remove_persisted(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
