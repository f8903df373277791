//! Atomic output: destination planning, temp files, and the final replace.
//!
//! Produced bytes always land in a temp file inside the destination's
//! directory, so the final step is a same-filesystem rename. The
//! destination is therefore either untouched or complete, never partial,
//! and an output that is not smaller than its original is never written.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use pics_common::{reason, Error, Result, SaveMode};

/// Folder used by [`SaveMode::SeparateFolder`].
pub const SEPARATE_FOLDER: &str = "Compressor";

/// Suffix used by [`SaveMode::Suffix`].
pub const SUFFIX: &str = "_compressed";

const MAX_FILENAME_BYTES: usize = 255;

// ---------------------------------------------------------------------------
// Destination planning
// ---------------------------------------------------------------------------

/// Make `name` safe to use as a single path component.
///
/// Separators and reserved characters become `_`, `..` sequences and control
/// characters are removed, and the result is cut to 255 bytes on a character
/// boundary. A result that is empty or only dots becomes `"unnamed"`.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();

    let mut cleaned = replaced;
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", "");
    }
    let cleaned = cleaned.trim();
    if cleaned.chars().all(|c| c == '.') {
        return "unnamed".to_string();
    }

    let mut end = cleaned.len().min(MAX_FILENAME_BYTES);
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    cleaned[..end].to_string()
}

/// Compute where the output for `input` goes. Called once per request,
/// before any encoding starts.
pub fn plan_destination(input: &Path, mode: SaveMode, fallback_ext: &str) -> Result<PathBuf> {
    if mode == SaveMode::Overwrite {
        return Ok(input.to_path_buf());
    }
    let (Some(dir), Some(file_name)) = (input.parent(), input.file_name()) else {
        return Err(Error::processing(
            "plan",
            format!("cannot derive an output name from {}", input.display()),
        ));
    };

    match mode {
        SaveMode::Suffix => {
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let ext = input
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_else(|| fallback_ext.to_string());
            let name = sanitize_filename(&format!("{stem}{SUFFIX}.{}", sanitize_filename(&ext)));
            Ok(dir.join(name))
        }
        SaveMode::SeparateFolder => Ok(dir
            .join(SEPARATE_FOLDER)
            .join(sanitize_filename(&file_name.to_string_lossy()))),
        SaveMode::Overwrite => Ok(input.to_path_buf()),
    }
}

// ---------------------------------------------------------------------------
// Replace step
// ---------------------------------------------------------------------------

/// Moves a finished temp file onto its destination.
///
/// Implementations must leave the destination either untouched or fully
/// replaced. On error the temp file must not be left at the destination.
pub trait Replace: Send + Sync {
    fn replace(&self, temp: NamedTempFile, destination: &Path) -> io::Result<()>;
}

/// Atomic `rename(2)` via [`NamedTempFile::persist`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameReplace;

impl Replace for RenameReplace {
    fn replace(&self, temp: NamedTempFile, destination: &Path) -> io::Result<()> {
        // Dropping the PersistError drops its NamedTempFile, which deletes it.
        temp.persist(destination).map(|_| ()).map_err(|e| e.error)
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// A successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub output_path: PathBuf,
    pub original_size: u64,
    /// Equals `original_size` when `no_gain` is set.
    pub new_size: u64,
    pub no_gain: bool,
}

/// A failed commit. The original is intact and no temp file remains.
#[derive(Debug)]
pub struct CommitFailure {
    pub reason: &'static str,
    pub error: Error,
}

impl CommitFailure {
    fn new(reason: &'static str, error: impl Into<Error>) -> Self {
        Self {
            reason,
            error: error.into(),
        }
    }
}

impl fmt::Display for CommitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.error)
    }
}

/// Turns produced temp files into final outputs.
#[derive(Clone)]
pub struct AtomicWriter {
    replacer: Arc<dyn Replace>,
}

impl fmt::Debug for AtomicWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicWriter").finish_non_exhaustive()
    }
}

impl Default for AtomicWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicWriter {
    pub fn new() -> Self {
        Self::with_replacer(Arc::new(RenameReplace))
    }

    pub fn with_replacer(replacer: Arc<dyn Replace>) -> Self {
        Self { replacer }
    }

    /// Create an empty temp file next to `destination`, creating the
    /// destination directory if needed. `ext` is kept as the suffix because
    /// some encoders pick their output format from it.
    pub fn temp_for(&self, destination: &Path, ext: &str) -> Result<NamedTempFile> {
        let dir = destination
            .parent()
            .ok_or_else(|| Error::processing("commit", "destination has no parent directory"))?;
        fs::create_dir_all(dir)?;
        let suffix = format!(".{ext}");
        Ok(tempfile::Builder::new()
            .prefix(".pics-")
            .suffix(&suffix)
            .tempfile_in(dir)?)
    }

    /// Finalise `produced` as the output for `original`.
    ///
    /// - Empty or unreadable output fails with `empty-output`.
    /// - Output not smaller than the original is discarded; the original is
    ///   copied to `destination` if that is a different path, and the result
    ///   is a no-gain success.
    /// - Otherwise `produced` replaces `destination`. A failed replace
    ///   yields `move-failed` with the original untouched.
    pub fn commit(
        &self,
        produced: NamedTempFile,
        destination: &Path,
        original: &Path,
        mode: SaveMode,
    ) -> std::result::Result<Committed, CommitFailure> {
        let original_meta =
            fs::metadata(original).map_err(|e| CommitFailure::new("io-error", e))?;
        let original_size = original_meta.len();

        // Tools may have replaced the file at this path, so go by path.
        let new_size = match verify_output(produced.path()) {
            Ok(size) => size,
            Err(e) => return Err(CommitFailure::new(reason::EMPTY_OUTPUT, e)),
        };

        if new_size >= original_size {
            drop(produced);
            tracing::debug!(
                original = %original.display(),
                original_size,
                new_size,
                "output not smaller; keeping original"
            );
            if destination != original {
                self.copy_original(original, destination)
                    .map_err(|e| CommitFailure::new(reason::COPY_ORIGINAL_FAILED, e))?;
            }
            return Ok(Committed {
                output_path: destination.to_path_buf(),
                original_size,
                new_size: original_size,
                no_gain: true,
            });
        }

        // Temp files are created 0600; the output keeps the original's mode.
        let replaced = fs::set_permissions(produced.path(), original_meta.permissions())
            .and_then(|()| self.replacer.replace(produced, destination));
        if let Err(e) = replaced {
            tracing::warn!(
                destination = %destination.display(),
                overwrite = mode == SaveMode::Overwrite,
                "replace failed, original left intact: {e}"
            );
            return Err(CommitFailure::new(reason::MOVE_FAILED, e));
        }

        tracing::info!(
            output = %destination.display(),
            original_size,
            new_size,
            "committed"
        );
        Ok(Committed {
            output_path: destination.to_path_buf(),
            original_size,
            new_size,
            no_gain: false,
        })
    }

    /// Byte-for-byte copy of `original` to `destination`, via temp + replace.
    fn copy_original(&self, original: &Path, destination: &Path) -> Result<()> {
        let ext = destination
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = self.temp_for(destination, &ext)?;
        fs::copy(original, temp.path())?;
        fs::set_permissions(temp.path(), fs::metadata(original)?.permissions())?;
        temp.as_file().sync_all()?;
        self.replacer.replace(temp, destination)?;
        Ok(())
    }
}

/// Size of the file at `path`, after flushing it, if it is non-empty and
/// readable.
fn verify_output(path: &Path) -> Result<u64> {
    let file = fs::File::open(path)?;
    file.sync_all()?;
    let size = file.metadata()?.len();
    if size == 0 {
        return Err(Error::processing("commit", "encoder produced an empty file"));
    }
    Ok(size)
}
