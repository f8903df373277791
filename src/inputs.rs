//! Turning command-line paths into a flat list of candidate files.

use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use pics_engine::writer::{SEPARATE_FOLDER, SUFFIX};

/// Extensions picked up when walking directories. Explicit file arguments
/// are passed through regardless; the engine sniffs content anyway.
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tif", "tiff", "avif",
];

/// Files to compress plus the directories the sandbox must allow.
#[derive(Debug, Default)]
pub struct Inputs {
    pub files: Vec<PathBuf>,
    pub roots: Vec<PathBuf>,
}

/// Expand `paths`: files are kept, directories are walked recursively.
///
/// Hidden entries, previous outputs (`*_compressed.*` and anything under a
/// `Compressor` folder) and non-image extensions are skipped while walking.
/// Missing paths are kept so they surface as `file-not-found` outcomes.
pub fn collect(paths: &[PathBuf]) -> Inputs {
    let cwd = std::env::current_dir().unwrap_or_default();
    let mut inputs = Inputs::default();

    for path in paths {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            cwd.join(path)
        };

        if path.is_dir() {
            inputs.roots.push(path.clone());
            let walker = WalkDir::new(&path)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !skip_dir_entry(e));
            for entry in walker {
                match entry {
                    Ok(e) if e.file_type().is_file() && is_candidate(e.path()) => {
                        inputs.files.push(e.into_path());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("skipping unreadable entry: {e}"),
                }
            }
        } else {
            if let Some(parent) = path.parent() {
                inputs.roots.push(parent.to_path_buf());
            }
            inputs.files.push(path);
        }
    }

    inputs.files.sort();
    inputs.files.dedup();
    inputs.roots.sort();
    inputs.roots.dedup();
    inputs
}

fn skip_dir_entry(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && name == SEPARATE_FOLDER)
}

fn is_candidate(path: &Path) -> bool {
    let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase()) else {
        return false;
    };
    let previous_output = path
        .file_stem()
        .map(|s| s.to_string_lossy().ends_with(SUFFIX))
        .unwrap_or(false);
    IMAGE_EXTENSIONS.contains(&ext.as_str()) && !previous_output
}
