//! Path, argument and environment rules applied before any tool runs.
//!
//! A [`Sandbox`] holds two allow-lists: data roots (home, the temp
//! directory and any working directories the caller passes in) and
//! executable roots (the usual system prefixes plus the data roots).
//! Anything outside them, or anything spelled with a `..` component, is
//! refused before a process is spawned.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use pics_common::SecurityError;

/// Characters that are never allowed in a tool argument.
const FORBIDDEN_CHARS: &[char] = &[
    ';', '&', '|', '$', '(', ')', '`', '{', '}', '[', ']', '"', '\'', '\\', '<', '>', '\0', '\n',
    '\r',
];

/// Prefixes where package managers install encoder binaries.
const SYSTEM_EXECUTABLE_ROOTS: &[&str] = &[
    "/usr/bin",
    "/bin",
    "/usr/local",
    "/opt/homebrew",
    "/opt/local",
    "/home/linuxbrew/.linuxbrew",
    "/nix/store",
];

/// Variables copied into a child environment when present. Everything else,
/// `PATH`, `HOME` and dynamic-loader variables included, is dropped.
const INHERITED_ENV: &[&str] = &["LANG", "LC_ALL", "LC_CTYPE", "TMPDIR", "TZ"];

/// Allow-lists for process execution.
#[derive(Debug, Clone)]
pub struct Sandbox {
    roots: Vec<PathBuf>,
    executable_roots: Vec<PathBuf>,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(std::iter::empty::<PathBuf>())
    }
}

impl Sandbox {
    /// Build a sandbox rooted at home, the temp directory, `/tmp`, and
    /// `working_dirs`. Relative working directories are ignored.
    pub fn new<I, P>(working_dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut sandbox = Self {
            roots: Vec::new(),
            executable_roots: Vec::new(),
        };
        if let Some(home) = std::env::var_os("HOME").filter(|h| !h.is_empty()) {
            sandbox.push_root(PathBuf::from(home));
        }
        sandbox.push_root(std::env::temp_dir());
        sandbox.push_root(PathBuf::from("/tmp"));
        for dir in working_dirs {
            sandbox.push_root(dir.into());
        }
        for dir in SYSTEM_EXECUTABLE_ROOTS {
            let dir = PathBuf::from(dir);
            let dir = dir.canonicalize().unwrap_or(dir);
            if !sandbox.executable_roots.contains(&dir) {
                sandbox.executable_roots.push(dir);
            }
        }
        sandbox
    }

    fn push_root(&mut self, root: PathBuf) {
        if !root.is_absolute() {
            tracing::warn!(root = %root.display(), "ignoring relative sandbox root");
            return;
        }
        let root = root.canonicalize().unwrap_or(root);
        if !self.roots.contains(&root) {
            self.roots.push(root.clone());
        }
        if !self.executable_roots.contains(&root) {
            self.executable_roots.push(root);
        }
    }

    /// Data roots after canonicalization.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Check that `path` has no traversal segment and resolves under a data
    /// root. Paths that do not exist yet are resolved through their nearest
    /// existing ancestor. Returns the resolved path.
    pub fn validate_path(&self, path: &Path) -> Result<PathBuf, SecurityError> {
        let resolved = resolve(path)?;
        if self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(SecurityError::UnauthorizedPath { path: resolved })
        }
    }

    /// Check that `path` is an absolute, executable regular file under an
    /// executable root. Returns the resolved path.
    pub fn validate_executable(&self, path: &Path) -> Result<PathBuf, SecurityError> {
        if !path.is_absolute() || !is_executable(path) {
            return Err(SecurityError::InvalidExecutable {
                path: path.to_path_buf(),
            });
        }
        let resolved = resolve(path)?;
        if self
            .executable_roots
            .iter()
            .any(|root| resolved.starts_with(root))
        {
            Ok(resolved)
        } else {
            Err(SecurityError::UnauthorizedPath { path: resolved })
        }
    }

    /// Validate one argument: no metacharacters, and if it names a path,
    /// that path must pass [`Sandbox::validate_path`].
    pub fn check_argument(&self, arg: &str) -> Result<(), SecurityError> {
        validate_argument(arg)?;
        if looks_like_path(arg) {
            self.validate_path(Path::new(arg))?;
        }
        Ok(())
    }
}

/// Reject arguments carrying shell metacharacters or control bytes.
pub fn validate_argument(arg: &str) -> Result<(), SecurityError> {
    if arg.contains(FORBIDDEN_CHARS) || arg.chars().any(char::is_control) {
        return Err(SecurityError::UnsafeArgument {
            arg: arg.to_string(),
        });
    }
    Ok(())
}

/// The minimal environment handed to child processes.
pub fn scrubbed_env() -> Vec<(OsString, OsString)> {
    INHERITED_ENV
        .iter()
        .filter_map(|key| std::env::var_os(key).map(|value| (OsString::from(key), value)))
        .collect()
}

/// True for a regular file with at least one execute bit.
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn looks_like_path(arg: &str) -> bool {
    arg.starts_with('/') || arg.starts_with('~') || arg.contains('/')
}

fn has_traversal(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Canonicalize `path`, or its nearest existing ancestor plus the rest.
fn resolve(path: &Path) -> Result<PathBuf, SecurityError> {
    if has_traversal(path) {
        return Err(SecurityError::PathTraversal {
            path: path.to_path_buf(),
        });
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .map_err(|_| SecurityError::UnauthorizedPath {
                path: path.to_path_buf(),
            })?
    };

    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for part in rest.iter().rev() {
                resolved.push(part);
            }
            return Ok(resolved);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => {
                return Err(SecurityError::UnauthorizedPath {
                    path: absolute.clone(),
                })
            }
        }
    }
}
