//! External encoder discovery.
//!
//! The [`ToolRegistry`] resolves each [`Tool`] lazily and at most once,
//! caching the answer (including "not installed"). An explicit
//! `PICS_<TOOL>_PATH` environment variable always wins over the cache and
//! fails closed: if it points at something that is not executable, the tool
//! is reported missing and no other location is searched.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use pics_common::ImageFormat;

use crate::command::SecureCommand;
use crate::sandbox::{is_executable, Sandbox};

/// Longest a version check may run before the tool is killed.
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Version banners are a line or two.
const VERSION_OUTPUT_BYTES: usize = 4096;

/// Directories searched before `PATH`, in order.
const SEARCH_DIRS: &[&str] = &[
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/opt/local/bin",
    "/usr/bin",
];

/// External encoders the engine knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Cjpegli,
    /// mozjpeg's `cjpeg`.
    Cjpeg,
    Oxipng,
    Gifsicle,
    Cwebp,
    Avifenc,
}

impl Tool {
    pub const ALL: [Tool; 6] = [
        Tool::Cjpegli,
        Tool::Cjpeg,
        Tool::Oxipng,
        Tool::Gifsicle,
        Tool::Cwebp,
        Tool::Avifenc,
    ];

    /// Executable file name.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Tool::Cjpegli => "cjpegli",
            Tool::Cjpeg => "cjpeg",
            Tool::Oxipng => "oxipng",
            Tool::Gifsicle => "gifsicle",
            Tool::Cwebp => "cwebp",
            Tool::Avifenc => "avifenc",
        }
    }

    /// Name of the override variable, e.g. `PICS_CJPEG_PATH`.
    pub fn env_var(&self) -> String {
        format!("PICS_{}_PATH", self.binary_name().to_ascii_uppercase())
    }

    /// The format this tool re-encodes.
    pub fn format(&self) -> ImageFormat {
        match self {
            Tool::Cjpegli | Tool::Cjpeg => ImageFormat::Jpeg,
            Tool::Oxipng => ImageFormat::Png,
            Tool::Gifsicle => ImageFormat::Gif,
            Tool::Cwebp => ImageFormat::WebP,
            Tool::Avifenc => ImageFormat::Avif,
        }
    }

    /// Reason code recorded when this tool produced the committed output.
    pub fn success_reason(&self) -> &'static str {
        match self {
            Tool::Cjpegli => "jpegli-compression",
            Tool::Cjpeg => "mozjpeg-compression",
            Tool::Oxipng => "oxipng-compression",
            Tool::Gifsicle => "gifsicle-compression",
            Tool::Cwebp => "cwebp-compression",
            Tool::Avifenc => "avifenc-compression",
        }
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            Tool::Cjpegli => "brew install jpeg-xl (ships cjpegli)",
            Tool::Cjpeg => "brew install mozjpeg",
            Tool::Oxipng => "brew install oxipng (or: cargo install oxipng)",
            Tool::Gifsicle => "brew install gifsicle",
            Tool::Cwebp => "brew install webp",
            Tool::Avifenc => "brew install libavif",
        }
    }

    /// Tool-specific locations searched before the shared directories.
    fn extra_dirs(&self) -> &'static [&'static str] {
        match self {
            // mozjpeg is keg-only and would otherwise lose to libjpeg's cjpeg.
            Tool::Cjpeg => &["/opt/homebrew/opt/mozjpeg/bin", "/usr/local/opt/mozjpeg/bin"],
            _ => &[],
        }
    }

    fn version_arg(&self) -> &'static str {
        match self {
            Tool::Cjpeg | Tool::Cwebp => "-version",
            _ => "--version",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<OsString> + Send + Sync>;

/// Per-tool snapshot of resolved paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolAvailability {
    entries: Vec<(Tool, Option<PathBuf>)>,
}

impl ToolAvailability {
    pub fn path(&self, tool: Tool) -> Option<&Path> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tool)
            .and_then(|(_, p)| p.as_deref())
    }

    pub fn is_available(&self, tool: Tool) -> bool {
        self.path(tool).is_some()
    }

    pub fn missing(&self) -> Vec<Tool> {
        self.entries
            .iter()
            .filter(|(_, p)| p.is_none())
            .map(|(t, _)| *t)
            .collect()
    }

    /// One line per missing tool, e.g. `"gifsicle: brew install gifsicle"`.
    pub fn install_hints(&self) -> Vec<String> {
        self.missing()
            .into_iter()
            .map(|t| format!("{t}: {}", t.install_hint()))
            .collect()
    }
}

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub tool: Tool,
    pub available: bool,
    /// Version string (first line of version output), if available.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
    /// Where the path came from: `"env"`, `"search"`, or `None`.
    pub source: Option<&'static str>,
}

/// Lazily-populated cache of resolved tool paths.
pub struct ToolRegistry {
    cache: RwLock<HashMap<Tool, Option<PathBuf>>>,
    search_dirs: Vec<PathBuf>,
    search_path_env: bool,
    env: EnvLookup,
    discoveries: AtomicUsize,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("cache", &*self.cache.read())
            .field("search_dirs", &self.search_dirs)
            .field("search_path_env", &self.search_path_env)
            .finish()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Registry over the standard install locations, then `PATH`, honouring
    /// overrides from the process environment.
    pub fn new() -> Self {
        Self::with_search_dirs(SEARCH_DIRS.iter().map(PathBuf::from).collect(), true)
    }

    /// Registry over explicit directories. `search_path_env` enables the
    /// final `PATH` lookup.
    pub fn with_search_dirs(search_dirs: Vec<PathBuf>, search_path_env: bool) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            search_dirs,
            search_path_env,
            env: Arc::new(|key| std::env::var_os(key)),
            discoveries: AtomicUsize::new(0),
        }
    }

    /// Replace the environment used for `PICS_<TOOL>_PATH` overrides.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    /// Resolve `tool` to an executable path.
    pub fn resolve(&self, tool: Tool) -> Option<PathBuf> {
        self.resolve_with_source(tool).map(|(path, _)| path)
    }

    fn resolve_with_source(&self, tool: Tool) -> Option<(PathBuf, &'static str)> {
        if let Some(raw) = (self.env)(&tool.env_var()).filter(|v| !v.is_empty()) {
            let path = PathBuf::from(raw);
            if is_executable(&path) {
                tracing::debug!(tool = %tool, path = %path.display(), "using environment override");
                return Some((path, "env"));
            }
            tracing::warn!(
                tool = %tool,
                path = %path.display(),
                "{} does not name an executable; treating {tool} as unavailable",
                tool.env_var()
            );
            return None;
        }

        if let Some(hit) = self.cache.read().get(&tool) {
            return hit.clone().map(|p| (p, "search"));
        }

        let mut cache = self.cache.write();
        if let Some(hit) = cache.get(&tool) {
            return hit.clone().map(|p| (p, "search"));
        }
        let found = self.discover(tool);
        cache.insert(tool, found.clone());
        found.map(|p| (p, "search"))
    }

    /// Number of filesystem searches performed so far.
    pub fn discovery_count(&self) -> usize {
        self.discoveries.load(Ordering::Relaxed)
    }

    pub fn availability(&self) -> ToolAvailability {
        ToolAvailability {
            entries: Tool::ALL.iter().map(|&t| (t, self.resolve(t))).collect(),
        }
    }

    /// Check all known tools, including their versions.
    ///
    /// Version calls go through `sandbox` like any other tool run and are
    /// killed after [`VERSION_TIMEOUT`].
    pub async fn check_all(&self, sandbox: &Arc<Sandbox>) -> Vec<ToolInfo> {
        let mut infos = Vec::with_capacity(Tool::ALL.len());
        for tool in Tool::ALL {
            let info = match self.resolve_with_source(tool) {
                Some((path, source)) => ToolInfo {
                    tool,
                    available: true,
                    version: detect_version(sandbox, tool, &path).await,
                    path: Some(path),
                    source: Some(source),
                },
                None => ToolInfo {
                    tool,
                    available: false,
                    version: None,
                    path: None,
                    source: None,
                },
            };
            infos.push(info);
        }
        infos
    }

    fn discover(&self, tool: Tool) -> Option<PathBuf> {
        self.discoveries.fetch_add(1, Ordering::Relaxed);
        let name = tool.binary_name();

        let dirs = tool
            .extra_dirs()
            .iter()
            .map(PathBuf::from)
            .chain(self.search_dirs.iter().cloned());
        for dir in dirs {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                tracing::debug!(tool = %tool, path = %candidate.display(), "found tool");
                return Some(candidate);
            }
        }

        if self.search_path_env {
            if let Ok(path) = which::which(name) {
                if is_executable(&path) {
                    tracing::debug!(tool = %tool, path = %path.display(), "found tool on PATH");
                    return Some(path);
                }
            }
        }

        tracing::debug!(tool = %tool, "tool not found");
        None
    }
}

/// Run `<tool> --version` (or `-version`) and return the first line of output.
async fn detect_version(sandbox: &Arc<Sandbox>, tool: Tool, path: &Path) -> Option<String> {
    let mut cmd = SecureCommand::new(Arc::clone(sandbox), path.to_path_buf());
    cmd.arg(tool.version_arg())
        .timeout(VERSION_TIMEOUT)
        .max_output_bytes(VERSION_OUTPUT_BYTES);
    let output = match cmd.execute().await {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!(tool = %tool, "version check failed: {e}");
            return None;
        }
    };

    // Several encoders print their banner on stderr.
    let text = if output.stdout.trim().is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
