use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Settings;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::process::{self, CommandSpec, LiveLog};

/// Environment variables holding compiler header search paths.
pub const COMPILER_SEARCH_VARS: &[&str] = &["CPATH", "C_INCLUDE_PATH", "CPLUS_INCLUDE_PATH"];

/// Ordered, de-duplicated set of normalized include directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludePathSet {
    paths: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
}

impl IncludePathSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes and appends `path`; returns `false` if it was already present.
    pub fn insert(&mut self, path: impl AsRef<Path>) -> bool {
        let path = normalize_path(path.as_ref());
        if path.as_os_str().is_empty() || !self.seen.insert(path.clone()) {
            return false;
        }
        self.paths.push(path);
        true
    }

    /// Appends the paths of `other` that are not yet present.
    pub fn merge(&mut self, other: &IncludePathSet) {
        for p in &other.paths {
            self.insert(p);
        }
    }

    /// Returns `true` if the normalized `path` is present.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.seen.contains(&normalize_path(path.as_ref()))
    }

    /// Paths in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter()
    }

    /// Number of paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns `true` if the set holds no path.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Paths in first-seen order, as an owned list.
    pub fn to_vec(&self) -> Vec<PathBuf> {
        self.paths.clone()
    }
}

impl<P: AsRef<Path>> Extend<P> for IncludePathSet {
    fn extend<T: IntoIterator<Item = P>>(&mut self, iter: T) {
        for p in iter {
            self.insert(p);
        }
    }
}

impl<P: AsRef<Path>> FromIterator<P> for IncludePathSet {
    fn from_iter<T: IntoIterator<Item = P>>(iter: T) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

/// Drops `.` components, duplicate separators and trailing separators.
/// `..` is kept as-is since resolving it lexically can change the target.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Recovers the full include-directory set of a workspace through CMake.
#[derive(Debug, Clone)]
pub struct IncludeResolver {
    settings: Settings,
}

impl IncludeResolver {
    /// Creates a resolver using the CMake binary and generator from `settings`.
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Runs CMake with the CodeBlocks generator over `source_dir`, writing into
    /// `build_dir`. Returns the generated project file.
    pub async fn generate_project_file(
        &self,
        env: &Environment,
        source_dir: &Path,
        build_dir: &Path,
        live: Option<&LiveLog>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(build_dir).map_err(|e| Error::fs(build_dir, e))?;

        let spec = CommandSpec::new(&self.settings.cmake)
            .arg(source_dir.to_string_lossy())
            .arg("-G")
            .arg(&self.settings.codeblocks_generator)
            .current_dir(build_dir)
            .env(env.clone());
        process::run(&spec, live, cancel)
            .await?
            .check(&self.settings.cmake)?;

        find_project_file(build_dir).ok_or_else(|| {
            Error::ParseFailure(format!(
                "CMake reported success but no CodeBlocks project file exists in {}",
                build_dir.display()
            ))
        })
    }

    /// Generates the project file and returns its include directories merged
    /// with the compiler search paths of `env`.
    ///
    /// On failure nothing is returned, so callers keep their previous set.
    pub async fn resolve(
        &self,
        env: &Environment,
        source_dir: &Path,
        build_dir: &Path,
        live: Option<&LiveLog>,
        cancel: &CancellationToken,
    ) -> Result<IncludePathSet> {
        let project_file = self
            .generate_project_file(env, source_dir, build_dir, live, cancel)
            .await?;
        let mut includes = parse_include_paths(&project_file)?;
        includes.extend(compiler_search_paths(env));
        info!(
            project_file = %project_file.display(),
            count = includes.len(),
            "resolved include paths"
        );
        Ok(includes)
    }
}

/// Returns `Project.cbp` in `build_dir` if present, else the first `*.cbp` listed.
pub fn find_project_file(build_dir: &Path) -> Option<PathBuf> {
    let preferred = build_dir.join("Project.cbp");
    if preferred.is_file() {
        return Some(preferred);
    }
    std::fs::read_dir(build_dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .find(|p| p.is_file() && p.extension().is_some_and(|x| x == "cbp"))
}

/// Header search directories from `CPATH`, `C_INCLUDE_PATH` and `CPLUS_INCLUDE_PATH`.
pub fn compiler_search_paths(env: &Environment) -> Vec<PathBuf> {
    COMPILER_SEARCH_VARS
        .iter()
        .flat_map(|var| env.search_paths(var))
        .collect()
}

/// Reads a CodeBlocks project file and returns its include directories.
pub fn parse_include_paths(project_file: &Path) -> Result<IncludePathSet> {
    let content =
        std::fs::read_to_string(project_file).map_err(|e| Error::fs(project_file, e))?;
    parse_include_paths_str(&content)
}

/// Extracts every `<Add directory="...">` entry of a CodeBlocks project, in first-seen order.
pub fn parse_include_paths_str(xml: &str) -> Result<IncludePathSet> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(xml);
    let mut includes = IncludePathSet::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"Add" => {
                for attr in e.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    if attr.key.as_ref() == b"directory" {
                        let dir = attr.unescape_value()?;
                        if includes.insert(dir.trim()) {
                            debug!(directory = %dir, "include directory");
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(includes)
}
