use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Settings;
use crate::env::Environment;
use crate::process::{self, CommandSpec};

/// Read-only queries against the ROS package registry and package directories.
///
/// Every query degrades to an empty result on failure: a workspace with
/// nothing built yet is still a valid workspace.
#[derive(Debug, Clone)]
pub struct PackageIndex {
    settings: Settings,
}

impl PackageIndex {
    /// Creates an index using the tools named in `settings`.
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Returns every package known to `rospack list` under `env`, keyed by name.
    pub async fn list_packages(
        &self,
        env: &Environment,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, PathBuf> {
        let spec = CommandSpec::new(&self.settings.rospack)
            .arg("list")
            .env(env.clone());
        match process::run(&spec, None, cancel).await {
            Ok(out) if out.success() => parse_rospack_list(&out.stdout),
            Ok(out) => {
                warn!(
                    code = ?out.status,
                    stderr = %out.stderr.trim(),
                    "package listing failed"
                );
                BTreeMap::new()
            }
            Err(e) => {
                warn!(error = %e, "package listing unavailable");
                BTreeMap::new()
            }
        }
    }

    /// Launch files anywhere under `package_path`, as file names or full paths.
    pub fn launch_files(&self, package_path: &Path, names_only: bool) -> Vec<String> {
        let ext = self.settings.launch_extension.as_str();
        let mut files: Vec<String> = WalkBuilder::new(package_path)
            .standard_filters(false)
            .build()
            .flatten()
            .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some(ext))
            .filter_map(|e| {
                if names_only {
                    e.path().file_name().and_then(|n| n.to_str()).map(str::to_string)
                } else {
                    e.path().to_str().map(str::to_string)
                }
            })
            .collect();
        files.sort();
        files
    }

    /// Executables built for `package`, found in `<prefix>/lib/<package>/` of the
    /// first `CMAKE_PREFIX_PATH` entry that has such a directory.
    pub fn executables(&self, package: &str, env: &Environment) -> Vec<String> {
        let Some(lib_dir) = env
            .search_paths("CMAKE_PREFIX_PATH")
            .into_iter()
            .map(|prefix| prefix.join("lib").join(package))
            .find(|dir| dir.is_dir())
        else {
            return Vec::new();
        };

        let Ok(entries) = std::fs::read_dir(&lib_dir) else {
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_executable(p))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names
    }
}

/// Parses `rospack list` output: one `name path` pair per line.
pub fn parse_rospack_list(output: &str) -> BTreeMap<String, PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let path = parts.next()?;
            if parts.next().is_some() {
                return None;
            }
            Some((name.to_string(), PathBuf::from(path)))
        })
        .collect()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}
