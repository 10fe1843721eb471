use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::debug;

use crate::error::{Error, Result};
use crate::workspace::{PACKAGE_MANIFEST, manifest_package_name};

/// Bucket for files that have no enclosing `package.xml`.
pub const UNGROUPED: &str = "";

/// Workspace files grouped by owning ROS package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageFileMap {
    packages: BTreeMap<String, Vec<PathBuf>>,
}

impl PackageFileMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `file` to `package`'s list unless it is already listed there.
    pub fn insert_file(&mut self, package: impl Into<String>, file: impl Into<PathBuf>) {
        let file = file.into();
        let files = self.packages.entry(package.into()).or_default();
        if !files.contains(&file) {
            files.push(file);
        }
    }

    /// Removes `file` from whichever package lists it. Empty packages are dropped.
    pub fn remove_file(&mut self, file: &Path) -> bool {
        let mut removed = false;
        self.packages.retain(|_, files| {
            let before = files.len();
            files.retain(|f| f != file);
            removed |= files.len() != before;
            !files.is_empty()
        });
        removed
    }

    /// Replaces `from` with `to`, keeping its package and position.
    pub fn rename_file(&mut self, from: &Path, to: &Path) -> bool {
        for files in self.packages.values_mut() {
            if let Some(slot) = files.iter_mut().find(|f| f.as_path() == from) {
                *slot = to.to_path_buf();
                return true;
            }
        }
        false
    }

    /// Files of `package`, in insertion order.
    pub fn get(&self, package: &str) -> Option<&[PathBuf]> {
        self.packages.get(package).map(Vec::as_slice)
    }

    /// Package names in sorted order, the ungrouped bucket included when present.
    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    /// Packages and their files, sorted by package name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[PathBuf])> {
        self.packages
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// All files, package by package.
    pub fn files(&self) -> Vec<PathBuf> {
        self.packages.values().flatten().cloned().collect()
    }

    /// Number of files across all packages.
    pub fn len(&self) -> usize {
        self.packages.values().map(Vec::len).sum()
    }

    /// Returns `true` if no file is listed.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Walks `source_dir` and assigns every regular file to its nearest enclosing package.
/// The `package.xml` manifests mark packages and are not listed themselves.
///
/// Each directory is checked for a manifest at most once; the owner of a
/// directory without one is inherited from its parent.
pub fn enumerate(source_dir: &Path) -> Result<PackageFileMap> {
    let meta = std::fs::metadata(source_dir).map_err(|e| Error::fs(source_dir, e))?;
    if !meta.is_dir() {
        return Err(Error::fs(
            source_dir,
            std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
        ));
    }

    let mut owners: HashMap<PathBuf, Option<String>> = HashMap::new();
    let mut map = PackageFileMap::new();

    let walker = WalkBuilder::new(source_dir)
        .hidden(true)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .parents(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        if path.file_name().is_some_and(|n| n == PACKAGE_MANIFEST) {
            continue;
        }
        let Some(dir) = path.parent() else {
            continue;
        };
        let owner = owner_of(dir, source_dir, &mut owners);
        map.insert_file(owner.unwrap_or_else(|| UNGROUPED.to_string()), path);
    }

    debug!(
        source = %source_dir.display(),
        files = map.len(),
        packages = owners.values().flatten().count(),
        "enumerated workspace files"
    );
    Ok(map)
}

/// Name of the package owning `file`, or [`UNGROUPED`] when no manifest
/// encloses it below `source_dir`.
pub fn owning_package(file: &Path, source_dir: &Path) -> String {
    file.parent()
        .filter(|dir| dir.starts_with(source_dir))
        .and_then(|dir| owner_of(dir, source_dir, &mut HashMap::new()))
        .unwrap_or_else(|| UNGROUPED.to_string())
}

// Entries arrive parents-first, so a directory's parent is normally cached by
// the time the directory itself is asked about.
fn owner_of(
    dir: &Path,
    source_dir: &Path,
    owners: &mut HashMap<PathBuf, Option<String>>,
) -> Option<String> {
    if let Some(owner) = owners.get(dir) {
        return owner.clone();
    }

    let manifest = dir.join(PACKAGE_MANIFEST);
    let owner = if manifest.is_file() {
        Some(manifest_package_name(&manifest).unwrap_or_else(|| dir_name(dir)))
    } else if dir == source_dir {
        None
    } else {
        match dir.parent() {
            Some(parent) if parent.starts_with(source_dir) => {
                owner_of(parent, source_dir, owners)
            }
            _ => None,
        }
    };

    owners.insert(dir.to_path_buf(), owner.clone());
    owner
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
