use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Locale forced into `LC_ALL` unless configured otherwise.
pub const DEFAULT_LOCALE: &str = "C";

/// Locations of external tools and the conventions used to find ROS installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding one subdirectory per installed distribution.
    pub ros_root: PathBuf,
    /// Shell used to source setup scripts.
    pub shell: String,
    pub cmake: String,
    pub rospack: String,
    /// Tool that writes the top-level `CMakeLists.txt` into `src/`.
    pub init_tool: String,
    /// Build command used when a build step leaves its command unset.
    pub make_command: String,
    /// CMake generator that emits a CodeBlocks project file.
    pub codeblocks_generator: String,
    /// Extension (without dot) of ROS launch files.
    pub launch_extension: String,
    /// Value forced into `LC_ALL` so tool output stays parseable.
    pub locale: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ros_root: PathBuf::from("/opt/ros"),
            shell: "bash".to_string(),
            cmake: "cmake".to_string(),
            rospack: "rospack".to_string(),
            init_tool: "catkin_init_workspace".to_string(),
            make_command: "catkin_make".to_string(),
            codeblocks_generator: "CodeBlocks - Unix Makefiles".to_string(),
            launch_extension: "launch".to_string(),
            locale: DEFAULT_LOCALE.to_string(),
        }
    }
}

impl Settings {
    /// Returns defaults overlaid with `CATKINKIT_ROS_ROOT`, `CATKINKIT_SHELL`
    /// and `CATKINKIT_MAKE_COMMAND` when set.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Reads settings from a JSON file. A missing file yields [`Settings::from_env`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::from_env()),
            Err(e) => return Err(Error::fs(path, e)),
        };
        let settings: Settings = serde_json::from_str(&content)
            .map_err(|e| Error::ParseFailure(format!("{}: {}", path.display(), e)))?;
        Ok(settings.with_env_overrides())
    }

    /// Per-user settings file location (`<config dir>/catkinkit/settings.json`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("catkinkit")
            .join("settings.json")
    }

    /// Path to the setup script of an installed distribution.
    pub fn distribution_setup(&self, distribution: &str) -> PathBuf {
        self.ros_root.join(distribution).join("setup.bash")
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(root) = std::env::var("CATKINKIT_ROS_ROOT") {
            self.ros_root = PathBuf::from(root);
        }
        if let Ok(shell) = std::env::var("CATKINKIT_SHELL") {
            self.shell = shell;
        }
        if let Ok(cmd) = std::env::var("CATKINKIT_MAKE_COMMAND") {
            self.make_command = cmd;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "cmake": "/usr/local/bin/cmake" }"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.cmake, "/usr/local/bin/cmake");
        assert_eq!(settings.rospack, "rospack");
        assert_eq!(settings.locale, "C");
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.codeblocks_generator, "CodeBlocks - Unix Makefiles");
    }

    #[test]
    fn test_malformed_file_is_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ParseFailure);
    }

    #[test]
    fn test_distribution_setup_path() {
        let settings = Settings {
            ros_root: PathBuf::from("/opt/ros"),
            ..Settings::default()
        };
        assert_eq!(
            settings.distribution_setup("kinetic"),
            PathBuf::from("/opt/ros/kinetic/setup.bash")
        );
    }
}
