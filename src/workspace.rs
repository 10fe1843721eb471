use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;
use crate::env::{Environment, EnvironmentSourcer};
use crate::error::{Error, Result};
use crate::process::{self, CommandSpec, LiveLog};

/// File whose presence under `build/` shows CMake has configured the workspace.
pub const BUILD_MARKER: &str = "CMakeCache.txt";
/// File whose presence under `devel/` shows catkin has generated the workspace setup.
pub const DEVEL_MARKER: &str = "setup.bash";
/// Manifest file that marks the root of a ROS package.
pub const PACKAGE_MANIFEST: &str = "package.xml";

/// A catkin workspace. Sub-directories are always derived from `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Root directory of the workspace.
    pub root: PathBuf,
}

impl Workspace {
    /// Creates a workspace rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the workspace display name (last path component, or `"."` for cwd).
    pub fn name(&self) -> &str {
        self.root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(".")
    }

    /// `<root>/src`.
    pub fn source_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    /// `<root>/build`.
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    /// `<root>/devel`.
    pub fn devel_dir(&self) -> PathBuf {
        self.root.join("devel")
    }

    /// Location of the persisted descriptor for a project named `project_name`.
    pub fn descriptor_path(&self, project_name: &str) -> PathBuf {
        self.root.join(format!("{}.workspace", project_name))
    }

    /// Returns `true` if `build/` exists and CMake has written its cache there.
    pub fn has_build_directory(&self) -> bool {
        self.build_dir().join(BUILD_MARKER).is_file()
    }

    /// Returns `true` if `devel/` exists and contains the generated setup script.
    pub fn has_devel_directory(&self) -> bool {
        self.devel_dir().join(DEVEL_MARKER).is_file()
    }

    /// A workspace is initialized once both `build/` and `devel/` carry their markers.
    pub fn is_initialized(&self) -> bool {
        self.has_build_directory() && self.has_devel_directory()
    }

    /// Creates `src/`, runs the workspace init tool in it, then runs the build
    /// command once in the root so `build/` and `devel/` are generated.
    ///
    /// Everything runs under the sourced distribution environment. A failing
    /// tool surfaces its exit code and stderr unchanged.
    pub async fn initialize(
        &self,
        sourcer: &EnvironmentSourcer,
        distribution: &str,
        live: Option<&LiveLog>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let settings = sourcer.settings();
        let src = self.source_dir();
        std::fs::create_dir_all(&src).map_err(|e| Error::fs(&src, e))?;

        let env = sourcer.source_distribution(distribution).await?;

        if !src.join("CMakeLists.txt").exists() {
            let spec = CommandSpec::new(&settings.init_tool)
                .current_dir(&src)
                .env(env.clone());
            process::run(&spec, live, cancel)
                .await?
                .check(&settings.init_tool)?;
        }

        self.build(settings, env, live, cancel).await?;
        info!(workspace = %self.root.display(), distribution, "workspace initialized");
        Ok(())
    }

    /// Runs the configured build command with no arguments in the workspace root.
    pub async fn build(
        &self,
        settings: &Settings,
        env: Environment,
        live: Option<&LiveLog>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = CommandSpec::new(&settings.make_command)
            .current_dir(&self.root)
            .env(env);
        process::run(&spec, live, cancel)
            .await?
            .check(&settings.make_command)?;
        Ok(())
    }
}

/// Lists installed distributions: directories under `ros_root` holding a `setup.bash`.
///
/// Order is directory listing order. A missing root yields no distributions.
pub fn installed_distributions(settings: &Settings) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(&settings.ros_root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().join("setup.bash").is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect()
}

/// Reads `<name>` from a `package.xml`, or `None` if the manifest is unreadable or nameless.
pub fn manifest_package_name(package_xml: &Path) -> Option<String> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let content = std::fs::read_to_string(package_xml).ok()?;
    let mut reader = Reader::from_str(&content);
    let mut depth = 0usize;
    let mut in_name = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                in_name = depth == 2 && e.name().as_ref() == b"name";
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                in_name = false;
            }
            Ok(Event::Text(e)) if in_name => {
                let name = e.unescape().ok()?.trim().to_string();
                return (!name.is_empty()).then_some(name);
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn fake_settings(dir: &Path) -> Settings {
        let dist = dir.join("ros").join("kinetic");
        std::fs::create_dir_all(&dist).unwrap();
        std::fs::write(dist.join("setup.bash"), "export ROS_DISTRO=kinetic\n").unwrap();
        Settings {
            ros_root: dir.join("ros"),
            ..Settings::default()
        }
    }

    #[test]
    fn test_paths_derive_from_root() {
        let ws = Workspace::new("/home/me/catkin_ws");
        assert_eq!(ws.name(), "catkin_ws");
        assert_eq!(ws.source_dir(), PathBuf::from("/home/me/catkin_ws/src"));
        assert_eq!(ws.build_dir(), PathBuf::from("/home/me/catkin_ws/build"));
        assert_eq!(ws.devel_dir(), PathBuf::from("/home/me/catkin_ws/devel"));
        assert_eq!(
            ws.descriptor_path("demo"),
            PathBuf::from("/home/me/catkin_ws/demo.workspace")
        );
    }

    #[test]
    fn test_initialized_requires_both_markers() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        assert!(!ws.is_initialized());

        std::fs::create_dir_all(ws.build_dir()).unwrap();
        std::fs::create_dir_all(ws.devel_dir()).unwrap();
        assert!(!ws.is_initialized());

        std::fs::write(ws.build_dir().join(BUILD_MARKER), "").unwrap();
        assert!(ws.has_build_directory());
        assert!(!ws.is_initialized());

        std::fs::write(ws.devel_dir().join(DEVEL_MARKER), "").unwrap();
        assert!(ws.has_devel_directory());
        assert!(ws.is_initialized());
    }

    #[test]
    fn test_installed_distributions_filters_invalid_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = fake_settings(dir.path());
        std::fs::create_dir_all(dir.path().join("ros").join("broken")).unwrap();
        std::fs::write(dir.path().join("ros").join("README"), "").unwrap();

        assert_eq!(installed_distributions(&settings), vec!["kinetic".to_string()]);
    }

    #[test]
    fn test_installed_distributions_missing_root() {
        let settings = Settings {
            ros_root: PathBuf::from("/nonexistent/ros/root"),
            ..Settings::default()
        };
        assert!(installed_distributions(&settings).is_empty());
    }

    #[test]
    fn test_manifest_package_name() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join(PACKAGE_MANIFEST);
        std::fs::write(
            &manifest,
            r#"<?xml version="1.0"?>
<package format="2">
  <name> talker </name>
  <version>0.1.0</version>
  <maintainer email="a@b.c">name</maintainer>
</package>"#,
        )
        .unwrap();
        assert_eq!(manifest_package_name(&manifest), Some("talker".to_string()));

        std::fs::write(&manifest, "<package><version>1</version></package>").unwrap();
        assert_eq!(manifest_package_name(&manifest), None);
    }

    #[tokio::test]
    async fn test_initialize_runs_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fake_settings(dir.path());
        let tools = dir.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        write_script(&tools.join("init"), "touch CMakeLists.txt");
        write_script(
            &tools.join("make"),
            "mkdir -p build devel && touch build/CMakeCache.txt devel/setup.bash",
        );
        settings.init_tool = tools.join("init").display().to_string();
        settings.make_command = tools.join("make").display().to_string();

        let ws = Workspace::new(dir.path().join("ws"));
        std::fs::create_dir_all(&ws.root).unwrap();
        let sourcer = EnvironmentSourcer::new(settings);
        ws.initialize(&sourcer, "kinetic", None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(ws.source_dir().join("CMakeLists.txt").is_file());
        assert!(ws.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_failure_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fake_settings(dir.path());
        let init = dir.path().join("init");
        write_script(&init, "echo 'cannot init' 1>&2; exit 4");
        settings.init_tool = init.display().to_string();

        let ws = Workspace::new(dir.path().join("ws"));
        let sourcer = EnvironmentSourcer::new(settings);
        let err = ws
            .initialize(&sourcer, "kinetic", None, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::SubprocessFailed { code, stderr, .. } => {
                assert_eq!(code, Some(4));
                assert_eq!(stderr, "cannot init\n");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!ws.is_initialized());
    }
}
