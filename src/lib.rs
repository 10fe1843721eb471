//! ROS 1 catkin toolkit library: workspace discovery, environment sourcing,
//! include-path resolution, project descriptors, and `catkin_make` build
//! orchestration with live progress and diagnostics.

/// `catkin_make` build steps: targets, output classification, state machine.
pub mod build;
/// Tool locations and install-root settings.
pub mod config;
/// Persisted `<name>.workspace` descriptor.
pub mod descriptor;
/// Environment capture by sourcing ROS setup scripts.
pub mod env;
/// Error taxonomy shared by every module.
pub mod error;
/// Workspace source files grouped by package.
pub mod files;
/// Include directories from CMake's CodeBlocks project file.
pub mod includes;
/// `rospack` queries, launch files, and package executables.
pub mod packages;
/// Subprocess launching, output streaming, and cancellation.
pub mod process;
/// Imported workspaces: refresh, persistence, and builds.
pub mod project;
/// Workspace layout, initialization state, and installed distributions.
pub mod workspace;

pub use build::{
    BuildConfiguration, BuildEvent, BuildOutcome, BuildState, BuildStep, BuildStepConfig,
    BuildTargetSet, CatkinMakeClassifier, Classification, Diagnostic, LineClassifier, Severity,
    StepList, StepUpdate, Toolchain,
};
pub use config::Settings;
pub use descriptor::WorkspaceDescriptor;
pub use env::{Environment, EnvironmentSourcer};
pub use error::{Error, ErrorKind, Result};
pub use files::PackageFileMap;
pub use includes::{IncludePathSet, IncludeResolver};
pub use packages::PackageIndex;
pub use process::{LiveLog, OutputLine, Stream};
pub use project::{ProjectModel, WorkspaceProject};
pub use workspace::Workspace;
