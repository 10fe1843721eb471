//! A catkin workspace imported as a project: the file and include model, its
//! persisted descriptor, and the build steps run against it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::build::{
    BuildConfiguration, BuildEvent, BuildOutcome, BuildStep, BuildStepConfig, StepList, Toolchain,
};
use crate::config::Settings;
use crate::descriptor::WorkspaceDescriptor;
use crate::env::{Environment, EnvironmentSourcer};
use crate::files::{self, PackageFileMap, UNGROUPED};
use crate::includes::{IncludePathSet, IncludeResolver};
use crate::process::LiveLog;
use crate::workspace::Workspace;

/// In-memory state of an imported workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectModel {
    pub name: String,
    pub workspace: Workspace,
    pub distribution: String,
    files: PackageFileMap,
    includes: IncludePathSet,
}

impl ProjectModel {
    /// Creates an empty model for `workspace`.
    pub fn new(name: impl Into<String>, workspace: Workspace, distribution: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workspace,
            distribution: distribution.into(),
            files: PackageFileMap::new(),
            includes: IncludePathSet::new(),
        }
    }

    /// `all`, `clean`, then one target per package.
    pub fn build_targets(&self) -> Vec<String> {
        let mut targets = vec!["all".to_string(), "clean".to_string()];
        targets.extend(
            self.files
                .packages()
                .filter(|p| *p != UNGROUPED)
                .map(str::to_string),
        );
        targets
    }

    /// All project files, package by package.
    pub fn files(&self) -> Vec<PathBuf> {
        self.files.files()
    }

    /// Project files grouped by package.
    pub fn package_files(&self) -> &PackageFileMap {
        &self.files
    }

    /// Include directories handed to the code model.
    pub fn includes(&self) -> &IncludePathSet {
        &self.includes
    }

    /// Adds files under their owning packages.
    pub fn add_files<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let src = self.workspace.source_dir();
        for path in paths {
            let path = path.as_ref();
            let package = files::owning_package(path, &src);
            self.files.insert_file(package, path);
        }
    }

    /// Removes files, returning how many were listed.
    pub fn remove_files<I, P>(&mut self, paths: I) -> usize
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        paths
            .into_iter()
            .filter(|p| self.files.remove_file(p.as_ref()))
            .count()
    }

    /// Renames a listed file in place.
    pub fn rename_file(&mut self, from: &Path, to: &Path) -> bool {
        self.files.rename_file(from, to)
    }

    /// Appends include directories not yet present.
    pub fn add_includes<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for p in paths {
            self.includes.insert(p);
        }
    }

    /// Replaces the include directories.
    pub fn set_includes(&mut self, includes: IncludePathSet) {
        self.includes = includes;
    }

    /// The model in its persisted form.
    pub fn descriptor(&self) -> WorkspaceDescriptor {
        WorkspaceDescriptor::new(self.files.clone(), self.includes.clone())
    }

    /// Where the descriptor lives: `<root>/<name>.workspace`.
    pub fn descriptor_path(&self) -> PathBuf {
        self.workspace.descriptor_path(&self.name)
    }
}

/// An imported workspace. At most one build or refresh runs at a time.
pub struct WorkspaceProject {
    settings: Settings,
    model: Mutex<ProjectModel>,
    /// Held for the whole of a build or refresh.
    operation: Mutex<()>,
}

impl WorkspaceProject {
    /// Wraps an existing model without touching the disk.
    pub fn new(settings: Settings, model: ProjectModel) -> Self {
        Self {
            settings,
            model: Mutex::new(model),
            operation: Mutex::new(()),
        }
    }

    /// Imports `root` as project `name`. An uninitialized workspace is
    /// initialized first; the first refresh writes the descriptor.
    pub async fn import_workspace(
        settings: Settings,
        name: &str,
        root: &Path,
        distribution: &str,
        live: Option<&LiveLog>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let workspace = Workspace::new(root);
        if !workspace.is_initialized() {
            info!(workspace = %root.display(), distribution, "initializing workspace");
            let sourcer = EnvironmentSourcer::new(settings.clone());
            workspace
                .initialize(&sourcer, distribution, live, cancel)
                .await
                .with_context(|| format!("Failed to initialize workspace {}", root.display()))?;
        }

        let project = Self::new(settings, ProjectModel::new(name, workspace, distribution));
        project.refresh(live, cancel).await?;
        Ok(project)
    }

    /// Restores a project from its descriptor. The workspace root is the
    /// descriptor's directory and the project name its file stem.
    pub fn load(settings: Settings, descriptor_path: &Path, distribution: &str) -> Result<Self> {
        let root = descriptor_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let name = descriptor_path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("Invalid descriptor path: {}", descriptor_path.display()))?;

        let descriptor = WorkspaceDescriptor::read(descriptor_path, root)
            .with_context(|| format!("Failed to load {}", descriptor_path.display()))?;

        let mut model = ProjectModel::new(name, Workspace::new(root), distribution);
        model.files = descriptor.files;
        model.includes = descriptor.includes;
        Ok(Self::new(settings, model))
    }

    /// Settings used for sourcing, CMake and builds.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Copy of the current model.
    pub async fn snapshot(&self) -> ProjectModel {
        self.model.lock().await.clone()
    }

    /// Applies an edit to the model and persists the descriptor.
    pub async fn edit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ProjectModel),
    {
        let mut model = self.model.lock().await;
        f(&mut model);
        write_descriptor(&model)
    }

    /// Re-sources the environment, re-resolves include paths, re-enumerates
    /// files and rewrites the descriptor.
    ///
    /// Sourcing failures fall back to the host environment. Include
    /// resolution failures keep the previous include set. Files and include
    /// paths are replaced together, and only once the descriptor is written.
    /// Fails if a build or another refresh is in progress.
    pub async fn refresh(&self, live: Option<&LiveLog>, cancel: &CancellationToken) -> Result<()> {
        let Ok(_operation) = self.operation.try_lock() else {
            anyhow::bail!("Build or refresh already in progress. Cancel first.");
        };
        let mut model = self.model.lock().await;
        let workspace = model.workspace.clone();

        let env = self.environment_for(&workspace, &model.distribution).await;

        let resolver = IncludeResolver::new(self.settings.clone());
        let includes = match resolver
            .resolve(
                &env,
                &workspace.source_dir(),
                &workspace.build_dir(),
                live,
                cancel,
            )
            .await
        {
            Ok(includes) => includes,
            Err(e) => {
                warn!(
                    error = %e,
                    kept = model.includes.len(),
                    "include path resolution failed; keeping previous include paths"
                );
                model.includes.clone()
            }
        };

        let src = workspace.source_dir();
        let enumerated = tokio::task::spawn_blocking(move || files::enumerate(&src))
            .await
            .context("File enumeration task panicked")?
            .context("Failed to enumerate workspace files")?;

        let mut next = model.clone();
        next.files = enumerated;
        next.includes = includes;
        write_descriptor(&next)?;
        *model = next;

        info!(
            project = %model.name,
            files = model.files.len(),
            includes = model.includes.len(),
            "workspace refreshed"
        );
        Ok(())
    }

    /// Settings for a new step in `list`.
    pub fn build_step(&self, list: StepList) -> BuildStepConfig {
        let mut config = BuildStepConfig::for_list(list);
        if self.settings.make_command != crate::build::DEFAULT_MAKE_COMMAND {
            config.command = Some(self.settings.make_command.clone());
        }
        config
    }

    /// Build configuration for this workspace under the sourced workspace environment.
    pub async fn build_configuration(&self) -> BuildConfiguration {
        let (workspace, distribution) = {
            let model = self.model.lock().await;
            (model.workspace.clone(), model.distribution.clone())
        };
        let environment = self.environment_for(&workspace, &distribution).await;
        // catkin_make is always invoked from the workspace root.
        BuildConfiguration {
            build_dir: workspace.root.clone(),
            environment,
            initial_arguments: Vec::new(),
            locale: self.settings.locale.clone(),
        }
    }

    /// Runs one build step. Fails if a build or refresh of this project is running.
    pub async fn build(
        &self,
        config: BuildStepConfig,
        toolchain: Option<&Toolchain>,
        events: Option<mpsc::UnboundedSender<BuildEvent>>,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let Ok(_operation) = self.operation.try_lock() else {
            anyhow::bail!("Build already in progress. Cancel first.");
        };

        let configuration = self.build_configuration().await;
        let mut step = BuildStep::new(config);
        if let Some(tx) = events {
            step = step.with_events(tx);
        }
        Ok(step.run(Some(&configuration), toolchain, cancel).await)
    }

    async fn environment_for(&self, workspace: &Workspace, distribution: &str) -> Environment {
        let sourcer = EnvironmentSourcer::new(self.settings.clone());
        match sourcer.source_workspace(&workspace.root, distribution).await {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "sourcing failed; using host environment");
                let mut env = Environment::from_host();
                env.set("LC_ALL", self.settings.locale.as_str());
                env
            }
        }
    }
}

fn write_descriptor(model: &ProjectModel) -> Result<()> {
    let path = model.descriptor_path();
    model
        .descriptor()
        .write(&path, &model.workspace.root)
        .with_context(|| format!("Failed to write {}", path.display()))
}
