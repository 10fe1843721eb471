use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::includes::normalize_path;
use crate::process::{self, CommandSpec, OutputLine, Stream};

/// Build command used when a step does not override it.
pub const DEFAULT_MAKE_COMMAND: &str = "catkin_make";

const BUILD_TARGETS_KEY: &str = "ROSProjectManager.ROSMakeStep.BuildTargets";
const MAKE_ARGUMENTS_KEY: &str = "ROSProjectManager.ROSMakeStep.MakeArguments";
const MAKE_COMMAND_KEY: &str = "ROSProjectManager.ROSMakeStep.MakeCommand";
const CLEAN_KEY: &str = "ROSProjectManager.ROSMakeStep.Clean";

/// Ordered set of targets passed to the build tool. Adding a present target
/// or removing an absent one changes nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildTargetSet {
    targets: Vec<String>,
}

impl BuildTargetSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `target`. Returns `false` if it was already present.
    pub fn insert(&mut self, target: impl Into<String>) -> bool {
        let target = target.into();
        if self.contains(&target) {
            return false;
        }
        self.targets.push(target);
        true
    }

    /// Removes `target`. Returns `false` if it was absent.
    pub fn remove(&mut self, target: &str) -> bool {
        let before = self.targets.len();
        self.targets.retain(|t| t != target);
        self.targets.len() != before
    }

    /// Turns `target` on or off.
    pub fn set(&mut self, target: &str, on: bool) {
        if on {
            self.insert(target);
        } else {
            self.remove(target);
        }
    }

    /// Returns `true` if `target` is selected.
    pub fn contains(&self, target: &str) -> bool {
        self.targets.iter().any(|t| t == target)
    }

    /// Targets in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(String::as_str)
    }

    /// Number of selected targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns `true` if no target is selected.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for BuildTargetSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut set = Self::new();
        for t in iter {
            set.insert(t);
        }
        set
    }
}

/// Step list a build step is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepList {
    Build,
    Clean,
}

/// Change requested by an editor of a step's settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepUpdate {
    SetTarget { target: String, on: bool },
    SetArguments(String),
    /// `None` or an empty string restores the default command.
    SetCommand(Option<String>),
}

/// Settings of one build or clean step, captured when the step starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStepConfig {
    pub targets: BuildTargetSet,
    /// Extra arguments as typed by the user; split shell-style at launch.
    pub arguments: String,
    pub command: Option<String>,
    /// Clean steps succeed even when the tool exits non-zero.
    pub clean: bool,
}

impl BuildStepConfig {
    /// Default settings for a step added to `list`: `all` for builds, `clean` for cleans.
    pub fn for_list(list: StepList) -> Self {
        let mut config = Self::default();
        match list {
            StepList::Build => {
                config.targets.insert("all");
            }
            StepList::Clean => {
                config.clean = true;
                config.targets.insert("clean");
            }
        }
        config
    }

    /// The configured command, or [`DEFAULT_MAKE_COMMAND`] when unset or blank.
    pub fn make_command(&self) -> &str {
        match self.command.as_deref() {
            Some(cmd) if !cmd.trim().is_empty() => cmd,
            _ => DEFAULT_MAKE_COMMAND,
        }
    }

    /// `initial` configuration arguments, then the extra arguments, then the targets.
    pub fn all_arguments(&self, initial: &[String]) -> Vec<String> {
        let mut args = initial.to_vec();
        args.extend(split_arguments(&self.arguments));
        args.extend(self.targets.iter().map(str::to_string));
        args
    }

    /// Returns a copy of the settings with `update` applied.
    pub fn with_update(mut self, update: StepUpdate) -> Self {
        match update {
            StepUpdate::SetTarget { target, on } => self.targets.set(&target, on),
            StepUpdate::SetArguments(args) => self.arguments = args,
            StepUpdate::SetCommand(cmd) => {
                self.command = cmd.filter(|c| !c.trim().is_empty());
            }
        }
        self
    }

    /// Settings as the persisted key/value map.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            BUILD_TARGETS_KEY.to_string(),
            Value::Array(self.targets.iter().map(Value::from).collect()),
        );
        map.insert(
            MAKE_ARGUMENTS_KEY.to_string(),
            Value::from(self.arguments.clone()),
        );
        map.insert(
            MAKE_COMMAND_KEY.to_string(),
            Value::from(self.command.clone().unwrap_or_default()),
        );
        map.insert(CLEAN_KEY.to_string(), Value::from(self.clean));
        map
    }

    /// Restores settings from a persisted map. Absent keys take their defaults.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let targets = match map.get(BUILD_TARGETS_KEY) {
            None | Some(Value::Null) => BuildTargetSet::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        Error::ParseFailure(format!("{} must hold strings", BUILD_TARGETS_KEY))
                    })
                })
                .collect::<Result<BuildTargetSet>>()?,
            Some(_) => {
                return Err(Error::ParseFailure(format!(
                    "{} must be a list",
                    BUILD_TARGETS_KEY
                )));
            }
        };
        let command = string_at(map, MAKE_COMMAND_KEY);

        Ok(Self {
            targets,
            arguments: string_at(map, MAKE_ARGUMENTS_KEY).to_string(),
            command: (!command.is_empty()).then(|| command.to_string()),
            clean: map.get(CLEAN_KEY).and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

fn string_at<'a>(map: &'a Map<String, Value>, key: &str) -> &'a str {
    map.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Splits an argument string the way a POSIX shell would, without expansion.
pub fn split_arguments(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        _ => current.push(q),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}

/// The build configuration a step runs under.
#[derive(Debug, Clone)]
pub struct BuildConfiguration {
    /// Directory the build tool runs in.
    pub build_dir: PathBuf,
    /// Sourced workspace environment.
    pub environment: Environment,
    /// Arguments the configuration always passes first.
    pub initial_arguments: Vec<String>,
    /// Value forced into `LC_ALL` for the build tool.
    pub locale: String,
}

/// A resolved compiler toolchain.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub name: String,
    pub compiler: PathBuf,
}

/// Fully resolved command line of a step.
#[derive(Debug, Clone)]
pub struct ProcessParameters {
    pub command: String,
    pub arguments: Vec<String>,
    pub working_dir: PathBuf,
    pub environment: Environment,
}

impl ProcessParameters {
    /// `<cwd>$ <command> <args>`, for display next to the step.
    pub fn summary(&self) -> String {
        format!(
            "{}$ {}",
            self.working_dir.display(),
            process::format_command(&self.command, &self.arguments)
        )
    }

    fn to_spec(&self) -> CommandSpec {
        CommandSpec::new(&self.command)
            .args(self.arguments.iter().cloned())
            .current_dir(&self.working_dir)
            .env(self.environment.clone())
    }
}

/// How serious a [`Diagnostic`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// A problem reported by the build tool or compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    pub message: String,
}

impl Diagnostic {
    fn configuration(message: &str) -> Self {
        Self {
            severity: Severity::Error,
            file: None,
            line: None,
            message: message.to_string(),
        }
    }
}

/// What a single output line means to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Progress(u8),
    Diagnostic(Diagnostic),
    Ignore,
}

/// Turns build-tool output lines into progress updates and diagnostics.
pub trait LineClassifier: Send {
    /// Classifies one line of output from `stream`.
    fn classify(&mut self, line: &str, stream: Stream) -> Classification;

    /// Directory the build tool starts in. Relative paths in diagnostics are
    /// resolved against it.
    fn set_working_directory(&mut self, _dir: &Path) {}
}

/// Recognizes one family of diagnostic lines.
pub trait DiagnosticMatcher: Send + Sync {
    fn parse(&self, line: &str) -> Option<Diagnostic>;
}

static PERCENT_PROGRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s{0,2}(\d{1,3})%\]").expect("valid regex"));

static GCC_DIAGNOSTIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<file>[^\s:][^:]*):(?P<line>\d+):(?:\d+:)?\s+(?P<sev>fatal error|error|warning|note):\s*(?P<msg>.*)$",
    )
    .expect("valid regex")
});

static MAKE_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[\w./-]*make)(?:\[\d+\])?: \*\*\* (?P<msg>.*)$").expect("valid regex")
});

static MAKE_DIRECTORY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?:[\w./-]*make)(?:\[\d+\])?: (?P<action>Entering|Leaving) directory [`'"](?P<dir>.*)['"]$"#,
    )
    .expect("valid regex")
});

static CMAKE_DIAGNOSTIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^CMake (?P<sev>Error|Warning)(?: \(dev\))? at (?P<file>[^:]+):(?P<line>\d+)")
        .expect("valid regex")
});

/// `file:line[:col]: error|warning|note: message` as printed by GCC and Clang.
#[derive(Debug, Clone, Copy, Default)]
pub struct GccMatcher;

impl DiagnosticMatcher for GccMatcher {
    fn parse(&self, line: &str) -> Option<Diagnostic> {
        let caps = GCC_DIAGNOSTIC.captures(line)?;
        let severity = match &caps["sev"] {
            "warning" => Severity::Warning,
            "note" => Severity::Note,
            _ => Severity::Error,
        };
        Some(Diagnostic {
            severity,
            file: Some(PathBuf::from(&caps["file"])),
            line: caps["line"].parse().ok(),
            message: caps["msg"].trim().to_string(),
        })
    }
}

/// `make[N]: *** [target] Error N`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeMatcher;

impl DiagnosticMatcher for MakeMatcher {
    fn parse(&self, line: &str) -> Option<Diagnostic> {
        let caps = MAKE_ERROR.captures(line)?;
        Some(Diagnostic {
            severity: Severity::Error,
            file: None,
            line: None,
            message: caps["msg"].trim().to_string(),
        })
    }
}

/// `CMake Error at CMakeLists.txt:12 (find_package):`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CMakeMatcher;

impl DiagnosticMatcher for CMakeMatcher {
    fn parse(&self, line: &str) -> Option<Diagnostic> {
        let caps = CMAKE_DIAGNOSTIC.captures(line)?;
        let severity = if &caps["sev"] == "Warning" {
            Severity::Warning
        } else {
            Severity::Error
        };
        Some(Diagnostic {
            severity,
            file: Some(PathBuf::from(&caps["file"])),
            line: caps["line"].parse().ok(),
            message: line.trim().trim_end_matches(':').to_string(),
        })
    }
}

/// Classifier for `catkin_make` output: `[ NN%]` progress markers plus any
/// number of diagnostic matchers, tried in order.
///
/// make's `Entering directory` / `Leaving directory` lines are tracked so
/// relative diagnostic paths resolve to real files.
pub struct CatkinMakeClassifier {
    matchers: Vec<Box<dyn DiagnosticMatcher>>,
    working_dir: Option<PathBuf>,
    directories: Vec<PathBuf>,
}

impl CatkinMakeClassifier {
    /// Classifier with the GCC, make and CMake matchers.
    pub fn new() -> Self {
        Self {
            matchers: vec![
                Box::new(GccMatcher),
                Box::new(MakeMatcher),
                Box::new(CMakeMatcher),
            ],
            working_dir: None,
            directories: Vec::new(),
        }
    }

    /// Classifier recognizing progress only, with no diagnostic matchers.
    pub fn progress_only() -> Self {
        Self {
            matchers: Vec::new(),
            working_dir: None,
            directories: Vec::new(),
        }
    }

    /// Adds a matcher tried after the existing ones.
    pub fn with_matcher(mut self, matcher: impl DiagnosticMatcher + 'static) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }
}

impl Default for CatkinMakeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CatkinMakeClassifier {
    fn current_dir(&self) -> Option<&Path> {
        self.directories
            .last()
            .or(self.working_dir.as_ref())
            .map(PathBuf::as_path)
    }

    fn track_directory(&mut self, line: &str) -> bool {
        let Some(caps) = MAKE_DIRECTORY.captures(line) else {
            return false;
        };
        if &caps["action"] == "Entering" {
            self.directories.push(PathBuf::from(&caps["dir"]));
        } else {
            self.directories.pop();
        }
        true
    }
}

impl LineClassifier for CatkinMakeClassifier {
    fn classify(&mut self, line: &str, _stream: Stream) -> Classification {
        if let Some(percent) = parse_progress(line) {
            return Classification::Progress(percent);
        }
        if self.track_directory(line) {
            return Classification::Ignore;
        }
        let Some(mut diagnostic) = self.matchers.iter().find_map(|m| m.parse(line)) else {
            return Classification::Ignore;
        };
        let resolved = match (diagnostic.file.as_deref(), self.current_dir()) {
            (Some(file), Some(dir)) if file.is_relative() => Some(normalize_path(&dir.join(file))),
            _ => None,
        };
        if resolved.is_some() {
            diagnostic.file = resolved;
        }
        Classification::Diagnostic(diagnostic)
    }

    fn set_working_directory(&mut self, dir: &Path) {
        self.working_dir = Some(dir.to_path_buf());
        self.directories.clear();
    }
}

/// Returns the last `[ NN%]` marker on the line, if any.
pub fn parse_progress(line: &str) -> Option<u8> {
    PERCENT_PROGRESS
        .captures_iter(line)
        .filter_map(|c| c[1].parse::<u8>().ok())
        .filter(|p| *p <= 100)
        .last()
}

/// Lifecycle of one step invocation. `Succeeded` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildState {
    Idle,
    Configuring,
    Running,
    Succeeded,
    Failed,
}

impl BuildState {
    /// Returns `true` for `Succeeded` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildState::Succeeded | BuildState::Failed)
    }
}

/// Notifications emitted while a step runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    State(BuildState),
    Progress(u8),
    Diagnostic(Diagnostic),
    Output(OutputLine),
}

/// Final result of [`BuildStep::run`].
#[derive(Debug)]
pub struct BuildOutcome {
    pub state: BuildState,
    pub progress: u8,
    pub exit_code: Option<i32>,
    /// Why the step failed before or while running the tool, if it did.
    pub error: Option<Error>,
}

/// Drives one invocation of the build tool. A new invocation needs a new step.
pub struct BuildStep<C: LineClassifier = CatkinMakeClassifier> {
    config: BuildStepConfig,
    classifier: C,
    state: BuildState,
    progress: u8,
    events: Option<mpsc::UnboundedSender<BuildEvent>>,
}

impl BuildStep<CatkinMakeClassifier> {
    /// Creates a step that classifies output with [`CatkinMakeClassifier`].
    pub fn new(config: BuildStepConfig) -> Self {
        Self::with_classifier(config, CatkinMakeClassifier::new())
    }
}

impl<C: LineClassifier> BuildStep<C> {
    /// Creates a step with a custom output classifier.
    pub fn with_classifier(config: BuildStepConfig, classifier: C) -> Self {
        Self {
            config,
            classifier,
            state: BuildState::Idle,
            progress: 0,
            events: None,
        }
    }

    /// Sends every state change, progress value, diagnostic and output line to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<BuildEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Settings snapshot the step was created with.
    pub fn config(&self) -> &BuildStepConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Last observed progress, 0 to 100.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Validates preconditions and resolves the command line.
    ///
    /// A missing configuration or toolchain moves the step straight to
    /// `Failed` and reports one diagnostic per missing piece.
    pub fn init(
        &mut self,
        configuration: Option<&BuildConfiguration>,
        toolchain: Option<&Toolchain>,
    ) -> Result<ProcessParameters> {
        self.transition(BuildState::Configuring);

        if configuration.is_none() {
            self.emit(BuildEvent::Diagnostic(Diagnostic::configuration(
                "No build configuration is set up for this target.",
            )));
        }
        if toolchain.is_none() {
            self.emit(BuildEvent::Diagnostic(Diagnostic::configuration(
                "No compiler toolchain is set up for this kit.",
            )));
        }
        let (Some(bc), Some(_)) = (configuration, toolchain) else {
            self.transition(BuildState::Failed);
            let missing = match (configuration.is_none(), toolchain.is_none()) {
                (true, true) => "build configuration and toolchain",
                (true, false) => "build configuration",
                _ => "toolchain",
            };
            return Err(Error::ConfigurationMissing(missing));
        };

        let mut environment = bc.environment.clone();
        environment.set("LC_ALL", bc.locale.as_str());
        self.classifier.set_working_directory(&bc.build_dir);

        Ok(ProcessParameters {
            command: self.config.make_command().to_string(),
            arguments: self.config.all_arguments(&bc.initial_arguments),
            working_dir: bc.build_dir.clone(),
            environment,
        })
    }

    /// Marks the tool as launched and resets progress to 0.
    pub fn process_started(&mut self) {
        self.progress = 0;
        self.transition(BuildState::Running);
        self.emit(BuildEvent::Progress(0));
    }

    /// Feeds one output line through the classifier.
    pub fn std_output(&mut self, line: OutputLine) {
        if self.state != BuildState::Running {
            return;
        }
        match self.classifier.classify(&line.text, line.stream) {
            Classification::Progress(p) => {
                self.progress = p;
                self.emit(BuildEvent::Progress(p));
            }
            Classification::Diagnostic(d) => self.emit(BuildEvent::Diagnostic(d)),
            Classification::Ignore => {}
        }
        self.emit(BuildEvent::Output(line));
    }

    /// Forces progress to 100 and settles the final state from the exit code.
    pub fn process_finished(&mut self, exit_code: Option<i32>) -> BuildState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.progress = 100;
        self.emit(BuildEvent::Progress(100));
        let succeeded = exit_code == Some(0) || self.config.clean;
        if !succeeded {
            warn!(code = ?exit_code, "build step failed");
        } else if exit_code != Some(0) {
            debug!(code = ?exit_code, "ignoring exit code of clean step");
        }
        self.transition(if succeeded {
            BuildState::Succeeded
        } else {
            BuildState::Failed
        });
        self.state
    }

    /// Runs the whole invocation: init, spawn, drain output, settle.
    pub async fn run(
        &mut self,
        configuration: Option<&BuildConfiguration>,
        toolchain: Option<&Toolchain>,
        cancel: &CancellationToken,
    ) -> BuildOutcome {
        if self.state != BuildState::Idle {
            warn!(state = ?self.state, "build step already ran");
            return self.outcome(None, None);
        }

        let params = match self.init(configuration, toolchain) {
            Ok(p) => p,
            Err(e) => return self.outcome(None, Some(e)),
        };
        info!(command = %params.summary(), "starting build step");

        self.process_started();
        let spec = params.to_spec();
        let result = process::run_streaming(&spec, cancel, |line| self.std_output(line)).await;

        match result {
            Ok(code) => {
                let state = self.process_finished(code);
                info!(?state, code = ?code, "build step finished");
                self.outcome(code, None)
            }
            Err(e) => {
                warn!(error = %e, "build step aborted");
                self.transition(BuildState::Failed);
                self.outcome(None, Some(e))
            }
        }
    }

    fn outcome(&self, exit_code: Option<i32>, error: Option<Error>) -> BuildOutcome {
        BuildOutcome {
            state: self.state,
            progress: self.progress,
            exit_code,
            error,
        }
    }

    fn transition(&mut self, next: BuildState) {
        if self.state.is_terminal() || self.state == next {
            return;
        }
        self.state = next;
        self.emit(BuildEvent::State(next));
    }

    fn emit(&self, event: BuildEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn out(text: &str) -> OutputLine {
        OutputLine {
            stream: Stream::Stdout,
            text: text.to_string(),
        }
    }

    fn sh_config(script: &str, clean: bool) -> BuildStepConfig {
        BuildStepConfig {
            targets: BuildTargetSet::new(),
            arguments: format!("-c '{}'", script.replace('\'', r"'\''")),
            command: Some("sh".to_string()),
            clean,
        }
    }

    fn configuration(dir: &std::path::Path) -> BuildConfiguration {
        BuildConfiguration {
            build_dir: dir.to_path_buf(),
            environment: Environment::from_host(),
            initial_arguments: Vec::new(),
            locale: crate::config::DEFAULT_LOCALE.to_string(),
        }
    }

    fn toolchain() -> Toolchain {
        Toolchain {
            name: "GCC".to_string(),
            compiler: PathBuf::from("/usr/bin/g++"),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<BuildEvent>) -> Vec<BuildEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[test]
    fn test_target_set_idempotent() {
        let mut set: BuildTargetSet = ["all", "install"].into_iter().collect();
        assert!(!set.insert("all"));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["all", "install"]);
        assert!(!set.remove("tests"));
        assert_eq!(set.len(), 2);
        set.set("install", false);
        set.set("install", false);
        set.set("run_tests", true);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["all", "run_tests"]);
    }

    #[test]
    fn test_progress_parsing() {
        assert_eq!(parse_progress("[ 45%] Building CXX object foo.o"), Some(45));
        assert_eq!(parse_progress("[100%] Built target bar"), Some(100));
        assert_eq!(parse_progress("[  3%] Generating messages"), Some(3));
        assert_eq!(parse_progress("[ 82%] [ 87%] Linking"), Some(87));
        assert_eq!(parse_progress("[999%] bogus"), None);
        assert_eq!(parse_progress("no progress here"), None);
    }

    #[test]
    fn test_gcc_matcher() {
        let d = GccMatcher
            .parse("/ws/src/talker/src/talker.cpp:12:5: error: 'ros' was not declared")
            .unwrap();
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.file, Some(PathBuf::from("/ws/src/talker/src/talker.cpp")));
        assert_eq!(d.line, Some(12));
        assert_eq!(d.message, "'ros' was not declared");

        let w = GccMatcher.parse("a.h:3: warning: unused variable").unwrap();
        assert_eq!(w.severity, Severity::Warning);
        assert!(GccMatcher.parse("Scanning dependencies of target talker").is_none());
    }

    #[test]
    fn test_make_and_cmake_matchers() {
        let d = MakeMatcher
            .parse("make[2]: *** [talker/CMakeFiles/talker.dir/src/talker.cpp.o] Error 1")
            .unwrap();
        assert_eq!(d.severity, Severity::Error);
        assert!(d.file.is_none());

        let c = CMakeMatcher
            .parse("CMake Error at talker/CMakeLists.txt:7 (find_package):")
            .unwrap();
        assert_eq!(c.file, Some(PathBuf::from("talker/CMakeLists.txt")));
        assert_eq!(c.line, Some(7));
    }

    #[test]
    fn test_diagnostic_paths_follow_make_directories() {
        let mut classifier = CatkinMakeClassifier::new();
        classifier.set_working_directory(Path::new("/ws"));

        let file_of = |c: Classification| match c {
            Classification::Diagnostic(d) => d.file,
            other => panic!("expected a diagnostic, got {other:?}"),
        };

        let top = classifier.classify("src/a.cpp:3:1: error: boom", Stream::Stderr);
        assert_eq!(file_of(top), Some(PathBuf::from("/ws/src/a.cpp")));

        assert_eq!(
            classifier.classify("make[2]: Entering directory '/ws/build/talker'", Stream::Stdout),
            Classification::Ignore
        );
        let nested = classifier.classify(
            "CMake Warning at ./CMakeLists.txt:4 (message):",
            Stream::Stderr,
        );
        assert_eq!(file_of(nested), Some(PathBuf::from("/ws/build/talker/CMakeLists.txt")));

        let absolute = classifier.classify("/usr/include/x.h:1: warning: w", Stream::Stderr);
        assert_eq!(file_of(absolute), Some(PathBuf::from("/usr/include/x.h")));

        classifier.classify("make[2]: Leaving directory '/ws/build/talker'", Stream::Stdout);
        let back = classifier.classify("b.cpp:9: error: e", Stream::Stderr);
        assert_eq!(file_of(back), Some(PathBuf::from("/ws/b.cpp")));
    }

    #[test]
    fn test_split_arguments() {
        assert_eq!(
            split_arguments(r#"-j4  -DCMAKE_BUILD_TYPE=Release "a b" 'c d' e\ f"#),
            vec!["-j4", "-DCMAKE_BUILD_TYPE=Release", "a b", "c d", "e f"]
        );
        assert!(split_arguments("   ").is_empty());
        assert_eq!(split_arguments("''"), vec![""]);
    }

    #[test]
    fn test_all_arguments_order() {
        let config = BuildStepConfig {
            targets: ["all", "install"].into_iter().collect(),
            arguments: "-j8".to_string(),
            command: None,
            clean: false,
        };
        assert_eq!(config.make_command(), "catkin_make");
        assert_eq!(
            config.all_arguments(&["--cmake-args".to_string()]),
            vec!["--cmake-args", "-j8", "all", "install"]
        );
    }

    #[test]
    fn test_map_round_trip_and_defaults() {
        let config = BuildStepConfig::for_list(StepList::Clean)
            .with_update(StepUpdate::SetArguments("-j2".to_string()))
            .with_update(StepUpdate::SetCommand(Some("catkin_make_isolated".to_string())));
        let map = config.to_map();
        assert_eq!(map[CLEAN_KEY], Value::Bool(true));
        assert_eq!(BuildStepConfig::from_map(&map).unwrap(), config);

        let empty = BuildStepConfig::from_map(&Map::new()).unwrap();
        assert_eq!(empty, BuildStepConfig::default());
        assert_eq!(empty.make_command(), DEFAULT_MAKE_COMMAND);

        let mut bad = Map::new();
        bad.insert(BUILD_TARGETS_KEY.to_string(), Value::from("all"));
        assert!(BuildStepConfig::from_map(&bad).is_err());
    }

    #[test]
    fn test_step_list_defaults() {
        let build = BuildStepConfig::for_list(StepList::Build);
        assert!(!build.clean);
        assert!(build.targets.contains("all"));
        let clean = BuildStepConfig::for_list(StepList::Clean);
        assert!(clean.clean);
        assert!(clean.targets.contains("clean"));
    }

    #[test]
    fn test_progress_line_does_not_finish_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = BuildStep::new(BuildStepConfig::for_list(StepList::Build));
        step.init(Some(&configuration(dir.path())), Some(&toolchain()))
            .unwrap();
        step.process_started();

        step.std_output(out("[ 45%] Building CXX object foo.o"));
        assert_eq!(step.progress(), 45);
        step.std_output(out("[100%] Built target bar"));
        assert_eq!(step.progress(), 100);
        assert_eq!(step.state(), BuildState::Running);

        assert_eq!(step.process_finished(Some(0)), BuildState::Succeeded);
        assert_eq!(step.process_finished(Some(1)), BuildState::Succeeded);
    }

    #[test]
    fn test_init_sets_locale_and_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let mut bc = configuration(dir.path());
        bc.environment.set("LC_ALL", "de_DE.UTF-8");
        bc.locale = "POSIX".to_string();
        bc.initial_arguments = vec!["-C".to_string(), dir.path().display().to_string()];

        let mut step = BuildStep::new(BuildStepConfig::for_list(StepList::Build));
        let params = step.init(Some(&bc), Some(&toolchain())).unwrap();
        assert_eq!(params.environment.get("LC_ALL"), Some("POSIX"));
        assert_eq!(params.command, "catkin_make");
        assert_eq!(params.arguments.last().map(String::as_str), Some("all"));
        assert_eq!(params.working_dir, dir.path());
        assert_eq!(
            params.summary(),
            format!(
                "{0}$ catkin_make -C {0} all",
                dir.path().display()
            )
        );
    }

    #[tokio::test]
    async fn test_missing_toolchain_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let config = sh_config(&format!("touch {}", marker.display()), false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut step = BuildStep::new(config).with_events(tx);

        let outcome = step
            .run(Some(&configuration(dir.path())), None, &CancellationToken::new())
            .await;

        assert_eq!(outcome.state, BuildState::Failed);
        assert!(matches!(outcome.error, Some(Error::ConfigurationMissing("toolchain"))));
        assert!(!marker.exists());
        let events = drain(&mut rx);
        assert_eq!(
            events.first(),
            Some(&BuildEvent::State(BuildState::Configuring))
        );
        assert_eq!(events.last(), Some(&BuildEvent::State(BuildState::Failed)));
        assert!(!events.contains(&BuildEvent::State(BuildState::Running)));
    }

    #[tokio::test]
    async fn test_missing_configuration_short_circuits() {
        let mut step = BuildStep::new(BuildStepConfig::for_list(StepList::Build));
        let outcome = step
            .run(None, Some(&toolchain()), &CancellationToken::new())
            .await;
        assert_eq!(outcome.state, BuildState::Failed);
        assert_eq!(
            outcome.error.map(|e| e.kind()),
            Some(crate::ErrorKind::ConfigurationMissing)
        );
    }

    #[tokio::test]
    async fn test_run_tracks_progress_and_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let script = "echo \"[ 10%] Building CXX object a.o\"; \
                      echo \"src/a.cpp:3:1: warning: unused\" 1>&2; \
                      echo \"[ 45%] Building CXX object b.o\"; \
                      echo \"[ 90%] Linking\"; exit 0";
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut step = BuildStep::new(sh_config(script, false)).with_events(tx);

        let outcome = step
            .run(
                Some(&configuration(dir.path())),
                Some(&toolchain()),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.state, BuildState::Succeeded);
        assert_eq!(outcome.progress, 100);
        assert_eq!(outcome.exit_code, Some(0));

        let events = drain(&mut rx);
        let progress: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                BuildEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0, 10, 45, 90, 100]);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        let diagnostics: Vec<&Diagnostic> = events
            .iter()
            .filter_map(|e| match e {
                BuildEvent::Diagnostic(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
        assert_eq!(diagnostics[0].line, Some(3));
        assert_eq!(diagnostics[0].file, Some(dir.path().join("src/a.cpp")));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_build_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = BuildStep::new(sh_config("echo '[ 50%] x'; exit 2", false));
        let outcome = step
            .run(
                Some(&configuration(dir.path())),
                Some(&toolchain()),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.state, BuildState::Failed);
        assert_eq!(outcome.exit_code, Some(2));
        assert_eq!(outcome.progress, 100);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_non_zero_exit_tolerated_for_clean_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = BuildStep::new(sh_config("exit 2", true));
        let outcome = step
            .run(
                Some(&configuration(dir.path())),
                Some(&toolchain()),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.state, BuildState::Succeeded);
        assert_eq!(outcome.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_step_runs_in_build_dir_with_targets() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildStepConfig {
            targets: ["all", "install"].into_iter().collect(),
            arguments: r#"-c 'pwd; echo "$LC_ALL $0 $1"'"#.to_string(),
            command: Some("sh".to_string()),
            clean: false,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut step = BuildStep::new(config).with_events(tx);
        let outcome = step
            .run(
                Some(&configuration(dir.path())),
                Some(&toolchain()),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.state, BuildState::Succeeded);

        let lines: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                BuildEvent::Output(l) => Some(l.text),
                _ => None,
            })
            .collect();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(&lines[0]).canonicalize().unwrap(),
            canonical
        );
        assert_eq!(lines[1], "C all install");
    }

    #[tokio::test]
    async fn test_missing_tool_fails_step() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildStepConfig {
            command: Some("no-such-catkin-make".to_string()),
            ..BuildStepConfig::for_list(StepList::Build)
        };
        let mut step = BuildStep::new(config);
        let outcome = step
            .run(
                Some(&configuration(dir.path())),
                Some(&toolchain()),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.state, BuildState::Failed);
        assert_eq!(
            outcome.error.map(|e| e.kind()),
            Some(crate::ErrorKind::ToolMissing)
        );
    }

    #[tokio::test]
    async fn test_step_cannot_be_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = BuildStep::new(sh_config("exit 0", false));
        let bc = configuration(dir.path());
        let first = step.run(Some(&bc), Some(&toolchain()), &CancellationToken::new()).await;
        assert_eq!(first.state, BuildState::Succeeded);
        let second = step.run(Some(&bc), Some(&toolchain()), &CancellationToken::new()).await;
        assert_eq!(second.state, BuildState::Succeeded);
        assert_eq!(second.exit_code, None);
    }
}
