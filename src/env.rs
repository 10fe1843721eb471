use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::process::{self, CommandSpec};

/// Ordered set of environment variables handed to every subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    vars: IndexMap<String, String>,
}

impl Environment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment.
    pub fn from_host() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Value of `name`, if set.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Sets `name`, keeping its position if it already exists.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Unsets `name`, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.vars.shift_remove(name)
    }

    /// Applies every variable of `other` on top of this one; `other` wins on conflicts.
    pub fn overlay(&mut self, other: &Environment) {
        for (k, v) in &other.vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    /// Variables in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` if no variable is set.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// `KEY=VALUE` strings in order.
    pub fn to_pairs(&self) -> Vec<String> {
        self.vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// Splits a colon-separated variable into its non-empty entries.
    pub fn search_paths(&self, name: &str) -> Vec<PathBuf> {
        self.get(name)
            .map(|v| {
                v.split(':')
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Obtains the environment established by ROS and workspace setup scripts.
#[derive(Debug, Clone)]
pub struct EnvironmentSourcer {
    settings: Settings,
}

impl EnvironmentSourcer {
    /// Creates a sourcer using the shell and ROS root from `settings`.
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Settings the sourcer was created with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Sources `<ros_root>/<distribution>/setup.bash` on top of the host environment.
    pub async fn source_distribution(&self, distribution: &str) -> Result<Environment> {
        self.source(distribution, None).await
    }

    /// Sources the distribution, then `<workspace>/devel/setup.bash` if it exists.
    pub async fn source_workspace(
        &self,
        workspace_root: &Path,
        distribution: &str,
    ) -> Result<Environment> {
        let ws_setup = workspace_root.join("devel").join("setup.bash");
        let ws_setup = ws_setup.is_file().then_some(ws_setup);
        self.source(distribution, ws_setup.as_deref()).await
    }

    async fn source(&self, distribution: &str, workspace_setup: Option<&Path>) -> Result<Environment> {
        let dist_setup = self.settings.distribution_setup(distribution);
        if !dist_setup.is_file() {
            return Err(Error::ToolMissing(format!(
                "ROS distribution '{}' is not installed ({} not found)",
                distribution,
                dist_setup.display()
            )));
        }

        let sentinel = unique_sentinel();
        let script = sourcing_script(&dist_setup, workspace_setup, &sentinel);

        let mut host = Environment::from_host();
        host.set("LC_ALL", self.settings.locale.clone());

        let spec = CommandSpec::new(&self.settings.shell)
            .arg("-c")
            .arg(script)
            .env(host);
        let output = process::run(&spec, None, &CancellationToken::new())
            .await?
            .check(&self.settings.shell)?;

        let mut env = parse_env_dump(&output.stdout, &sentinel)?;
        env.remove("_");
        env.set("LC_ALL", self.settings.locale.clone());
        debug!(
            distribution,
            workspace = ?workspace_setup,
            vars = env.len(),
            "sourced environment"
        );
        Ok(env)
    }
}

fn unique_sentinel() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!(
        "__CATKINKIT_ENV_{}_{}_{}__",
        std::process::id(),
        nanos,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Builds the shell script that sources the setup files and dumps the environment.
pub fn sourcing_script(dist_setup: &Path, workspace_setup: Option<&Path>, sentinel: &str) -> String {
    let mut script = format!("source {}\n", shell_quote(&dist_setup.to_string_lossy()));
    if let Some(ws) = workspace_setup {
        script.push_str(&format!("source {}\n", shell_quote(&ws.to_string_lossy())));
    }
    script.push_str(&format!("echo {}\nenv -0\n", shell_quote(sentinel)));
    script
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Parses an `env -0` dump that follows a `sentinel` line.
///
/// Entries are NUL-terminated, so values may span lines. Entries whose name
/// is not a shell variable name (exported bash functions such as
/// `BASH_FUNC_name%%`) are dropped.
pub fn parse_env_dump(output: &str, sentinel: &str) -> Result<Environment> {
    let mut offset = 0;
    let mut found = false;
    for line in output.split_inclusive('\n') {
        offset += line.len();
        if line.trim_end() == sentinel {
            found = true;
            break;
        }
    }
    if !found {
        return Err(Error::ParseFailure(
            "environment dump sentinel not found in shell output".to_string(),
        ));
    }

    let mut vars: IndexMap<String, String> = IndexMap::new();
    for entry in output[offset..].split('\0') {
        if entry.trim().is_empty() {
            continue;
        }
        match split_assignment(entry) {
            Some((name, value)) => {
                vars.insert(name.to_string(), value.to_string());
            }
            None => {
                let name = entry.split_once('=').map_or(entry, |(n, _)| n);
                debug!(entry = %name, "skipping non-variable environment entry");
            }
        }
    }
    Ok(Environment { vars })
}

fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once('=')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, value))
}
