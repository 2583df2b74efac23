//! Child process environment layering.
//!
//! The server's environment is built from an ordered list of layers, lowest
//! precedence first: the launcher's inherited environment, the captured
//! login-shell environment, then the fixed server overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::shell_env::EnvironmentSnapshot;

/// Loopback host the server binds to.
pub const SERVER_HOST: &str = "127.0.0.1";

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

/// Where a variable came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvSource {
    Inherited,
    Shell,
    Overrides,
}

#[derive(Debug, Clone)]
pub struct EnvLayer {
    pub source: EnvSource,
    pub vars: BTreeMap<String, String>,
}

impl EnvLayer {
    pub fn new(source: EnvSource, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            source,
            vars: vars.into_iter().collect(),
        }
    }
}

/// Fold layers in order; later layers win.
pub fn merge_layers(layers: &[EnvLayer]) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        for (key, value) in &layer.vars {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Values the launcher forces on the server.
#[derive(Debug, Clone)]
pub struct ServerOverrides {
    pub port: u16,
    pub data_dir: PathBuf,
    pub home: Option<PathBuf>,
    /// Prepended to the resolved `PATH`, in order.
    pub extra_path_dirs: Vec<PathBuf>,
}

impl ServerOverrides {
    fn into_layer(self, base_path: Option<&str>) -> EnvLayer {
        let mut vars = BTreeMap::new();
        vars.insert("PORT".to_string(), self.port.to_string());
        vars.insert("HOSTNAME".to_string(), SERVER_HOST.to_string());
        vars.insert(
            "CHATDESK_DATA_DIR".to_string(),
            self.data_dir.display().to_string(),
        );
        vars.insert("CHATDESK_DESKTOP".to_string(), "1".to_string());
        if let Some(home) = &self.home {
            vars.insert("HOME".to_string(), home.display().to_string());
        }
        vars.insert(
            "PATH".to_string(),
            compose_path(&self.extra_path_dirs, base_path),
        );
        EnvLayer {
            source: EnvSource::Overrides,
            vars,
        }
    }
}

/// The layered environment for one server launch.
#[derive(Debug, Clone)]
pub struct ChildEnvironment {
    layers: Vec<EnvLayer>,
}

impl ChildEnvironment {
    pub fn compose(
        inherited: impl IntoIterator<Item = (String, String)>,
        shell: &EnvironmentSnapshot,
        overrides: ServerOverrides,
    ) -> Self {
        let inherited = EnvLayer::new(EnvSource::Inherited, inherited);
        let shell = EnvLayer::new(
            EnvSource::Shell,
            shell.iter().map(|(k, v)| (k.to_string(), v.to_string())),
        );

        let base_path = shell
            .vars
            .get("PATH")
            .or_else(|| inherited.vars.get("PATH"))
            .cloned();
        let overrides = overrides.into_layer(base_path.as_deref());

        Self {
            layers: vec![inherited, shell, overrides],
        }
    }

    pub fn layers(&self) -> &[EnvLayer] {
        &self.layers
    }

    pub fn merged(&self) -> BTreeMap<String, String> {
        merge_layers(&self.layers)
    }

    /// The highest-precedence layer that defines `key`.
    pub fn source_of(&self, key: &str) -> Option<EnvSource> {
        self.layers
            .iter()
            .rev()
            .find(|layer| layer.vars.contains_key(key))
            .map(|layer| layer.source)
    }
}

/// The launcher's own environment, skipping variables that are not UTF-8.
pub fn inherited_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Directories that commonly hold user-installed tools but are missing from
/// a desktop session's `PATH`.
pub fn default_extra_path_dirs(home: Option<&Path>, data_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if cfg!(target_os = "macos") {
        dirs.push(PathBuf::from("/opt/homebrew/bin"));
    }
    if cfg!(unix) {
        dirs.push(PathBuf::from("/usr/local/bin"));
    }
    if let Some(home) = home {
        dirs.push(home.join(".local").join("bin"));
    }
    dirs.push(data_dir.join("bin"));
    dirs
}

/// Prepend `extra` to `base`, dropping repeated entries.
pub fn compose_path(extra: &[PathBuf], base: Option<&str>) -> String {
    let mut seen = Vec::new();
    let candidates = extra
        .iter()
        .map(|dir| dir.display().to_string())
        .chain(
            base.unwrap_or_default()
                .split(PATH_SEPARATOR)
                .map(str::to_string),
        );

    for entry in candidates {
        if !entry.is_empty() && !seen.contains(&entry) {
            seen.push(entry);
        }
    }
    seen.join(PATH_SEPARATOR)
}
