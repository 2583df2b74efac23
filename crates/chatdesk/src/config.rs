//! Configuration file, environment overrides and directory layout.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};

use crate::local::env::default_extra_path_dirs;
use crate::local::health::{DEFAULT_HEALTH_PATH, PollConfig};
use crate::local::process::ServerCommand;
use crate::local::shell_env::ShellEnvCapture;

pub const APP_NAME: &str = "chatdesk";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    /// Chat server process.
    pub server: ServerConfig,
    /// Readiness and crash handling.
    pub startup: StartupConfig,
    /// Login-shell environment capture.
    pub shell: ShellConfig,
    /// File preview sandbox.
    pub files: chatdesk_files::Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when no verbosity flag is given
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Executable that runs the chat server.
    pub program: String,
    pub args: Vec<String>,
    /// Server install directory. Defaults to `<data_dir>/server`.
    pub install_dir: Option<String>,
    /// Fixed port; a free loopback port is allocated when unset.
    pub port: Option<u16>,
    /// Prepended to the server's PATH. Defaults to common tool directories.
    pub extra_path_dirs: Option<Vec<String>>,
    /// Output lines kept for error reports.
    pub output_lines: usize,
    /// Time between SIGTERM and SIGKILL on stop.
    pub stop_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: vec!["server.js".to_string()],
            install_dir: None,
            port: None,
            extra_path_dirs: None,
            output_lines: 10,
            stop_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub health_path: String,
    /// Overall readiness deadline.
    pub health_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Restart the server when it exits unexpectedly after becoming ready.
    pub restart_on_crash: bool,
    pub max_restarts: u32,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            health_timeout_ms: 30_000,
            probe_interval_ms: 200,
            probe_timeout_ms: 1_000,
            restart_on_crash: false,
            max_restarts: 3,
        }
    }
}

impl StartupConfig {
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            deadline: Duration::from_millis(self.health_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub enabled: bool,
    /// Shell to run. Defaults to `$SHELL`.
    pub shell: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shell: None,
            timeout_ms: 5_000,
        }
    }
}

impl ShellConfig {
    /// Capture configured from this section, or `None` when disabled.
    pub fn capture(&self) -> Result<Option<ShellEnvCapture>> {
        if !self.enabled {
            return Ok(None);
        }
        let mut capture =
            ShellEnvCapture::new().with_timeout(Duration::from_millis(self.timeout_ms));
        if let Some(ref shell) = self.shell {
            capture = capture.with_shell(expand_str_path(shell)?);
        }
        Ok(Some(capture))
    }
}

impl AppConfig {
    /// Resolve the server command against the data directory.
    pub fn server_command(&self, data_dir: &Path) -> Result<ServerCommand> {
        let install_dir = match self.server.install_dir {
            Some(ref dir) => expand_str_path(dir)?,
            None => data_dir.join("server"),
        };

        let mut command = ServerCommand::new(&self.server.program, install_dir, data_dir)
            .args(self.server.args.iter().cloned())
            .output_lines(self.server.output_lines)
            .stop_grace(Duration::from_millis(self.server.stop_grace_ms));

        command.extra_path_dirs = match self.server.extra_path_dirs {
            Some(ref dirs) => dirs
                .iter()
                .map(|dir| expand_str_path(dir))
                .collect::<Result<Vec<_>>>()?,
            None => default_extra_path_dirs(command.home.as_deref(), data_dir),
        };

        Ok(command)
    }
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }

    pub fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        Ok(self)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("creating data directory {}", self.data_dir.display())
        })?;
        Ok(())
    }
}

/// Load the config file, writing the defaults first if it does not exist.
///
/// `CHATDESK__SECTION__KEY` environment variables override file values.
pub fn load_or_init_config(config_file: &Path) -> Result<AppConfig> {
    if !config_file.exists() {
        info!("Creating default config at {}", config_file.display());
        write_default_config(config_file)?;
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()
        .with_context(|| format!("loading config from {}", config_file.display()))?;

    built
        .try_deserialize()
        .with_context(|| format!("parsing config {}", config_file.display()))
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
