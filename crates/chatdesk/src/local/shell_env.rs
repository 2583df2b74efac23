//! Login-shell environment capture.
//!
//! Apps launched from a desktop session do not see the variables users set
//! in their shell rc files. The capture runs the login shell once, prints
//! the environment between two markers and parses it into a snapshot.
//!
//! Capture is blocking and must run before the async runtime starts. It
//! never fails: any problem yields an empty snapshot and a warning.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;
use wait_timeout::ChildExt;

/// Default wall-clock limit for the login shell.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

const BEGIN_MARKER: &str = "__CHATDESK_ENV_BEGIN__";
const END_MARKER: &str = "__CHATDESK_ENV_END__";

/// Immutable `name -> value` map captured once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot(BTreeMap<String, String>);

impl EnvironmentSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, String)> for EnvironmentSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Error)]
enum CaptureError {
    #[error("failed to spawn shell {shell:?}: {source}")]
    Spawn {
        shell: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("shell did not finish within {0:?}")]
    Timeout(Duration),

    #[error("shell {0} without printing an environment")]
    NoOutput(ExitStatus),

    #[error("shell output is missing the environment markers")]
    MissingMarkers,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Runs a login shell and captures its environment.
#[derive(Debug, Clone)]
pub struct ShellEnvCapture {
    shell: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl Default for ShellEnvCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellEnvCapture {
    /// Capture using `$SHELL` as an interactive login shell.
    pub fn new() -> Self {
        Self {
            shell: default_shell(),
            args: vec!["-ilc".to_string()],
            timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Flags passed before the capture script. The script is always the
    /// final argument.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the shell and return its environment, or an empty snapshot.
    pub fn capture(&self) -> EnvironmentSnapshot {
        let started = Instant::now();
        match self.try_capture() {
            Ok(snapshot) => {
                info!(
                    "Captured {} variables from {} in {:?}",
                    snapshot.len(),
                    self.shell.display(),
                    started.elapsed()
                );
                snapshot
            }
            Err(e) => {
                warn!(
                    "Shell environment capture from {} failed, continuing without it: {}",
                    self.shell.display(),
                    e
                );
                EnvironmentSnapshot::empty()
            }
        }
    }

    fn try_capture(&self) -> Result<EnvironmentSnapshot, CaptureError> {
        let script = format!("printf '%s\\n' {BEGIN_MARKER}; env; printf '%s\\n' {END_MARKER}");
        debug!("Capturing environment: {} {:?}", self.shell.display(), self.args);

        let mut child = Command::new(&self.shell)
            .args(&self.args)
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                shell: self.shell.clone(),
                source,
            })?;

        let Some(stdout) = child.stdout.take() else {
            kill_quietly(&mut child);
            return Err(CaptureError::Io(io::Error::other("shell stdout not captured")));
        };

        // Stop at the end marker, not EOF: rc-file background jobs can hold
        // stdout open after the shell exits.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(read_until_end_marker(BufReader::new(stdout)));
        });

        let started = Instant::now();
        let output = match rx.recv_timeout(self.timeout) {
            Ok(result) => result?,
            Err(_) => {
                kill_quietly(&mut child);
                return Err(CaptureError::Timeout(self.timeout));
            }
        };

        let remaining = self.timeout.saturating_sub(started.elapsed());
        let status = match child.wait_timeout(remaining)? {
            Some(status) => Some(status),
            None => {
                debug!("Capture shell still running after printing its environment, killing it");
                kill_quietly(&mut child);
                None
            }
        };

        match extract_marked(&output) {
            Some(block) => Ok(parse_env_output(block)),
            None => match status {
                Some(status) if !status.success() && output.trim().is_empty() => {
                    Err(CaptureError::NoOutput(status))
                }
                Some(_) => Err(CaptureError::MissingMarkers),
                None => Err(CaptureError::Timeout(self.timeout)),
            },
        }
    }
}

/// Read lines until one contains the end marker or the pipe closes.
fn read_until_end_marker(mut reader: impl BufRead) -> io::Result<String> {
    let mut output = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(output);
        }
        let text = String::from_utf8_lossy(&line);
        output.push_str(&text);
        if text.contains(END_MARKER) {
            return Ok(output);
        }
    }
}

fn default_shell() -> PathBuf {
    std::env::var_os("SHELL")
        .filter(|shell| !shell.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            if cfg!(target_os = "macos") {
                PathBuf::from("/bin/zsh")
            } else {
                PathBuf::from("/bin/bash")
            }
        })
}

fn kill_quietly(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Failed to kill capture shell: {}", e);
    }
    let _ = child.wait();
}

/// Text between the begin and end markers, ignoring rc-file noise around it.
fn extract_marked(text: &str) -> Option<&str> {
    let start = text.find(BEGIN_MARKER)? + BEGIN_MARKER.len();
    let rest = &text[start..];
    let end = rest.find(END_MARKER)?;
    Some(&rest[..end])
}

/// Parse `KEY=VALUE` lines. Splits on the first `=` only; lines without
/// one, or with an empty key, are dropped.
pub fn parse_env_output(text: &str) -> EnvironmentSnapshot {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_equals_in_value() {
        let snapshot = parse_env_output("OPTS=--a=1 --b=2\nEMPTY=\n");
        assert_eq!(snapshot.get("OPTS"), Some("--a=1 --b=2"));
        assert_eq!(snapshot.get("EMPTY"), Some(""));
    }

    #[test]
    fn test_parse_drops_malformed_lines() {
        let snapshot = parse_env_output("no equals here\n=orphan\nGOOD=yes\n\n");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("GOOD"), Some("yes"));
    }

    #[test]
    fn test_extract_marked_ignores_noise() {
        let text = format!(
            "Welcome to your shell!\n{BEGIN_MARKER}\nA=1\nB=2\n{END_MARKER}\nbye\n"
        );
        let snapshot = parse_env_output(extract_marked(&text).unwrap());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("B"), Some("2"));
    }

    #[test]
    fn test_extract_marked_requires_both_markers() {
        assert!(extract_marked("A=1\n").is_none());
        assert!(extract_marked(&format!("{BEGIN_MARKER}\nA=1\n")).is_none());
    }

    #[test]
    fn test_capture_from_posix_shell() {
        let snapshot = ShellEnvCapture::new()
            .with_shell("/bin/sh")
            .with_args(["-c"])
            .capture();
        assert!(snapshot.get("PATH").is_some());
    }

    #[test]
    fn test_capture_missing_shell_yields_empty() {
        let snapshot = ShellEnvCapture::new()
            .with_shell("/nonexistent/shell-for-test")
            .capture();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_capture_timeout_yields_empty() {
        let started = Instant::now();
        let snapshot = ShellEnvCapture::new()
            .with_shell("/bin/sh")
            .with_args(["-c", "exec sleep 5"])
            .with_timeout(Duration::from_millis(100))
            .capture();
        assert!(snapshot.is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_capture_survives_background_job_holding_stdout() {
        let started = Instant::now();
        let snapshot = ShellEnvCapture::new()
            .with_shell("/bin/sh")
            .with_args(["-c", "sleep 4 & eval \"$0\""])
            .with_timeout(Duration::from_secs(2))
            .capture();
        assert!(!snapshot.is_empty());
        assert!(snapshot.get("PATH").is_some());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_read_stops_at_end_marker() {
        let text = format!("noise\n{BEGIN_MARKER}\nA=1\n{END_MARKER}\nTRAILING=1\n");
        let output = read_until_end_marker(text.as_bytes()).unwrap();
        assert!(!output.contains("TRAILING"));
        let snapshot = parse_env_output(extract_marked(&output).unwrap());
        assert_eq!(snapshot.get("A"), Some("1"));
    }

    #[test]
    fn test_capture_failing_shell_yields_empty() {
        let snapshot = ShellEnvCapture::new()
            .with_shell("/bin/sh")
            .with_args(["-c", "exit 7"])
            .capture();
        assert!(snapshot.is_empty());
    }
}
