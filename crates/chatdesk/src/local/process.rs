//! Chat server process supervision.
//!
//! Spawns the server with the layered environment, pumps its output into a
//! bounded buffer and the log, and watches for exit. State changes are
//! published on a watch channel so callers only ever read snapshots.
//!
//! At most one server is live at a time. A monitor task owns the child and
//! is the only code that reaps it; `stop()` asks the monitor to terminate
//! the child (SIGTERM, then SIGKILL after a grace window) and waits for it.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;

use super::env::{ChildEnvironment, ServerOverrides, inherited_env};
use super::health::HealthCheckPoller;
use super::shell_env::EnvironmentSnapshot;
use crate::error::StartupError;

/// Default number of output lines kept for diagnostics.
pub const DEFAULT_OUTPUT_LINES: usize = 10;

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// How long the monitor waits for the output pumps after the child exits.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Slack on top of the grace window before `stop()` gives up on the monitor.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServerState {
    Idle,
    Starting,
    HealthChecking,
    Ready,
    Stopping,
    Stopped,
    Crashed { exit: ExitInfo },
}

impl ServerState {
    /// True while a server process is expected to be running.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ServerState::Starting | ServerState::HealthChecking | ServerState::Ready
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerState::Idle => "idle",
            ServerState::Starting => "starting",
            ServerState::HealthChecking => "health_checking",
            ServerState::Ready => "ready",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
            ServerState::Crashed { .. } => "crashed",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Crashed { exit } => write!(f, "crashed ({exit})"),
            other => f.write_str(other.name()),
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(sig)) => {
                let sig_name = match sig {
                    9 => "SIGKILL",
                    15 => "SIGTERM",
                    11 => "SIGSEGV",
                    6 => "SIGABRT",
                    2 => "SIGINT",
                    _ => "",
                };
                if sig_name.is_empty() {
                    write!(f, "killed by signal {}", sig)
                } else {
                    write!(f, "killed by {} (signal {})", sig_name, sig)
                }
            }
            (None, None) => f.write_str("exited (unknown status)"),
        }
    }
}

/// Last N lines of combined stdout/stderr.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: Arc<StdMutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(StdMutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Snapshot of a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub pid: u32,
    pub port: u16,
    pub started_at: Instant,
    output: OutputTail,
    exit: Arc<OnceLock<ExitInfo>>,
}

impl ServerHandle {
    pub fn recent_output(&self) -> Vec<String> {
        self.output.snapshot()
    }

    /// Exit status, once the process has been reaped.
    pub fn exit(&self) -> Option<ExitInfo> {
        self.exit.get().copied()
    }
}

/// What to run and how.
#[derive(Debug, Clone)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Server install directory; the child's working directory.
    pub working_dir: PathBuf,
    pub data_dir: PathBuf,
    pub home: Option<PathBuf>,
    pub extra_path_dirs: Vec<PathBuf>,
    pub output_lines: usize,
    pub stop_grace: Duration,
}

impl ServerCommand {
    pub fn new(
        program: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            data_dir: data_dir.into(),
            home: dirs::home_dir(),
            extra_path_dirs: Vec::new(),
            output_lines: DEFAULT_OUTPUT_LINES,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn output_lines(mut self, lines: usize) -> Self {
        self.output_lines = lines;
        self
    }

    /// The layered environment the server would be launched with.
    pub fn environment(&self, port: u16, shell: &EnvironmentSnapshot) -> ChildEnvironment {
        ChildEnvironment::compose(
            inherited_env(),
            shell,
            ServerOverrides {
                port,
                data_dir: self.data_dir.clone(),
                home: self.home.clone(),
                extra_path_dirs: self.extra_path_dirs.clone(),
            },
        )
    }
}

struct LiveServer {
    handle: ServerHandle,
    generation: u64,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

struct Inner {
    command: ServerCommand,
    shell_env: Arc<EnvironmentSnapshot>,
    live: Mutex<Option<LiveServer>>,
    state: watch::Sender<ServerState>,
    output: StdMutex<OutputTail>,
    last_exit: StdMutex<Option<ExitInfo>>,
    generation: AtomicU64,
}

/// Owns the chat server child process.
#[derive(Clone)]
pub struct ServerSupervisor {
    inner: Arc<Inner>,
}

impl ServerSupervisor {
    pub fn new(command: ServerCommand, shell_env: Arc<EnvironmentSnapshot>) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        let output = OutputTail::new(command.output_lines);
        Self {
            inner: Arc::new(Inner {
                command,
                shell_env,
                live: Mutex::new(None),
                state,
                output: StdMutex::new(output),
                last_exit: StdMutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn command(&self) -> &ServerCommand {
        &self.inner.command
    }

    /// Spawn the server on `port`.
    ///
    /// Refused while a server is live.
    pub async fn start(&self, port: u16) -> Result<ServerHandle, StartupError> {
        let mut live = self.inner.live.lock().await;
        if live.is_some() {
            return Err(StartupError::AlreadyRunning {
                state: self.state(),
            });
        }

        let cmd = &self.inner.command;
        let env = cmd.environment(port, &self.inner.shell_env);

        info!(
            "Spawning {} {:?} in {} on port {}",
            cmd.program,
            cmd.args,
            cmd.working_dir.display(),
            port
        );

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(&cmd.working_dir)
            .env_clear()
            .envs(env.merged())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawn_error = |source| StartupError::Spawn {
            program: cmd.program.clone(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_error)?;
        let Some(pid) = child.id() else {
            return Err(spawn_error(std::io::Error::other(
                "process exited before its pid was read",
            )));
        };

        let output = OutputTail::new(cmd.output_lines);
        *self
            .inner
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = output.clone();

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, OutputStream::Stdout, pid, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, OutputStream::Stderr, pid, output.clone()));
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let exit = Arc::new(OnceLock::new());
        let handle = ServerHandle {
            pid,
            port,
            started_at: Instant::now(),
            output,
            exit: exit.clone(),
        };

        self.inner.state.send_replace(ServerState::Starting);

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_child(
            self.inner.clone(),
            child,
            generation,
            stop_rx,
            pumps,
            exit,
        ));

        *live = Some(LiveServer {
            handle: handle.clone(),
            generation,
            stop_tx: Some(stop_tx),
            monitor,
        });

        info!("Server started (pid {}, port {})", pid, port);
        Ok(handle)
    }

    /// Block until the server answers its health check.
    ///
    /// Returns the number of probe attempts.
    pub async fn wait_until_ready(&self, poller: &HealthCheckPoller) -> Result<u32, StartupError> {
        let port = match self.handle().await {
            Some(handle) => handle.port,
            None => return Err(StartupError::NotRunning),
        };

        self.transition(ServerState::Starting, ServerState::HealthChecking);
        let attempts = poller
            .wait_for_ready(port, self.subscribe(), &self.output_tail())
            .await?;
        self.transition(ServerState::HealthChecking, ServerState::Ready);

        info!("Server ready on port {} after {} probe(s)", port, attempts);
        Ok(attempts)
    }

    /// Terminate the server and wait for it to be reaped.
    ///
    /// Does nothing if no server is live. Returns the exit status when a
    /// server was stopped.
    pub async fn stop(&self) -> Option<ExitInfo> {
        let taken = self.inner.live.lock().await.take();
        let Some(mut live) = taken else {
            debug!("Stop requested but no server is running");
            return None;
        };

        self.inner.state.send_replace(ServerState::Stopping);
        info!("Stopping server (pid {})", live.handle.pid);

        if let Some(stop_tx) = live.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        let wait = self.inner.command.stop_grace + REAP_TIMEOUT;
        match tokio::time::timeout(wait, &mut live.monitor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Server monitor task failed: {:?}", e),
            Err(_) => {
                warn!(
                    "Timeout waiting for server (pid {}) to exit, abandoning it",
                    live.handle.pid
                );
                live.monitor.abort();
            }
        }

        self.inner.state.send_replace(ServerState::Stopped);
        let exit = live.handle.exit();
        match exit {
            Some(exit) => info!("Server stopped ({})", exit),
            None => info!("Server stopped"),
        }
        exit
    }

    /// Stop the current server, if any, and start a new one.
    pub async fn restart(&self, port: u16) -> Result<ServerHandle, StartupError> {
        self.stop().await;
        self.start(port).await
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    /// The live server, if any.
    pub async fn handle(&self) -> Option<ServerHandle> {
        self.inner
            .live
            .lock()
            .await
            .as_ref()
            .map(|live| live.handle.clone())
    }

    /// Output of the current or most recent server.
    pub fn recent_output(&self) -> Vec<String> {
        self.output_tail().snapshot()
    }

    pub fn last_exit(&self) -> Option<ExitInfo> {
        *self
            .inner
            .last_exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn output_tail(&self) -> OutputTail {
        self.inner
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transition(&self, from: ServerState, to: ServerState) {
        self.inner.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
    }
}

impl Inner {
    async fn on_exit(&self, generation: u64, exit: ExitInfo) {
        *self
            .last_exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(exit);

        let mut live = self.live.lock().await;
        let unexpected = live
            .as_ref()
            .is_some_and(|server| server.generation == generation);

        if unexpected {
            live.take();
            drop(live);
            warn!("Server {}", exit);
            self.state.send_replace(ServerState::Crashed { exit });
        } else {
            debug!("Server {} after stop request", exit);
        }
    }
}

async fn monitor_child(
    inner: Arc<Inner>,
    mut child: Child,
    generation: u64,
    mut stop_rx: oneshot::Receiver<()>,
    pumps: Vec<JoinHandle<()>>,
    exit_slot: Arc<OnceLock<ExitInfo>>,
) {
    let grace = inner.command.stop_grace;

    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut stop_rx => terminate(&mut child, grace).await,
    };

    let exit = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            warn!("Error waiting for server process: {:?}", e);
            ExitInfo::unknown()
        }
    };
    let _ = exit_slot.set(exit);

    for pump in pumps {
        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
            debug!("Output pump still open after server exit");
        }
    }

    inner.on_exit(generation, exit).await;
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if request_graceful_exit(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => warn!(
                "Server (pid {:?}) ignored SIGTERM for {:?}, sending SIGKILL",
                child.id(),
                grace
            ),
        }
    }

    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn request_graceful_exit(child: &Child) -> bool {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory we own.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_graceful_exit(_child: &Child) -> bool {
    false
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

fn spawn_pump<R>(reader: R, stream: OutputStream, pid: u32, output: OutputTail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    match stream {
                        OutputStream::Stdout => info!("[server {}] {}", pid, line),
                        OutputStream::Stderr => warn!("[server {}] {}", pid, line),
                    }
                    output.push(line);
                }
                Err(e) => {
                    debug!("Error reading server {:?}: {}", stream, e);
                    break;
                }
            }
        }
    })
}
