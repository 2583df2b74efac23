//! Readiness polling for the chat server.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::watch;
use tokio::time::Instant;

use super::env::SERVER_HOST;
use super::process::{OutputTail, ServerState};
use crate::error::StartupError;

/// Path of the server's health endpoint.
pub const DEFAULT_HEALTH_PATH: &str = "/api/health";

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckResult {
    Healthy,
    /// The server answered with something other than 200.
    HttpStatus(u16),
    /// Connection refused, reset, DNS, etc.
    Network(String),
    Timeout,
}

impl fmt::Display for HealthCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthCheckResult::Healthy => f.write_str("healthy"),
            HealthCheckResult::HttpStatus(status) => write!(f, "HTTP {status}"),
            HealthCheckResult::Network(message) => write!(f, "network error: {message}"),
            HealthCheckResult::Timeout => f.write_str("timed out"),
        }
    }
}

/// Transport used to ask the server whether it is ready.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, port: u16, timeout: Duration) -> HealthCheckResult;
}

/// `GET http://127.0.0.1:<port><path>`; only 200 counts as healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(path: impl Into<String>) -> Result<Self, StartupError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(StartupError::Probe)?;

        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Ok(Self { client, path })
    }

    pub fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", SERVER_HOST, port, self.path)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, port: u16, timeout: Duration) -> HealthCheckResult {
        match self.client.get(self.url(port)).timeout(timeout).send().await {
            Ok(res) if res.status() == reqwest::StatusCode::OK => HealthCheckResult::Healthy,
            Ok(res) => HealthCheckResult::HttpStatus(res.status().as_u16()),
            Err(e) if e.is_timeout() => HealthCheckResult::Timeout,
            Err(e) => HealthCheckResult::Network(e.to_string()),
        }
    }
}

/// Polling cadence and limits.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Pause between probes
    pub interval: Duration,
    /// Upper bound on a single probe
    pub probe_timeout: Duration,
    /// Overall time allowed for the server to become healthy
    pub deadline: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            probe_timeout: Duration::from_secs(1),
            deadline: Duration::from_secs(30),
        }
    }
}

enum Step {
    StateChanged,
    ChannelClosed,
    Probed(HealthCheckResult),
}

/// Probes until healthy, crashed, cancelled or out of time.
#[derive(Clone)]
pub struct HealthCheckPoller {
    probe: Arc<dyn HealthProbe>,
    config: PollConfig,
}

impl HealthCheckPoller {
    pub fn new(probe: Arc<dyn HealthProbe>, config: PollConfig) -> Self {
        Self { probe, config }
    }

    /// Poller over HTTP against `path`.
    pub fn http(path: impl Into<String>, config: PollConfig) -> Result<Self, StartupError> {
        Ok(Self::new(Arc::new(HttpHealthProbe::new(path)?), config))
    }

    pub fn config(&self) -> PollConfig {
        self.config
    }

    /// Probe `port` until it answers healthy.
    ///
    /// Watches `state` throughout: a crash fails immediately with the
    /// server's recent output, and a stop or quit cancels. Returns the
    /// number of probes sent.
    pub async fn wait_for_ready(
        &self,
        port: u16,
        mut state: watch::Receiver<ServerState>,
        output: &OutputTail,
    ) -> Result<u32, StartupError> {
        let start = Instant::now();
        let deadline = start + self.config.deadline;
        let mut attempts: u32 = 0;
        let mut last = HealthCheckResult::Timeout;

        loop {
            check_state(*state.borrow_and_update(), output)?;

            let now = Instant::now();
            if now >= deadline {
                return Err(StartupError::HealthCheckTimeout {
                    attempts,
                    elapsed: start.elapsed(),
                    last,
                    output: output.snapshot(),
                });
            }

            let budget = self.config.probe_timeout.min(deadline - now);
            let step = tokio::select! {
                biased;
                changed = state.changed() => match changed {
                    Ok(()) => Step::StateChanged,
                    Err(_) => Step::ChannelClosed,
                },
                result = tokio::time::timeout(budget, self.probe.probe(port, budget)) => {
                    Step::Probed(result.unwrap_or(HealthCheckResult::Timeout))
                }
            };

            match step {
                Step::StateChanged => continue,
                Step::ChannelClosed => return Err(StartupError::Cancelled),
                Step::Probed(HealthCheckResult::Healthy) => {
                    attempts += 1;
                    info!(
                        "Health check on port {} passed after {} attempt(s) in {:?}",
                        port,
                        attempts,
                        start.elapsed()
                    );
                    return Ok(attempts);
                }
                Step::Probed(result) => {
                    attempts += 1;
                    debug!("Health check attempt {} on port {}: {}", attempts, port, result);
                    last = result;
                }
            }

            let pause = self
                .config
                .interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                biased;
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(StartupError::Cancelled);
                    }
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

fn check_state(state: ServerState, output: &OutputTail) -> Result<(), StartupError> {
    match state {
        ServerState::Crashed { exit } => Err(StartupError::CrashDuringStartup {
            exit,
            output: output.snapshot(),
        }),
        ServerState::Stopping | ServerState::Stopped | ServerState::Idle => {
            Err(StartupError::Cancelled)
        }
        ServerState::Starting | ServerState::HealthChecking | ServerState::Ready => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::process::ExitInfo;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted results, then repeats the last one.
    struct ScriptedProbe {
        results: StdMutex<VecDeque<HealthCheckResult>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(results: Vec<HealthCheckResult>) -> Self {
            Self {
                results: StdMutex::new(results.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _port: u16, _timeout: Duration) -> HealthCheckResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.pop_front().unwrap()
            } else {
                results.front().cloned().unwrap()
            }
        }
    }

    struct SlowProbe;

    #[async_trait]
    impl HealthProbe for SlowProbe {
        async fn probe(&self, _port: u16, _timeout: Duration) -> HealthCheckResult {
            tokio::time::sleep(Duration::from_secs(10)).await;
            HealthCheckResult::Healthy
        }
    }

    fn fast_config(deadline: Duration) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
            deadline,
        }
    }

    #[tokio::test]
    async fn test_ready_after_failures() {
        let probe = Arc::new(ScriptedProbe::new(vec![
            HealthCheckResult::Network("connection refused".to_string()),
            HealthCheckResult::HttpStatus(503),
            HealthCheckResult::Timeout,
            HealthCheckResult::Healthy,
        ]));
        let poller = HealthCheckPoller::new(probe.clone(), fast_config(Duration::from_secs(5)));
        let (_tx, rx) = watch::channel(ServerState::HealthChecking);

        let attempts = poller
            .wait_for_ready(4000, rx, &OutputTail::new(10))
            .await
            .unwrap();
        assert_eq!(attempts, 4);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_reports_last_result() {
        let probe = Arc::new(ScriptedProbe::new(vec![HealthCheckResult::HttpStatus(503)]));
        let poller = HealthCheckPoller::new(probe, fast_config(Duration::from_millis(150)));
        let (_tx, rx) = watch::channel(ServerState::HealthChecking);
        let output = OutputTail::new(10);
        output.push("still migrating");

        let err = poller.wait_for_ready(4000, rx, &output).await.unwrap_err();
        match err {
            StartupError::HealthCheckTimeout {
                attempts,
                last,
                output,
                ..
            } => {
                assert!(attempts >= 1);
                assert_eq!(last, HealthCheckResult::HttpStatus(503));
                assert_eq!(output, vec!["still migrating"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_probe_bounded_by_probe_timeout() {
        let poller =
            HealthCheckPoller::new(Arc::new(SlowProbe), fast_config(Duration::from_millis(200)));
        let (_tx, rx) = watch::channel(ServerState::HealthChecking);

        let started = std::time::Instant::now();
        let err = poller
            .wait_for_ready(4000, rx, &OutputTail::new(10))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            err,
            StartupError::HealthCheckTimeout {
                last: HealthCheckResult::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_crash_fails_fast() {
        let probe = Arc::new(ScriptedProbe::new(vec![HealthCheckResult::Network(
            "connection refused".to_string(),
        )]));
        let poller = HealthCheckPoller::new(probe, fast_config(Duration::from_secs(30)));
        let (tx, rx) = watch::channel(ServerState::HealthChecking);
        let output = OutputTail::new(10);
        output.push("Error: EADDRINUSE");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(ServerState::Crashed {
                exit: ExitInfo {
                    code: Some(1),
                    signal: None,
                },
            });
            // keep the sender alive so the poller sees the crash, not a closed channel
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let started = std::time::Instant::now();
        let err = poller.wait_for_ready(4000, rx, &output).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            StartupError::CrashDuringStartup { exit, output } => {
                assert_eq!(exit.code, Some(1));
                assert_eq!(output, vec!["Error: EADDRINUSE"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_cancels_polling() {
        let poller = HealthCheckPoller::new(Arc::new(SlowProbe), PollConfig::default());
        let (tx, rx) = watch::channel(ServerState::HealthChecking);

        let handle = tokio::spawn(async move {
            poller.wait_for_ready(4000, rx, &OutputTail::new(10)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(ServerState::Stopping);

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StartupError::Cancelled)));
    }

    #[tokio::test]
    async fn test_already_stopped_is_cancelled() {
        let probe = Arc::new(ScriptedProbe::new(vec![HealthCheckResult::Healthy]));
        let poller = HealthCheckPoller::new(probe.clone(), fast_config(Duration::from_secs(1)));
        let (_tx, rx) = watch::channel(ServerState::Stopped);

        let result = poller.wait_for_ready(4000, rx, &OutputTail::new(10)).await;
        assert!(matches!(result, Err(StartupError::Cancelled)));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_http_probe_url() {
        let probe = HttpHealthProbe::new("api/health").unwrap();
        assert_eq!(probe.url(4123), "http://127.0.0.1:4123/api/health");
    }

    #[test]
    fn test_result_display() {
        assert_eq!(HealthCheckResult::HttpStatus(502).to_string(), "HTTP 502");
        assert_eq!(HealthCheckResult::Timeout.to_string(), "timed out");
    }
}
