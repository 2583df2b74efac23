//! Application context: owns everything a desktop run needs, from launch to
//! teardown.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{StartupError, format_output};
use crate::local::env::SERVER_HOST;
use crate::local::{
    EnvironmentSnapshot, ExitInfo, HealthCheckPoller, PortReservation, ServerState,
    ServerSupervisor, allocate_loopback_port,
};
use crate::window::WindowManager;

/// Address the UI is served from.
pub fn server_url(port: u16) -> String {
    format!("http://{SERVER_HOST}:{port}")
}

/// Returned by a successful [`AppContext::launch`].
#[derive(Debug, Clone)]
pub struct LaunchInfo {
    pub url: String,
    pub pid: u32,
    pub port: u16,
    pub attempts: u32,
}

pub struct AppContext {
    config: AppConfig,
    env: Arc<EnvironmentSnapshot>,
    supervisor: ServerSupervisor,
    poller: HealthCheckPoller,
    window: Box<dyn WindowManager>,
    shutdown: CancellationToken,
    port: Option<u16>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        data_dir: &Path,
        env: Arc<EnvironmentSnapshot>,
        window: Box<dyn WindowManager>,
    ) -> Result<Self> {
        let command = config
            .server_command(data_dir)
            .context("resolving server command")?;
        let poller =
            HealthCheckPoller::http(&config.startup.health_path, config.startup.poll_config())?;
        let supervisor = ServerSupervisor::new(command, env.clone());
        Ok(Self::with_parts(config, env, supervisor, poller, window))
    }

    pub fn with_parts(
        config: AppConfig,
        env: Arc<EnvironmentSnapshot>,
        supervisor: ServerSupervisor,
        poller: HealthCheckPoller,
        window: Box<dyn WindowManager>,
    ) -> Self {
        Self {
            config,
            env,
            supervisor,
            poller,
            window,
            shutdown: CancellationToken::new(),
            port: None,
        }
    }

    /// Cancel this token to quit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn supervisor(&self) -> &ServerSupervisor {
        &self.supervisor
    }

    pub fn environment(&self) -> &EnvironmentSnapshot {
        &self.env
    }

    /// Pick a port, start the server, wait for it to be healthy and open
    /// the window.
    pub async fn launch(&mut self, port: Option<u16>) -> Result<LaunchInfo> {
        let reservation = match port {
            Some(port) => PortReservation::fixed(port),
            None => allocate_loopback_port()?,
        };
        let port = reservation.port();
        self.port = Some(port);

        let handle = self.supervisor.start(port).await?;
        let attempts = self.wait_ready().await?;

        let url = server_url(port);
        self.window.open(&url)?;

        Ok(LaunchInfo {
            url,
            pid: handle.pid,
            port,
            attempts,
        })
    }

    /// Run until shutdown is requested or the server dies for good.
    pub async fn run(&mut self) -> Result<()> {
        let Some(port) = self.port else {
            return Err(StartupError::NotRunning.into());
        };
        let mut restarts = 0;

        loop {
            let exit = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                exit = wait_for_crash(self.supervisor.subscribe()) => exit,
            };
            let Some(exit) = exit else {
                return Ok(());
            };

            let startup = &self.config.startup;
            if !startup.restart_on_crash || restarts >= startup.max_restarts {
                return Err(anyhow!(
                    "chat server {} after startup{}",
                    exit,
                    format_output(&self.supervisor.recent_output())
                ));
            }

            restarts += 1;
            warn!(
                "Chat server {}, restarting ({}/{})",
                exit, restarts, startup.max_restarts
            );
            self.supervisor.start(port).await?;
            self.wait_ready().await?;
        }
    }

    /// Stop the server. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.supervisor.stop().await;
    }

    /// Show a fatal error to the user.
    pub fn report_fatal(&self, err: &anyhow::Error) {
        self.window
            .show_fatal_error("chatdesk could not start", &format!("{err:#}"));
    }

    async fn wait_ready(&self) -> Result<u32, StartupError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested during startup");
                self.supervisor.stop().await;
                Err(StartupError::Cancelled)
            }
            result = self.supervisor.wait_until_ready(&self.poller) => result,
        }
    }
}

/// True if `err` is a startup cancelled by a quit request.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StartupError>(),
        Some(StartupError::Cancelled)
    )
}

async fn wait_for_crash(mut state: watch::Receiver<ServerState>) -> Option<ExitInfo> {
    loop {
        match *state.borrow_and_update() {
            ServerState::Crashed { exit } => return Some(exit),
            ServerState::Stopped => return None,
            _ => {}
        }
        if state.changed().await.is_err() {
            return None;
        }
    }
}
