//! Local runtime for the chat server.
//!
//! Everything needed to run the server as a native child process on this
//! machine: login-shell environment capture, loopback port allocation,
//! environment layering, process supervision and readiness polling.

pub mod env;
pub mod health;
pub mod port;
pub mod process;
pub mod shell_env;

pub use env::{ChildEnvironment, EnvLayer, EnvSource, ServerOverrides};
pub use health::{HealthCheckPoller, HealthCheckResult, HealthProbe, HttpHealthProbe, PollConfig};
pub use port::{PortReservation, allocate_loopback_port};
pub use process::{ExitInfo, OutputTail, ServerCommand, ServerHandle, ServerState, ServerSupervisor};
pub use shell_env::{EnvironmentSnapshot, ShellEnvCapture};
