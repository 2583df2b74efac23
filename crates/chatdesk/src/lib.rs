//! chatdesk - desktop launcher for a local chat server.
//!
//! Captures the login-shell environment, runs the chat server as a
//! supervised child process on a loopback port, waits for it to report
//! healthy and hands its address to a window.

pub mod app;
pub mod config;
pub mod error;
pub mod local;
pub mod window;

pub use error::StartupError;
