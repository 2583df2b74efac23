//! Sandboxed file access for the chatdesk UI.
//!
//! This crate decides whether a requested path lies inside an approved
//! directory scope and, only when it does, reads a bounded preview of the
//! file. It can be embedded in any axum application through [`routes::api_routes`].

pub mod config;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod preview;
pub mod routes;

use std::path::PathBuf;
use std::sync::Arc;

pub use config::Config;
pub use error::FileServerError;
pub use guard::{ScopePolicy, authorize, is_path_safe, is_root_path};
pub use preview::{FilePreview, PreviewQuery, preview_file};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Fallback scope when a request carries no base directory
    pub home_dir: PathBuf,
    /// Configuration
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState with the given home directory and default config.
    pub fn new(home_dir: PathBuf) -> Self {
        Self {
            home_dir,
            config: Arc::new(Config::default()),
        }
    }

    /// Create a new AppState with the given home directory and config.
    pub fn with_config(home_dir: PathBuf, config: Config) -> Self {
        Self {
            home_dir,
            config: Arc::new(config),
        }
    }
}
