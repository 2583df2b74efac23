//! Where the UI is shown.

use anyhow::{Context, Result};
use log::{error, info};

/// Shows the chat UI and reports fatal errors to the user.
pub trait WindowManager: Send + Sync {
    /// Present the UI served at `url`.
    fn open(&self, url: &str) -> Result<()>;

    /// Tell the user startup failed. Must not fail.
    fn show_fatal_error(&self, title: &str, message: &str);
}

/// Opens the UI in the system browser.
#[derive(Debug, Clone)]
pub struct BrowserWindow {
    app_name: String,
}

impl BrowserWindow {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

impl WindowManager for BrowserWindow {
    fn open(&self, url: &str) -> Result<()> {
        info!("Opening {} at {}", self.app_name, url);
        open::that(url).with_context(|| format!("opening {url} in the system browser"))
    }

    fn show_fatal_error(&self, title: &str, message: &str) {
        error!("{}: {}", title, message);

        #[cfg(feature = "desktop-notifications")]
        {
            use notify_rust::Notification;

            let summary = format!("{} - {}", self.app_name, title);
            let body = message.lines().next().unwrap_or(message);
            if let Err(e) = Notification::new().summary(&summary).body(body).show() {
                log::warn!("Failed to show desktop notification: {}", e);
            }
        }
    }
}

/// Logs instead of showing anything. Used with `--no-window`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessWindow;

impl WindowManager for HeadlessWindow {
    fn open(&self, url: &str) -> Result<()> {
        info!("Server ready at {}", url);
        Ok(())
    }

    fn show_fatal_error(&self, title: &str, message: &str) {
        error!("{}: {}", title, message);
    }
}
