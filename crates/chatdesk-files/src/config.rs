use serde::{Deserialize, Serialize};

use crate::guard::ScopePolicy;

/// Upper bound on preview lines, regardless of what a caller asks for.
pub const MAX_PREVIEW_LINES: usize = 1000;

/// Upper bound on bytes read by a single preview.
pub const MAX_PREVIEW_BYTES: u64 = 1024 * 1024;

/// File preview configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Reject requests that carry no base directory instead of
    /// falling back to the home directory
    #[serde(default)]
    pub require_explicit_scope: bool,

    /// Hard cap on lines returned by a single preview
    #[serde(default = "default_max_preview_lines")]
    pub max_preview_lines: usize,

    /// Lines returned when the request does not specify `max_lines`
    #[serde(default = "default_preview_lines")]
    pub default_preview_lines: usize,
}

fn default_max_preview_lines() -> usize {
    MAX_PREVIEW_LINES
}

fn default_preview_lines() -> usize {
    200
}

impl Default for Config {
    fn default() -> Self {
        Self {
            require_explicit_scope: false,
            max_preview_lines: default_max_preview_lines(),
            default_preview_lines: default_preview_lines(),
        }
    }
}

impl Config {
    /// Scope policy derived from this config.
    pub fn scope_policy(&self) -> ScopePolicy {
        if self.require_explicit_scope {
            ScopePolicy::RequireExplicit
        } else {
            ScopePolicy::HomeFallback
        }
    }

    /// Clamp a requested line count to `[1, max_preview_lines]`.
    ///
    /// The configured cap itself never exceeds [`MAX_PREVIEW_LINES`].
    pub fn clamp_lines(&self, requested: Option<usize>) -> usize {
        let cap = self.max_preview_lines.clamp(1, MAX_PREVIEW_LINES);
        requested
            .unwrap_or(self.default_preview_lines)
            .clamp(1, cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_lines_caps_large_requests() {
        let config = Config::default();
        assert_eq!(config.clamp_lines(Some(5000)), 1000);
        assert_eq!(config.clamp_lines(Some(10)), 10);
        assert_eq!(config.clamp_lines(None), 200);
    }

    #[test]
    fn test_clamp_lines_zero_becomes_one() {
        assert_eq!(Config::default().clamp_lines(Some(0)), 1);
    }

    #[test]
    fn test_configured_cap_cannot_exceed_hard_limit() {
        let config = Config {
            max_preview_lines: 50_000,
            ..Config::default()
        };
        assert_eq!(config.clamp_lines(Some(5000)), MAX_PREVIEW_LINES);
    }

    #[test]
    fn test_scope_policy_from_config() {
        let mut config = Config::default();
        assert_eq!(config.scope_policy(), ScopePolicy::HomeFallback);
        config.require_explicit_scope = true;
        assert_eq!(config.scope_policy(), ScopePolicy::RequireExplicit);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(!config.require_explicit_scope);
        assert_eq!(config.max_preview_lines, 1000);
        assert_eq!(config.default_preview_lines, 200);
    }
}
