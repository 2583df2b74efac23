//! Bounded text previews of files inside a directory scope.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

use crate::AppState;
use crate::config::MAX_PREVIEW_BYTES;
use crate::error::FileServerError;
use crate::guard::authorize;

/// Query parameters for the preview endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct PreviewQuery {
    /// File to preview. Relative paths are resolved against the scope.
    pub path: String,
    /// Optional absolute directory the file must live in
    #[serde(default)]
    pub base: Option<String>,
    /// Requested number of lines (clamped by config)
    #[serde(default)]
    pub max_lines: Option<usize>,
}

/// Preview response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePreview {
    /// Resolved absolute path that was read
    pub path: String,
    pub lines: Vec<String>,
    pub line_count: usize,
    /// True when the file has more content than was returned
    pub truncated: bool,
}

/// Resolve, authorize and read a preview.
///
/// Path resolution happens first, then the scope check; the file is only
/// opened once the check has passed.
pub async fn preview_file(
    state: &AppState,
    query: &PreviewQuery,
) -> Result<FilePreview, FileServerError> {
    let requested = query.path.trim();
    if requested.is_empty() {
        return Err(FileServerError::InvalidPath("path is required".to_string()));
    }
    if requested.contains('\0') {
        return Err(FileServerError::InvalidPath(
            "path contains a null byte".to_string(),
        ));
    }

    let scope = match query
        .base
        .as_deref()
        .map(str::trim)
        .filter(|base| !base.is_empty())
    {
        Some(base) => Some(resolve_scope(base).await?),
        None => None,
    };

    let home = resolve_existing(&normalize_lexically(&state.home_dir)).await;
    let anchor = scope.as_deref().unwrap_or(&home);
    let candidate = resolve_candidate(anchor, requested).await;

    let allowed = authorize(
        scope.as_deref(),
        &candidate,
        &home,
        state.config.scope_policy(),
    )?;
    debug!(
        "Preview of {} authorized by scope {}",
        candidate.display(),
        allowed.display()
    );

    let max_lines = state.config.clamp_lines(query.max_lines);
    read_preview(&candidate, max_lines).await
}

async fn resolve_scope(base: &str) -> Result<PathBuf, FileServerError> {
    if base.contains('\0') {
        return Err(FileServerError::InvalidPath(
            "base contains a null byte".to_string(),
        ));
    }
    let base = Path::new(base);
    if !base.is_absolute() {
        return Err(FileServerError::InvalidPath(format!(
            "base directory must be absolute: {}",
            base.display()
        )));
    }
    Ok(resolve_existing(&normalize_lexically(base)).await)
}

async fn resolve_candidate(anchor: &Path, requested: &str) -> PathBuf {
    let requested = Path::new(requested);
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        anchor.join(requested)
    };
    resolve_existing(&normalize_lexically(&joined)).await
}

/// Follow symlinks when the path exists; otherwise keep the lexical form.
async fn resolve_existing(path: &Path) -> PathBuf {
    fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Fold `.` and `..` without consulting the filesystem.
///
/// `..` never climbs above the root.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(normalized.components().next_back(), Some(Component::Normal(_))) {
                    normalized.pop();
                }
            }
            Component::Normal(name) => normalized.push(name),
        }
    }
    normalized
}

async fn read_preview(path: &Path, max_lines: usize) -> Result<FilePreview, FileServerError> {
    let metadata = match fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FileServerError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(FileServerError::Io(e)),
    };

    if metadata.is_dir() {
        return Err(FileServerError::NotAFile);
    }

    let file = fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    let mut truncated = false;
    let mut remaining = MAX_PREVIEW_BYTES;

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(remaining)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            // Byte budget spent with data left over.
            truncated = remaining == 0 && !reader.fill_buf().await?.is_empty();
            break;
        }
        remaining -= read as u64;
        if lines.len() == max_lines {
            truncated = true;
            break;
        }
        lines.push(decode_line(&buf));
    }

    Ok(FilePreview {
        path: path.display().to_string(),
        line_count: lines.len(),
        lines,
        truncated,
    })
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use std::fmt::Write as _;
    use tempfile::TempDir;

    fn query(path: &str, base: Option<&Path>, max_lines: Option<usize>) -> PreviewQuery {
        PreviewQuery {
            path: path.to_string(),
            base: base.map(|b| b.display().to_string()),
            max_lines,
        }
    }

    fn write_lines(path: &Path, count: usize) {
        let mut body = String::new();
        for i in 0..count {
            writeln!(body, "line {i}").unwrap();
        }
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/home/alice/./docs/../notes.md")),
            PathBuf::from("/home/alice/notes.md")
        );
        assert_eq!(
            normalize_lexically(Path::new("/../../etc")),
            PathBuf::from("/etc")
        );
    }

    #[test]
    fn test_decode_line_strips_line_endings() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"hello"), "hello");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[tokio::test]
    async fn test_preview_bounds_bytes_of_unbroken_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("bundle.min.js");
        std::fs::write(&file, vec![b'x'; 3 * MAX_PREVIEW_BYTES as usize]).unwrap();

        let state = AppState::new(dir.path().to_path_buf());
        let preview = preview_file(&state, &query("bundle.min.js", Some(dir.path()), None))
            .await
            .unwrap();

        assert_eq!(preview.line_count, 1);
        assert_eq!(preview.lines[0].len(), MAX_PREVIEW_BYTES as usize);
        assert!(preview.truncated);
    }

    #[tokio::test]
    async fn test_preview_exactly_at_byte_budget_is_not_truncated() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("exact.txt");
        std::fs::write(&file, vec![b'y'; MAX_PREVIEW_BYTES as usize]).unwrap();

        let state = AppState::new(dir.path().to_path_buf());
        let preview = preview_file(&state, &query("exact.txt", Some(dir.path()), None))
            .await
            .unwrap();

        assert_eq!(preview.line_count, 1);
        assert!(!preview.truncated);
    }

    #[tokio::test]
    async fn test_preview_caps_requested_lines() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("big.txt");
        write_lines(&file, 5000);

        let state = AppState::new(dir.path().to_path_buf());
        let preview = preview_file(&state, &query("big.txt", Some(dir.path()), Some(5000)))
            .await
            .unwrap();

        assert_eq!(preview.line_count, 1000);
        assert_eq!(preview.lines.len(), 1000);
        assert_eq!(preview.lines[0], "line 0");
        assert!(preview.truncated);
    }

    #[tokio::test]
    async fn test_preview_short_file_not_truncated() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("short.txt");
        write_lines(&file, 3);

        let state = AppState::new(dir.path().to_path_buf());
        let preview = preview_file(&state, &query("short.txt", None, Some(3)))
            .await
            .unwrap();

        assert_eq!(preview.lines, vec!["line 0", "line 1", "line 2"]);
        assert!(!preview.truncated);
    }

    #[tokio::test]
    async fn test_preview_default_line_count() {
        let dir = TempDir::new().unwrap();
        write_lines(&dir.path().join("a.txt"), 500);

        let state = AppState::new(dir.path().to_path_buf());
        let preview = preview_file(&state, &query("a.txt", None, None))
            .await
            .unwrap();
        assert_eq!(preview.line_count, 200);
    }

    #[tokio::test]
    async fn test_preview_rejects_root_base() {
        let dir = TempDir::new().unwrap();
        let state = AppState::new(dir.path().to_path_buf());

        let result = preview_file(&state, &query("/etc/hosts", Some(Path::new("/")), None)).await;
        assert!(matches!(result, Err(FileServerError::RootScope)));
    }

    #[tokio::test]
    async fn test_preview_rejects_sibling_prefix_directory() {
        let dir = TempDir::new().unwrap();
        let alice = dir.path().join("alice");
        let alice2 = dir.path().join("alice-2");
        std::fs::create_dir_all(&alice).unwrap();
        std::fs::create_dir_all(&alice2).unwrap();
        write_lines(&alice2.join("secret.txt"), 1);

        let state = AppState::new(dir.path().to_path_buf());
        let target = alice2.join("secret.txt");
        let result = preview_file(
            &state,
            &query(target.to_str().unwrap(), Some(alice.as_path()), None),
        )
        .await;
        assert!(matches!(result, Err(FileServerError::OutsideScope)));
    }

    #[tokio::test]
    async fn test_preview_rejects_parent_traversal() {
        let dir = TempDir::new().unwrap();
        let scope = dir.path().join("scope");
        std::fs::create_dir_all(&scope).unwrap();
        write_lines(&dir.path().join("outside.txt"), 1);

        let state = AppState::new(dir.path().to_path_buf());
        let result = preview_file(
            &state,
            &query("../outside.txt", Some(scope.as_path()), None),
        )
        .await;
        assert!(matches!(result, Err(FileServerError::OutsideScope)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_preview_rejects_symlink_escape() {
        let dir = TempDir::new().unwrap();
        let scope = dir.path().join("scope");
        std::fs::create_dir_all(&scope).unwrap();
        let outside = dir.path().join("outside.txt");
        write_lines(&outside, 1);
        std::os::unix::fs::symlink(&outside, scope.join("link.txt")).unwrap();

        let state = AppState::new(dir.path().to_path_buf());
        let result = preview_file(&state, &query("link.txt", Some(scope.as_path()), None)).await;
        assert!(matches!(result, Err(FileServerError::OutsideScope)));
    }

    #[tokio::test]
    async fn test_preview_home_fallback_scope() {
        let home = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        write_lines(&home.path().join("notes.md"), 2);
        write_lines(&elsewhere.path().join("other.md"), 2);

        let state = AppState::new(home.path().to_path_buf());

        let preview = preview_file(&state, &query("notes.md", None, None))
            .await
            .unwrap();
        assert_eq!(preview.line_count, 2);

        let other = elsewhere.path().join("other.md");
        let result = preview_file(&state, &query(other.to_str().unwrap(), None, None)).await;
        assert!(matches!(result, Err(FileServerError::OutsideScope)));
    }

    #[tokio::test]
    async fn test_preview_requires_explicit_scope_when_configured() {
        let home = TempDir::new().unwrap();
        write_lines(&home.path().join("notes.md"), 2);

        let config = Config {
            require_explicit_scope: true,
            ..Config::default()
        };
        let state = AppState::with_config(home.path().to_path_buf(), config);
        let result = preview_file(&state, &query("notes.md", None, None)).await;
        assert!(matches!(result, Err(FileServerError::ScopeRequired)));
    }

    #[tokio::test]
    async fn test_preview_relative_base_is_invalid() {
        let home = TempDir::new().unwrap();
        let state = AppState::new(home.path().to_path_buf());
        let result = preview_file(
            &state,
            &query("a.txt", Some(Path::new("relative/dir")), None),
        )
        .await;
        assert!(matches!(result, Err(FileServerError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_preview_missing_file_and_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        let state = AppState::new(dir.path().to_path_buf());

        let missing = preview_file(&state, &query("nope.txt", Some(dir.path()), None)).await;
        assert!(matches!(missing, Err(FileServerError::NotFound(_))));

        let directory = preview_file(&state, &query("sub", Some(dir.path()), None)).await;
        assert!(matches!(directory, Err(FileServerError::NotAFile)));
    }

    #[tokio::test]
    async fn test_preview_empty_path_is_invalid() {
        let dir = TempDir::new().unwrap();
        let state = AppState::new(dir.path().to_path_buf());
        let result = preview_file(&state, &query("  ", None, None)).await;
        assert!(matches!(result, Err(FileServerError::InvalidPath(_))));
    }
}
