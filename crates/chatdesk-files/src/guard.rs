//! Directory scope checks for file access.
//!
//! Every function here is a pure decision over path text. Normalization and
//! symlink resolution are the caller's job and must happen before these
//! checks run; nothing in this module touches the filesystem.

use std::path::{Component, Path};

use tracing::warn;

use crate::error::FileServerError;

/// What to do when a request does not name a base directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopePolicy {
    /// Use the user's home directory as the scope.
    #[default]
    HomeFallback,
    /// Reject the request.
    RequireExplicit,
}

/// Returns true if `path` names a filesystem root: `/`, a drive such as
/// `C:\`, or a UNC share such as `\\server\share`.
///
/// Both `/` and `\` are treated as separators so the answer does not depend
/// on the host platform. `.` and `..` segments are folded first, so
/// `/home/..` is a root too. An empty path has no named segments and
/// counts as a root.
pub fn is_root_path(path: impl AsRef<Path>) -> bool {
    let text = path.as_ref().to_string_lossy();
    let is_unc = text.starts_with("\\\\") || text.starts_with("//");

    let mut segments = text
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .peekable();

    if is_unc {
        // server and share
        segments.next();
        segments.next();
    } else if segments.peek().is_some_and(|first| is_drive_designator(first)) {
        segments.next();
    }

    let mut named: Vec<&str> = Vec::new();
    for segment in segments {
        if segment == ".." {
            named.pop();
        } else {
            named.push(segment);
        }
    }

    named.is_empty()
}

fn is_drive_designator(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Returns true if `candidate` is `base` or lies beneath it.
///
/// Comparison is segment-wise, so `/home/alice-2` is not inside
/// `/home/alice`, and exact: no case folding. Both paths must be absolute
/// and free of `..`; anything else is refused.
pub fn is_path_safe(base: impl AsRef<Path>, candidate: impl AsRef<Path>) -> bool {
    let base = base.as_ref();
    let candidate = candidate.as_ref();

    if !base.is_absolute() || !candidate.is_absolute() {
        return false;
    }

    if has_parent_component(base) || has_parent_component(candidate) {
        return false;
    }

    candidate.starts_with(base)
}

fn has_parent_component(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}

/// Decide whether `candidate` may be read and return the scope that allowed it.
///
/// An explicit `scope` is refused outright when it is a filesystem root.
/// Without one, `policy` either falls back to `home` or rejects the request.
pub fn authorize<'a>(
    scope: Option<&'a Path>,
    candidate: &Path,
    home: &'a Path,
    policy: ScopePolicy,
) -> Result<&'a Path, FileServerError> {
    let base = match scope {
        Some(base) => {
            if is_root_path(base) {
                warn!("Rejected filesystem root as directory scope: {:?}", base);
                return Err(FileServerError::RootScope);
            }
            base
        }
        None => match policy {
            ScopePolicy::HomeFallback => home,
            ScopePolicy::RequireExplicit => return Err(FileServerError::ScopeRequired),
        },
    };

    if !is_path_safe(base, candidate) {
        warn!(
            "Path outside scope: {:?} is not within {:?}",
            candidate, base
        );
        return Err(FileServerError::OutsideScope);
    }

    Ok(base)
}
