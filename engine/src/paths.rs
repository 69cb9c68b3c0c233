//! Remote path helpers.
//!
//! Remote paths are `/`-separated strings relative to the login directory.
//! Relative entry paths come from remote listings and are checked before
//! they are joined onto a local staging directory.

use std::path::{Component, Path, PathBuf};

use crate::error::EngineError;

/// Join a remote base directory and a relative path.
pub fn join_remote(base: &str, rel: &str) -> String {
    let absolute = base.starts_with('/');
    let base = base.trim_end_matches('/');
    let rel = rel.trim_start_matches('/');
    match (base.is_empty() || base == ".", rel.is_empty()) {
        (true, _) if absolute => format!("/{}", rel),
        (true, _) => rel.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, rel),
    }
}

/// Last segment of a remote path (`public_html/site` -> `site`).
pub fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Every ancestor of `path`, shortest first (`a/b/c` -> `a`, `a/b`, `a/b/c`).
///
/// A leading `/` is kept on every ancestor of an absolute path.
pub fn remote_ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let absolute = path.starts_with('/');
    for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

/// Parent directory of a relative remote path, if any.
pub fn remote_parent(path: &str) -> Option<&str> {
    path.trim_end_matches('/').rsplit_once('/').map(|(parent, _)| parent)
}

/// Join a validated relative remote path onto a local directory.
///
/// Rejects empty paths, absolute paths, prefixes and `..` so nothing a
/// remote listing says can escape `base`.
pub fn local_path_for(base: &Path, rel: &str) -> Result<PathBuf, EngineError> {
    let invalid = |reason: &str| EngineError::InvalidPath {
        path: rel.to_string(),
        reason: reason.to_string(),
    };

    if rel.is_empty() {
        return Err(invalid("empty path"));
    }
    let path = Path::new(rel);
    for component in path.components() {
        match component {
            Component::ParentDir => return Err(invalid("parent directory traversal")),
            Component::RootDir | Component::Prefix(_) => return Err(invalid("absolute path")),
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(base.join(path))
}
