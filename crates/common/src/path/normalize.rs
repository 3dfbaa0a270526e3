// Workspace path canonicalization: NFKC normalization, `/` separators, traversal rejection.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum allowed path length in characters.
const MAX_PATH_CHARS: usize = 512;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path exceeds maximum length of {MAX_PATH_CHARS} characters")]
    TooLong,

    #[error("path escapes the workspace root: {0}")]
    Traversal(String),

    #[error("path contains null byte")]
    NullByte,

    #[error("path contains invalid component: {0}")]
    InvalidComponent(String),
}

/// Normalize a workspace-relative file path.
///
/// Assistant output writes paths in every shape (`./src/a.ts`, `/src/a.ts`,
/// `src\a.ts`); they all collapse to `src/a.ts` so the workspace map has one
/// key per file.
///
/// Rules:
/// - Apply Unicode NFKC normalization
/// - Convert all separators to `/`, collapse repeats, strip leading/trailing `/`
/// - Drop `.` components
/// - Reject `..` components, null bytes and whitespace-only components
/// - Enforce max 512 character limit (after normalization)
pub fn normalize_path(input: &str) -> Result<String, PathError> {
    if input.trim().is_empty() {
        return Err(PathError::Empty);
    }

    if input.contains('\0') {
        return Err(PathError::NullByte);
    }

    let normalized: String = input.trim().nfkc().collect();
    let unified = normalized.replace('\\', "/");

    let mut components = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal(input.to_string())),
            other if other.trim().is_empty() => {
                return Err(PathError::InvalidComponent(
                    "(whitespace-only component)".to_string(),
                ));
            }
            other => components.push(other),
        }
    }

    if components.is_empty() {
        return Err(PathError::Empty);
    }

    let result = components.join("/");
    if result.chars().count() > MAX_PATH_CHARS {
        return Err(PathError::TooLong);
    }

    Ok(result)
}

/// Parent directories of a normalized path, shallowest first.
///
/// `src/lib/a.ts` yields `["src", "src/lib"]`.
pub fn parent_dirs(path: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let mut end = 0;
    while let Some(offset) = path[end..].find('/') {
        end += offset;
        dirs.push(path[..end].to_string());
        end += 1;
    }
    dirs
}

/// True when `path` equals `prefix` or lives underneath it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}
