// Generated and vendored paths that are never written into a workspace.

/// Directory names excluded at any depth.
pub const DENIED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    ".cache",
    "coverage",
];

/// File names excluded at any depth.
pub const DENIED_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "bun.lockb",
    ".DS_Store",
];

/// Returns true when a normalized path targets a denylisted location.
pub fn is_denylisted(path: &str) -> bool {
    let mut segments = path.split('/').peekable();
    while let Some(segment) = segments.next() {
        let is_last = segments.peek().is_none();
        if is_last {
            if DENIED_FILES.contains(&segment) {
                return true;
            }
        } else if DENIED_DIRS.contains(&segment) {
            return true;
        }
    }
    false
}
