//! Workspace sandbox — filesystem containment to a single root directory.
//!
//! Every path the agent touches is resolved here first. Resolution joins the
//! input to the root, folds `.` and `..` lexically, then canonicalizes the
//! deepest ancestor that exists on disk so symlinks are followed. Anything
//! that does not end up under the canonical root is a `PathEscape`.

use std::path::{Component, Path, PathBuf};

use taskpilot_core::error::SandboxError;

/// A canonicalized workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open a workspace. The root must exist and be a directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let raw = root.as_ref();
        let root = raw
            .canonicalize()
            .map_err(|e| SandboxError::InvalidWorkspace {
                path: raw.display().to_string(),
                reason: e.to_string(),
            })?;
        if !root.is_dir() {
            return Err(SandboxError::InvalidWorkspace {
                path: raw.display().to_string(),
                reason: "not a directory".into(),
            });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (relative to the root, or absolute) to a location
    /// inside the workspace. Performs no I/O beyond metadata lookups.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let escape = || SandboxError::PathEscape { path: path.to_string() };

        let input = Path::new(path);
        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.root.join(input)
        };
        let normalized = normalize_lexically(&joined);

        // Split into the deepest existing entry and the not-yet-created tail.
        let mut existing = normalized.as_path();
        let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
        while existing.symlink_metadata().is_err() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name);
                    existing = parent;
                }
                _ => return Err(escape()),
            }
        }

        // A dangling symlink cannot be verified, so it is treated as an escape.
        let mut resolved = existing.canonicalize().map_err(|_| escape())?;
        for name in tail.into_iter().rev() {
            resolved.push(name);
        }

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(escape())
        }
    }

    /// Render a resolved path relative to the root, using `/` separators.
    pub fn display_relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".into(),
            Ok(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Fold `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn resolves_existing_and_new_paths() {
        let (_dir, ws) = setup();
        let existing = ws.resolve("src/main.rs").unwrap();
        assert!(existing.ends_with("src/main.rs"));
        assert!(existing.starts_with(ws.root()));

        let fresh = ws.resolve("new/dir/file.txt").unwrap();
        assert!(fresh.starts_with(ws.root()));
        assert!(fresh.ends_with("new/dir/file.txt"));
    }

    #[test]
    fn dot_and_inner_parent_components_fold() {
        let (_dir, ws) = setup();
        let p = ws.resolve("./src/../src/./main.rs").unwrap();
        assert_eq!(p, ws.root().join("src/main.rs"));
        assert_eq!(ws.resolve(".").unwrap(), ws.root());
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let (_dir, ws) = setup();
        let err = ws.resolve("../outside.txt").unwrap_err();
        assert!(matches!(err, SandboxError::PathEscape { .. }));
        assert!(ws.resolve("src/../../x").is_err());
    }

    #[test]
    fn absolute_paths_must_stay_inside() {
        let (_dir, ws) = setup();
        assert!(ws.resolve("/etc/passwd").is_err());
        let inside = ws.root().join("src/main.rs");
        assert!(ws.resolve(&inside.display().to_string()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_workspace_is_rejected() {
        let (dir, ws) = setup();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        assert!(ws.resolve("link/secret.txt").is_err());
        assert!(ws.resolve("link").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_rejected() {
        let (dir, ws) = setup();
        std::os::unix::fs::symlink("/nonexistent/target", dir.path().join("dangling")).unwrap();
        assert!(ws.resolve("dangling").is_err());
    }

    #[test]
    fn open_rejects_missing_or_file_root() {
        let (dir, _ws) = setup();
        assert!(matches!(
            Workspace::open(dir.path().join("missing")),
            Err(SandboxError::InvalidWorkspace { .. })
        ));
        assert!(Workspace::open(dir.path().join("src/main.rs")).is_err());
    }

    #[test]
    fn relative_display() {
        let (_dir, ws) = setup();
        let p = ws.resolve("src/main.rs").unwrap();
        assert_eq!(ws.display_relative(&p), "src/main.rs");
        assert_eq!(ws.display_relative(ws.root()), ".");
    }
}
