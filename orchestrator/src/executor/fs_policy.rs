use std::path::{Component, Path, PathBuf};

/// Filesystem reach of one execution.
///
/// Writes always stay inside the session directory. Reads may leave it only
/// when file IO is enabled for the task.
#[derive(Debug, Clone)]
pub struct FsPolicy {
    root: PathBuf,
    allow_outside_reads: bool,
}

impl FsPolicy {
    /// `root` must exist; it is canonicalized so symlinked roots compare correctly.
    pub fn new(root: &Path, allow_outside_reads: bool) -> std::io::Result<Self> {
        Ok(Self {
            root: root.canonicalize()?,
            allow_outside_reads,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve_write(&self, user_path: &str) -> Result<PathBuf, String> {
        self.confine(user_path)
    }

    pub fn resolve_read(&self, user_path: &str) -> Result<PathBuf, String> {
        if !self.allow_outside_reads {
            return self.confine(user_path);
        }
        if user_path.contains('\0') {
            return Err("path contains null bytes".to_string());
        }
        let path = Path::new(user_path);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.root.join(path))
        }
    }

    fn confine(&self, user_path: &str) -> Result<PathBuf, String> {
        if user_path.contains('\0') {
            return Err("path contains null bytes".to_string());
        }
        if user_path.trim().is_empty() {
            return Err("path is empty".to_string());
        }

        let requested = Path::new(user_path);
        let relative = if requested.is_absolute() {
            requested
                .strip_prefix(&self.root)
                .map_err(|_| format!("'{user_path}' is outside the session directory"))?
        } else {
            requested
        };

        let mut normalized = PathBuf::new();
        for comp in relative.components() {
            match comp {
                Component::Normal(s) => normalized.push(s),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(format!("'{user_path}' escapes the session directory"));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("'{user_path}' contains invalid components"));
                }
            }
        }

        let full_path = self.root.join(&normalized);

        // Symlinks inside the root may still point elsewhere.
        let mut existing = full_path.as_path();
        while !existing.exists() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        let canonical = existing
            .canonicalize()
            .map_err(|e| format!("cannot resolve '{user_path}': {e}"))?;
        if !canonical.starts_with(&self.root) {
            return Err(format!("'{user_path}' escapes the session directory"));
        }

        Ok(full_path)
    }
}
