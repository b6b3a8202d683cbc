use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactKind {
    Image,
    Table,
    Data,
    Text,
    Other,
}

impl ArtifactKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" => Self::Image,
            "csv" | "tsv" | "xlsx" => Self::Table,
            "json" | "yaml" | "yml" | "toml" | "parquet" => Self::Data,
            "txt" | "md" | "log" | "html" => Self::Text,
            _ => Self::Other,
        }
    }
}

/// A file written or modified during one execution. `path` is absolute and
/// always lies under the session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub kind: ArtifactKind,
}

/// File state of a directory tree before an execution.
#[derive(Debug, Default)]
pub struct Snapshot {
    files: HashMap<PathBuf, (u64, Option<SystemTime>)>,
}

impl Snapshot {
    pub fn capture(root: &Path) -> Self {
        let files = walk_files(root)
            .map(|(path, meta)| (path, (meta.len(), meta.modified().ok())))
            .collect();
        Self { files }
    }

    /// Files that are new or changed since the snapshot, sorted by path.
    pub fn changed_since(&self, root: &Path) -> Vec<Artifact> {
        let mut artifacts: Vec<Artifact> = walk_files(root)
            .filter(|(path, meta)| match self.files.get(path) {
                None => true,
                Some((len, modified)) => *len != meta.len() || *modified != meta.modified().ok(),
            })
            .map(|(path, meta)| Artifact {
                kind: ArtifactKind::from_path(&path),
                size_bytes: meta.len(),
                path,
            })
            .collect();
        artifacts.sort_by(|a, b| a.path.cmp(&b.path));
        artifacts
    }
}

/// Regular files under `root`. Symlinks are not followed.
pub fn walk_files(root: &Path) -> impl Iterator<Item = (PathBuf, std::fs::Metadata)> {
    WalkDir::new(root)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            Some((entry.into_path(), meta))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(ArtifactKind::from_path(Path::new("a/chart.PNG")), ArtifactKind::Image);
        assert_eq!(ArtifactKind::from_path(Path::new("rows.csv")), ArtifactKind::Table);
        assert_eq!(ArtifactKind::from_path(Path::new("out.json")), ArtifactKind::Data);
        assert_eq!(ArtifactKind::from_path(Path::new("notes.txt")), ArtifactKind::Text);
        assert_eq!(ArtifactKind::from_path(Path::new("binary")), ArtifactKind::Other);
        assert_eq!(ArtifactKind::Image.to_string(), "image");
    }

    #[test]
    fn test_changed_since_reports_new_and_modified_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old.txt"), "a").unwrap();
        std::fs::write(dir.path().join("same.txt"), "a").unwrap();

        let snapshot = Snapshot::capture(dir.path());

        std::fs::write(dir.path().join("old.txt"), "longer").unwrap();
        std::fs::create_dir(dir.path().join("out")).unwrap();
        std::fs::write(dir.path().join("out/new.csv"), "x,y").unwrap();

        let changed = snapshot.changed_since(dir.path());
        let names: Vec<_> = changed
            .iter()
            .map(|a| a.path.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();

        assert_eq!(names, vec![PathBuf::from("old.txt"), PathBuf::from("out/new.csv")]);
        assert_eq!(changed[1].kind, ArtifactKind::Table);
        assert_eq!(changed[1].size_bytes, 3);
    }
}
