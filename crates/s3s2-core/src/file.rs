use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::layout::{self, MANIFEST_NAME, TRIGGER_NAME};

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(String),
    #[error("invalid source: {0}")]
    InvalidSource(String),
}

/// One file scheduled for transfer. `name` is the POSIX-normalized relative
/// path used for in-archive entries, object keys and manifest entries.
/// `origin` is set in list mode, where the source lives outside the base
/// directory; it never appears in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    #[serde(skip)]
    pub origin: Option<PathBuf>,
}

impl FileRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), origin: None }
    }

    pub fn with_origin(name: impl Into<String>, origin: PathBuf) -> Self {
        Self { name: name.into(), origin: Some(origin) }
    }

    /// Where the plaintext is read from.
    pub fn source_name(&self, base: &Path) -> PathBuf {
        match &self.origin {
            Some(origin) => origin.clone(),
            None => base.join(&self.name),
        }
    }

    /// Local path of the zip intermediate under `base`.
    pub fn zip_name(&self, base: &Path) -> PathBuf {
        base.join(format!("{}.zip", self.name))
    }

    /// Local path of the encrypted intermediate under `base`.
    pub fn encrypted_name(&self, base: &Path) -> PathBuf {
        base.join(format!("{}.zip.gpg", self.name))
    }

    /// Key suffix of the uploaded object inside a batch folder. Objects
    /// always carry the `.zip.gpg` suffix, KMS-only runs included.
    pub fn encrypted_suffix(&self, folder: &str) -> String {
        format!("{}/{}.zip.gpg", folder, self.name)
    }
}

/// Walks `dir` and partitions discovered files into (payload, metadata).
/// Skips the manifest artifact, dotfiles this tool writes, and any leftover
/// `.zip` / `.zip.gpg` intermediates from a prior run.
pub fn from_directory(
    dir: &Path,
    metadata_files: &[String],
) -> Result<(Vec<FileRecord>, Vec<FileRecord>), FileError> {
    let mut payload = Vec::new();
    let mut metadata = Vec::new();

    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if file_name == MANIFEST_NAME
            || is_tool_artifact(&file_name)
            || file_name.ends_with(".zip")
            || file_name.ends_with(".zip.gpg")
        {
            debug!(file = %file_name, "skipping non-transfer file");
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| FileError::InvalidSource(e.to_string()))?;
        let name = layout::to_posix(&rel.to_string_lossy());
        let record = FileRecord::new(name);

        if is_metadata(&record.name, metadata_files) {
            metadata.push(record);
        } else {
            payload.push(record);
        }
    }

    debug!(
        payload = payload.len(),
        metadata = metadata.len(),
        dir = %dir.display(),
        "enumerated source directory"
    );
    Ok((payload, metadata))
}

/// Dotfile sentinels this tool writes; any other dotfile is ordinary payload.
fn is_tool_artifact(name: &str) -> bool {
    name == TRIGGER_NAME || name.starts_with(".s3s2")
}

fn is_metadata(name: &str, metadata_files: &[String]) -> bool {
    metadata_files
        .iter()
        .any(|m| m.trim().eq_ignore_ascii_case(name))
}

/// Reads a CSV index whose first column is a source path. Every entry lands
/// under the synthetic `<date_folder>/<basename>` archive prefix and is
/// payload; list mode has no metadata set.
pub fn from_csv(path: &Path, date_folder: &str) -> Result<Vec<FileRecord>, FileError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| FileError::Csv(e.to_string()))?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| FileError::Csv(e.to_string()))?;
        let Some(source) = row.get(0).map(str::trim).filter(|s| !s.is_empty()) else {
            continue;
        };
        let source_path = PathBuf::from(source);
        let basename = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| FileError::InvalidSource(source.to_string()))?;
        records.push(FileRecord::with_origin(
            format!("{}/{}", date_folder, basename),
            source_path,
        ));
    }

    debug!(count = records.len(), list = %path.display(), "enumerated list file");
    Ok(records)
}

/// Splits payload records into ordered chunks of at most `chunk_size`.
pub fn chunk_records(records: Vec<FileRecord>, chunk_size: usize) -> Vec<Vec<FileRecord>> {
    let chunk_size = chunk_size.max(1);
    records
        .chunks(chunk_size)
        .map(|c| c.to_vec())
        .collect()
}

/// Moves processed sources from `source_dir` to `archive_dir`, preserving
/// relative paths.
pub fn archive_records(
    records: &[FileRecord],
    source_dir: &Path,
    archive_dir: &Path,
) -> Result<(), FileError> {
    for record in records {
        let src = record.source_name(source_dir);
        let dst = archive_dir.join(&record.name);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&src, &dst) {
            Ok(()) => {}
            Err(_) => {
                // rename fails across filesystems; copy and remove instead
                fs::copy(&src, &dst)?;
                fs::remove_file(&src)?;
            }
        }
        debug!(from = %src.display(), to = %dst.display(), "archived file");
    }
    Ok(())
}

/// Best-effort removal of an intermediate artifact.
pub fn cleanup_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if path.exists() {
            warn!(path = %path.display(), error = %e, "failed to remove intermediate");
        }
    }
}

/// Removes `path`'s parent directory if it is now empty, walking upward until
/// `stop_at`. Non-empty directories end the walk.
pub fn prune_empty_parents(path: &Path, stop_at: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Deletes every entry directly under `dir`, leaving `dir` itself in place.
pub fn delete_dir_contents(dir: &Path) -> Result<(), FileError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn touch(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn directory_walk_skips_tool_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.txt"), "a");
        touch(&dir.path().join("sub/b.txt"), "b");
        touch(&dir.path().join("s3s2_manifest.json"), "{}");
        touch(&dir.path().join("._lambda_trigger"), "");
        touch(&dir.path().join(".s3s2_state"), "");
        touch(&dir.path().join("old.txt.zip"), "zip");
        touch(&dir.path().join("old.txt.zip.gpg"), "gpg");

        let (payload, metadata) = from_directory(dir.path(), &[]).unwrap();
        let mut names: Vec<String> = payload.into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "sub/b.txt"]);
        assert!(metadata.is_empty());
    }

    // dotfiles the user owns are payload like anything else
    #[test]
    fn directory_walk_keeps_foreign_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(".env"), "SECRET=1");
        touch(&dir.path().join("a.txt"), "a");

        let (payload, _) = from_directory(dir.path(), &[]).unwrap();
        let mut names: Vec<String> = payload.into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec![".env", "a.txt"]);
    }

    #[test]
    fn directory_walk_partitions_metadata_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("data.txt"), "d");
        touch(&dir.path().join("Meta.csv"), "m");

        let (payload, metadata) =
            from_directory(dir.path(), &["meta.csv".to_string()]).unwrap();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].name, "data.txt");
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].name, "Meta.csv");
    }

    #[test]
    fn csv_entries_land_under_date_folder() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("files.csv");
        touch(&list, "/data/one.txt\n/data/nested/two.txt\n");

        let records = from_csv(&list, "20240301").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "20240301/one.txt");
        assert_eq!(records[0].origin, Some(PathBuf::from("/data/one.txt")));
        assert_eq!(records[1].name, "20240301/two.txt");
    }

    #[test]
    fn derived_names() {
        let r = FileRecord::new("sub/a.txt");
        let base = Path::new("/work");
        assert_eq!(r.source_name(base), PathBuf::from("/work/sub/a.txt"));
        assert_eq!(r.zip_name(base), PathBuf::from("/work/sub/a.txt.zip"));
        assert_eq!(
            r.encrypted_name(base),
            PathBuf::from("/work/sub/a.txt.zip.gpg")
        );
        assert_eq!(
            r.encrypted_suffix("p_s3s2_x_0"),
            "p_s3s2_x_0/sub/a.txt.zip.gpg"
        );
    }

    #[test]
    fn origin_wins_over_base() {
        let r = FileRecord::with_origin("20240301/one.txt", PathBuf::from("/data/one.txt"));
        assert_eq!(r.source_name(Path::new("/ignored")), PathBuf::from("/data/one.txt"));
    }

    #[test]
    fn chunking_math() {
        let records: Vec<FileRecord> =
            (0..25).map(|i| FileRecord::new(format!("f{}", i))).collect();
        let chunks = chunk_records(records, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);

        assert!(chunk_records(Vec::new(), 10).is_empty());
    }

    #[test]
    fn archive_preserves_relative_paths() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        touch(&src.path().join("sub/a.txt"), "a");

        let records = vec![FileRecord::new("sub/a.txt")];
        archive_records(&records, src.path(), dst.path()).unwrap();

        assert!(!src.path().join("sub/a.txt").exists());
        assert_eq!(
            fs::read_to_string(dst.path().join("sub/a.txt")).unwrap(),
            "a"
        );
    }

    #[test]
    fn prune_stops_at_root() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a/b/c.txt");
        touch(&nested, "x");
        fs::remove_file(&nested).unwrap();

        prune_empty_parents(&nested, root.path());
        assert!(!root.path().join("a").exists());
        assert!(root.path().exists());
    }
}
