use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::file::FileRecord;
use crate::layout::MANIFEST_NAME;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(String),
}

/// Listing of every file whose encrypted object has been acknowledged within
/// one batch folder. Rewritten after each chunk; a reader always observes a
/// fully decryptable prefix of the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub folder: String,
    pub organization: String,
    pub name: String,
    pub files: Vec<FileRecord>,
    pub timestamp: String,
    pub version: String,
}

impl Manifest {
    pub fn build(files: Vec<FileRecord>, folder: &str, org: &str) -> Self {
        Self {
            folder: folder.to_string(),
            organization: org.to_string(),
            name: MANIFEST_NAME.to_string(),
            files,
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Writes the manifest as pretty JSON to `<dir>/s3s2_manifest.json`,
    /// replacing any prior copy.
    pub fn write_local(&self, dir: &Path) -> Result<PathBuf, ManifestError> {
        let path = dir.join(MANIFEST_NAME);
        let json =
            serde_json::to_vec_pretty(self).map_err(|e| ManifestError::Json(e.to_string()))?;
        fs::write(&path, json)?;
        debug!(path = %path.display(), files = self.files.len(), "wrote manifest");
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self, ManifestError> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| ManifestError::Json(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_populates_well_known_fields() {
        let m = Manifest::build(
            vec![FileRecord::new("a.txt")],
            "clinical_s3s2_20240301120000_0",
            "acme",
        );
        assert_eq!(m.name, "s3s2_manifest.json");
        assert_eq!(m.folder, "clinical_s3s2_20240301120000_0");
        assert_eq!(m.organization, "acme");
        assert_eq!(m.files.len(), 1);
        assert!(!m.timestamp.is_empty());
        assert!(!m.version.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let m = Manifest::build(
            vec![FileRecord::new("a.txt"), FileRecord::new("sub/b.txt")],
            "f_s3s2_x_0",
            "org",
        );
        let path = m.write_local(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(MANIFEST_NAME));

        let back = Manifest::read(&path).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn write_overwrites_prior_copy() {
        let dir = tempfile::tempdir().unwrap();
        Manifest::build(vec![FileRecord::new("a.txt")], "f", "org")
            .write_local(dir.path())
            .unwrap();
        Manifest::build(
            vec![FileRecord::new("a.txt"), FileRecord::new("b.txt")],
            "f",
            "org",
        )
        .write_local(dir.path())
        .unwrap();

        let back = Manifest::read(&dir.path().join(MANIFEST_NAME)).unwrap();
        assert_eq!(back.files.len(), 2);
    }

    #[test]
    fn serialized_entries_carry_name_only() {
        let m = Manifest::build(
            vec![FileRecord::with_origin("20240301/a.txt", "/abs/a.txt".into())],
            "f",
            "org",
        );
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"name\":\"20240301/a.txt\""));
        assert!(!json.contains("origin"));
    }
}
