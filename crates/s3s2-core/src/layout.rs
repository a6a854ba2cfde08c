// Object-key layout helpers.
// Layout:
// s3://bucket/
// └─ {ORG}/
//    └─ {prefix}_s3s2_{yyyymmddhhmmss}_{n}/
//       ├─ {relpath}.zip.gpg ...
//       ├─ s3s2_manifest.json
//       └─ ._lambda_trigger

/// Well-known manifest object name, overwritten after every chunk.
pub const MANIFEST_NAME: &str = "s3s2_manifest.json";

/// Zero-byte sentinel signalling downstream consumers that a folder is complete.
pub const TRIGGER_NAME: &str = "._lambda_trigger";

/// Batch-folder prefix for the given run timestamp and rollover index.
pub fn batch_folder(prefix: &str, timestamp: &str, index: u32) -> String {
    format!("{}_s3s2_{}_{}", prefix, timestamp, index)
}

/// Final object key: uppercased org joined with the supplied suffix,
/// forward slashes regardless of host OS, lexically cleaned.
pub fn object_key(org: &str, suffix: &str) -> String {
    posix_clean(&format!("{}/{}", org.to_uppercase(), suffix))
}

pub fn manifest_key(folder: &str) -> String {
    format!("{}/{}", folder, MANIFEST_NAME)
}

pub fn trigger_key(folder: &str) -> String {
    format!("{}/{}", folder, TRIGGER_NAME)
}

/// Lexical path clean over forward slashes: collapses repeated separators,
/// drops `.` segments and resolves `..` without touching the filesystem.
pub fn posix_clean(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if out.pop().is_none() {
                    out.push("..");
                }
            }
            s => out.push(s),
        }
    }
    let cleaned = out.join("/");
    if cleaned.is_empty() {
        ".".to_string()
    } else {
        cleaned
    }
}

/// Normalize any host-OS separators to forward slashes.
pub fn to_posix(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_folder_format() {
        assert_eq!(
            batch_folder("clinical", "20240301120000", 0),
            "clinical_s3s2_20240301120000_0"
        );
        assert_eq!(
            batch_folder("documents-x", "20240301120000", 2),
            "documents-x_s3s2_20240301120000_2"
        );
    }

    #[test]
    fn object_key_uppercases_org() {
        assert_eq!(
            object_key("acme", "folder/a.txt.zip.gpg"),
            "ACME/folder/a.txt.zip.gpg"
        );
    }

    #[test]
    fn object_key_cleans_path() {
        assert_eq!(object_key("org", "a//b/./c.zip.gpg"), "ORG/a/b/c.zip.gpg");
        assert_eq!(object_key("org", "a/b/../c"), "ORG/a/c");
    }

    #[test]
    fn posix_clean_edge_cases() {
        assert_eq!(posix_clean("a/b/c"), "a/b/c");
        assert_eq!(posix_clean("./a"), "a");
        assert_eq!(posix_clean(""), ".");
        assert_eq!(posix_clean("a/.."), ".");
    }

    #[test]
    fn trigger_and_manifest_keys() {
        assert_eq!(
            trigger_key("p_s3s2_20240301120000_0"),
            "p_s3s2_20240301120000_0/._lambda_trigger"
        );
        assert_eq!(
            manifest_key("p_s3s2_20240301120000_0"),
            "p_s3s2_20240301120000_0/s3s2_manifest.json"
        );
    }

    #[test]
    fn to_posix_converts_backslashes() {
        assert_eq!(to_posix("a\\b\\c.txt"), "a/b/c.txt");
        assert_eq!(to_posix("a/b"), "a/b");
    }
}
