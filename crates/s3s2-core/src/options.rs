use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("need either an object-store KMS key or a receiver public key to encrypt safely")]
    NoKeyMaterial,
    #[error("missing required option: {0}")]
    Missing(&'static str),
    #[error("exactly one of --directory and --share-from-list must be set")]
    SourceConflict,
    #[error("refusing to operate on the filesystem root")]
    RootSource,
    #[error("prefix '{0}' does not contain any approved tag ({1})")]
    PrefixTag(String, String),
    #[error("need a private key (local path or secret-store entry) to decrypt")]
    NoPrivateKey,
}

/// Immutable run configuration, populated from the CLI and passed by
/// reference to every component.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub directory: Option<PathBuf>,
    pub share_from_list: Option<PathBuf>,
    pub org: String,
    pub prefix: String,
    pub bucket: String,
    pub region: String,
    /// Receive side: manifest object key within the bucket.
    pub file: String,
    pub parallelism: usize,
    pub chunk_size: usize,
    pub batch_size: usize,
    pub lambda_trigger: bool,
    pub scratch_directory: Option<PathBuf>,
    pub archive_directory: Option<PathBuf>,
    pub metadata_files: Vec<String>,
    pub delete_on_completion: bool,
    /// KMS key id for object-store server-side encryption.
    pub aws_key: Option<String>,
    pub pub_key: Option<PathBuf>,
    pub ssm_pub_key: Option<String>,
    pub priv_key: Option<PathBuf>,
    pub ssm_priv_key: Option<String>,
    pub is_gcs: bool,
    pub aws_role_arn: Option<String>,
    pub aws_profile: Option<String>,
    /// Approved domain tags the share prefix must contain.
    pub prefix_tags: Vec<String>,
    pub filter_files: Option<String>,
}

impl Options {
    pub fn has_public_key_source(&self) -> bool {
        self.pub_key.is_some() || self.ssm_pub_key.is_some()
    }

    pub fn has_private_key_source(&self) -> bool {
        self.priv_key.is_some() || self.ssm_priv_key.is_some()
    }

    pub fn validate_share(&self) -> Result<(), OptionsError> {
        if self.aws_key.is_none() && !self.has_public_key_source() {
            return Err(OptionsError::NoKeyMaterial);
        }
        if self.bucket.is_empty() {
            return Err(OptionsError::Missing("bucket"));
        }
        if self.org.is_empty() {
            return Err(OptionsError::Missing("org"));
        }
        match (&self.directory, &self.share_from_list) {
            (Some(_), Some(_)) | (None, None) => return Err(OptionsError::SourceConflict),
            (Some(dir), None) if is_fs_root(dir) => return Err(OptionsError::RootSource),
            _ => {}
        }
        let prefix = self.prefix.to_lowercase();
        if !self.prefix_tags.iter().any(|t| prefix.contains(&t.trim().to_lowercase())) {
            return Err(OptionsError::PrefixTag(
                self.prefix.clone(),
                self.prefix_tags.join(", "),
            ));
        }
        Ok(())
    }

    pub fn validate_decrypt(&self) -> Result<(), OptionsError> {
        if self.file.is_empty() {
            return Err(OptionsError::Missing("file"));
        }
        if self.bucket.is_empty() {
            return Err(OptionsError::Missing("bucket"));
        }
        if self.directory.is_none() {
            return Err(OptionsError::Missing("directory"));
        }
        if self.org.is_empty() {
            return Err(OptionsError::Missing("org"));
        }
        if self.region.is_empty() {
            return Err(OptionsError::Missing("region"));
        }
        if !self.has_private_key_source() {
            return Err(OptionsError::NoPrivateKey);
        }
        Ok(())
    }
}

fn is_fs_root(path: &Path) -> bool {
    path.parent().is_none()
}

/// Splits a comma-separated flag value into trimmed, non-empty entries.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn default_prefix_tags() -> Vec<String> {
    ["clinical", "documents", "imaging", "molecular"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share_opts() -> Options {
        Options {
            directory: Some(PathBuf::from("/data/out")),
            org: "acme".into(),
            prefix: "clinical-drop".into(),
            bucket: "bkt".into(),
            region: "us-east-1".into(),
            pub_key: Some(PathBuf::from("/keys/pub.asc")),
            prefix_tags: default_prefix_tags(),
            ..Default::default()
        }
    }

    #[test]
    fn valid_share_options_pass() {
        assert!(share_opts().validate_share().is_ok());
    }

    #[test]
    fn share_requires_key_material() {
        let mut opts = share_opts();
        opts.pub_key = None;
        assert!(matches!(
            opts.validate_share(),
            Err(OptionsError::NoKeyMaterial)
        ));
        opts.aws_key = Some("kms-key-id".into());
        assert!(opts.validate_share().is_ok());
    }

    #[test]
    fn share_requires_exactly_one_source() {
        let mut opts = share_opts();
        opts.share_from_list = Some(PathBuf::from("/data/list.csv"));
        assert!(matches!(
            opts.validate_share(),
            Err(OptionsError::SourceConflict)
        ));
        opts.directory = None;
        assert!(opts.validate_share().is_ok());
    }

    #[test]
    fn share_rejects_fs_root() {
        let mut opts = share_opts();
        opts.directory = Some(PathBuf::from("/"));
        assert!(matches!(opts.validate_share(), Err(OptionsError::RootSource)));
    }

    #[test]
    fn share_enforces_prefix_tag() {
        let mut opts = share_opts();
        opts.prefix = "random".into();
        assert!(matches!(
            opts.validate_share(),
            Err(OptionsError::PrefixTag(_, _))
        ));
        opts.prefix = "IMAGING_batch".into();
        assert!(opts.validate_share().is_ok());
    }

    #[test]
    fn decrypt_requires_private_key_source() {
        let opts = Options {
            file: "x/s3s2_manifest.json".into(),
            bucket: "bkt".into(),
            directory: Some(PathBuf::from("/restore")),
            org: "acme".into(),
            region: "us-east-1".into(),
            ..Default::default()
        };
        assert!(matches!(
            opts.validate_decrypt(),
            Err(OptionsError::NoPrivateKey)
        ));

        let opts = Options {
            ssm_priv_key: Some("/keys/priv".into()),
            ..opts
        };
        assert!(opts.validate_decrypt().is_ok());
    }

    #[test]
    fn list_parsing() {
        assert_eq!(parse_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }
}
