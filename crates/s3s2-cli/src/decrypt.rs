use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use s3s2_core::archive;
use s3s2_core::crypto::{self, SignedSecretKey};
use s3s2_core::file::{self, FileRecord};
use s3s2_core::layout;
use s3s2_core::manifest::Manifest;
use s3s2_core::options::{self, Options};
use s3s2_core::store::{self, ObjectStore};
use s3s2_core::wildcard::wildcard_to_regex;

const SKIPPED_LOG: &str = "skipped.txt";

/// Runs the receive pipeline: download the manifest, filter it, then fan out
/// download→decrypt→unzip workers. Empty objects are recorded and skipped;
/// everything else in the manifest must restore.
pub async fn run(opts: Options) -> Result<()> {
    opts.validate_decrypt()?;

    let start = Instant::now();
    if !opts.file.ends_with("manifest.json") {
        bail!("--file must name the batch manifest object, e.g. <folder>/s3s2_manifest.json");
    }

    let store = store::connect(&opts).await?;
    let secret_key = Arc::new(crypto::load_secret_key(&opts).await?);
    // bad public-key material should fail before any download starts
    if let Some(path) = &opts.pub_key {
        crypto::parse_public_key(&std::fs::read(path)?)?;
    }

    let target_dir = opts.directory.clone().expect("validated");
    std::fs::create_dir_all(&target_dir)?;

    if !store.exists(&opts.bucket, &opts.org, &opts.file).await? {
        bail!(
            "manifest object '{}' not found in bucket '{}'",
            opts.file,
            opts.bucket
        );
    }

    let manifest_name = Path::new(&opts.file)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(layout::MANIFEST_NAME));
    let manifest_local = target_dir.join(manifest_name);
    store
        .download(&opts.bucket, &opts.org, &opts.file, &manifest_local)
        .await
        .context("downloading manifest")?;
    let manifest = Manifest::read(&manifest_local)?;
    info!(
        folder = %manifest.folder,
        files = manifest.files.len(),
        "manifest loaded"
    );

    let records = filter_records(manifest.files.clone(), opts.filter_files.as_deref())?;
    info!(selected = records.len(), "restoring files");

    let semaphore = Arc::new(Semaphore::new(opts.parallelism.max(1)));
    let mut tasks = JoinSet::new();
    for record in records {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("worker pool closed")?;
        let store = store.clone();
        let secret_key = secret_key.clone();
        let manifest = manifest.clone();
        let target_dir = target_dir.clone();
        let opts = opts.clone();
        tasks.spawn(async move {
            let _permit = permit;
            restore_record(store, secret_key, manifest, record, target_dir, opts).await
        });
    }

    let mut first_err: Option<anyhow::Error> = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|e| Err(anyhow::Error::new(e)));
        if let Err(e) = outcome {
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    info!(elapsed_secs = start.elapsed().as_secs_f64(), "decrypt complete");
    Ok(())
}

/// Subsets manifest entries by comma-separated wildcard patterns matched
/// against the entry name; no patterns selects everything.
fn filter_records(
    files: Vec<FileRecord>,
    patterns: Option<&str>,
) -> Result<Vec<FileRecord>> {
    let Some(patterns) = patterns.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(files);
    };
    let regexes = options::parse_list(patterns)
        .iter()
        .map(|p| Regex::new(&wildcard_to_regex(p)))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("invalid filter pattern")?;

    Ok(files
        .into_iter()
        .filter(|f| regexes.iter().any(|r| r.is_match(&f.name)))
        .collect())
}

enum Fetch {
    Restored,
    Empty,
}

/// One worker with a single built-in retry: an error or an empty download
/// forces a fresh session and a second attempt before the entry is recorded
/// as skipped or the run fails.
async fn restore_record(
    store: Arc<dyn ObjectStore>,
    secret_key: Arc<SignedSecretKey>,
    manifest: Manifest,
    record: FileRecord,
    target_dir: PathBuf,
    opts: Options,
) -> Result<()> {
    let record = FileRecord::new(layout::to_posix(&record.name));

    match fetch_one(&store, &secret_key, &manifest, &record, &target_dir, &opts).await {
        Ok(Fetch::Restored) => Ok(()),
        Ok(Fetch::Empty) | Err(_) => {
            warn!(file = %record.name, "restore attempt failed; refreshing session and retrying");
            store.refresh().await;
            match fetch_one(&store, &secret_key, &manifest, &record, &target_dir, &opts).await {
                Ok(Fetch::Restored) => Ok(()),
                Ok(Fetch::Empty) => {
                    record_skipped(&record.name)?;
                    Ok(())
                }
                Err(e) => Err(e.context(format!("restoring '{}'", record.name))),
            }
        }
    }
}

async fn fetch_one(
    store: &Arc<dyn ObjectStore>,
    secret_key: &Arc<SignedSecretKey>,
    manifest: &Manifest,
    record: &FileRecord,
    target_dir: &Path,
    opts: &Options,
) -> Result<Fetch> {
    let started = Instant::now();
    debug!(file = %record.name, "starting restore");

    let object_key = record.encrypted_suffix(&manifest.folder);
    let fn_encrypted = record.encrypted_name(target_dir);
    let fn_zip = record.zip_name(target_dir);

    let written = store
        .download(&opts.bucket, &manifest.organization, &object_key, &fn_encrypted)
        .await?;
    if written == 0 {
        warn!(file = %record.name, "downloaded object is empty");
        file::cleanup_file(&fn_encrypted);
        return Ok(Fetch::Empty);
    }

    let result = {
        let secret_key = secret_key.clone();
        let (enc, zip, base) = (fn_encrypted.clone(), fn_zip.clone(), target_dir.to_path_buf());
        let restored_rel = PathBuf::from("decrypted").join(&record.name);
        tokio::task::spawn_blocking(move || -> Result<()> {
            crypto::decrypt_file(&secret_key, &enc, &zip)?;
            archive::unzip_file(&zip, &restored_rel, &base)?;
            Ok(())
        })
        .await?
    };

    file::cleanup_file(&fn_encrypted);
    file::cleanup_file(&fn_zip);

    result?;
    debug!(file = %record.name, elapsed = ?started.elapsed(), "restored file");
    Ok(Fetch::Restored)
}

/// Appends a session-expiry casualty to the local skipped log.
fn record_skipped(name: &str) -> Result<()> {
    use std::io::Write;
    let mut log = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(SKIPPED_LOG)
        .context("opening skipped log")?;
    writeln!(log, "{}", name).context("writing skipped log")?;
    warn!(file = name, "recorded skipped file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(names: &[&str]) -> Vec<FileRecord> {
        names.iter().map(|n| FileRecord::new(*n)).collect()
    }

    #[test]
    fn no_filter_selects_everything() {
        let files = entries(&["x/1.txt", "y/1.txt"]);
        assert_eq!(filter_records(files.clone(), None).unwrap(), files);
        assert_eq!(filter_records(files.clone(), Some("  ")).unwrap(), files);
    }

    #[test]
    fn wildcard_filter_subsets_by_name() {
        let files = entries(&["x/1.txt", "x/2.txt", "y/1.txt"]);
        let selected = filter_records(files, Some("x/*")).unwrap();
        let names: Vec<&str> = selected.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["x/1.txt", "x/2.txt"]);
    }

    #[test]
    fn multiple_patterns_union() {
        let files = entries(&["x/1.txt", "y/1.txt", "z/1.txt"]);
        let selected = filter_records(files, Some("x/*,z/*")).unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn entry_matching_two_patterns_appears_once() {
        let files = entries(&["x/1.txt"]);
        let selected = filter_records(files, Some("x/*,*1.txt")).unwrap();
        assert_eq!(selected.len(), 1);
    }
}
