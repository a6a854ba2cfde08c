use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use s3s2_core::archive;
use s3s2_core::creds::{self, CredentialRefresher};
use s3s2_core::crypto::{self, SignedPublicKey};
use s3s2_core::file::{self, FileRecord};
use s3s2_core::layout;
use s3s2_core::manifest::Manifest;
use s3s2_core::options::Options;
use s3s2_core::store::{GcsStore, ObjectStore, S3Store};

/// Shared state handed to every worker; the batch folder travels separately
/// because it changes at rollover.
#[derive(Clone)]
struct WorkerContext {
    store: Arc<dyn ObjectStore>,
    public_key: Option<Arc<SignedPublicKey>>,
    work_folder: PathBuf,
    source_dir: PathBuf,
    date_folder: String,
    list_mode: bool,
    opts: Options,
}

/// Runs the transfer pipeline: enumerate, then per chunk refresh credentials,
/// roll the batch folder when full, fan out zip→encrypt→upload workers, and
/// rewrite the manifest so the store always lists a decryptable prefix.
pub async fn run(opts: Options) -> Result<()> {
    opts.validate_share()?;

    let start = Instant::now();
    let now = Utc::now();
    let run_stamp = now.format("%Y%m%d%H%M%S").to_string();
    let date_folder = now.format("%Y%m%d").to_string();

    let list_mode = opts.share_from_list.is_some();
    let (payload, metadata) = if let Some(list) = &opts.share_from_list {
        (file::from_csv(list, &date_folder)?, Vec::new())
    } else {
        let dir = opts.directory.as_ref().expect("validated");
        file::from_directory(dir, &opts.metadata_files)?
    };
    if payload.is_empty() && metadata.is_empty() {
        bail!("no transferable files found; the source is empty or only holds prior artifacts");
    }
    info!(
        payload = payload.len(),
        metadata = metadata.len(),
        "starting share run"
    );

    let chunks = plan_chunks(metadata, payload, opts.chunk_size);

    let (store, s3_store) = build_stores(&opts).await?;
    let public_key = if opts.has_public_key_source() {
        Some(Arc::new(crypto::load_public_key(&opts).await?))
    } else {
        None
    };

    let region = creds::resolve_region(&opts.region);
    let role_arn = match creds::resolve_role_arn(opts.aws_role_arn.as_deref()) {
        Ok(arn) => Some(arn),
        Err(e) => {
            debug!(reason = %e, "federated credential refresh disabled");
            None
        }
    };
    let refresher = CredentialRefresher::new();

    let source_dir = opts
        .directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let work_folder = match &opts.scratch_directory {
        Some(scratch) => scratch.join(&opts.org),
        None => source_dir.clone(),
    };

    let ctx = WorkerContext {
        store: store.clone(),
        public_key,
        work_folder: work_folder.clone(),
        source_dir: source_dir.clone(),
        date_folder,
        list_mode,
        opts: opts.clone(),
    };

    let semaphore = Arc::new(Semaphore::new(opts.parallelism.max(1)));
    let folder_cap = opts.batch_size + chunks[0].len();
    let mut batch_index: u32 = 0;
    let mut folder_count: usize = 0;
    let mut uploaded: Vec<FileRecord> = Vec::new();
    let mut batch_folder = layout::batch_folder(&opts.prefix, &run_stamp, batch_index);

    for (i_chunk, chunk) in chunks.iter().enumerate() {
        info!(chunk = i_chunk, files = chunk.len(), folder = %batch_folder, "processing chunk");

        // credential handoff: at most one refresher is ever active
        refresher.stop().await;
        store.refresh().await;
        if let (Some(s3), Some(arn)) = (&s3_store, &role_arn) {
            refresher.start(s3.clone(), arn, &region).await;
        }

        // tie off the current folder once this chunk would overflow it
        if needs_rollover(folder_count, chunk.len(), folder_cap) {
            if opts.lambda_trigger {
                store.upload_trigger(&opts.org, &batch_folder).await?;
            }
            batch_index += 1;
            batch_folder = layout::batch_folder(&opts.prefix, &run_stamp, batch_index);
            folder_count = 0;
            info!(folder = %batch_folder, "rolled over to new batch folder");

            // every folder carries the metadata set, seeded exactly once
            for record in &chunks[0] {
                process_record(ctx.clone(), batch_folder.clone(), record.clone())
                    .await
                    .with_context(|| format!("seeding metadata into '{}'", batch_folder))?;
            }
            folder_count += chunks[0].len();
            uploaded = chunks[0].clone();
        }

        let mut tasks = JoinSet::new();
        for record in chunk.iter().cloned() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            let ctx = ctx.clone();
            let batch_folder = batch_folder.clone();
            tasks.spawn(async move {
                let _permit = permit;
                process_record(ctx, batch_folder, record).await
            });
        }

        // barrier: every worker of this chunk completes before the manifest
        // may advance
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
            refresher.stop().await;
            return Err(e.context(format!("chunk {} failed", i_chunk)));
        }

        uploaded.extend(chunk.iter().cloned());
        folder_count += chunk.len();

        let manifest = Manifest::build(uploaded.clone(), &batch_folder, &opts.org);
        let local = manifest.write_local(&source_dir)?;
        store
            .upload_file(&opts.org, &layout::manifest_key(&batch_folder), &local)
            .await
            .context("uploading manifest")?;

        // metadata archives only once the whole run is done
        if let Some(archive_dir) = &opts.archive_directory {
            if i_chunk != 0 {
                info!(chunk = i_chunk, "archiving chunk");
                file::archive_records(chunk, &source_dir, archive_dir)?;
            }
        }

        info!(chunk = i_chunk, uploaded = uploaded.len(), "chunk complete");
    }

    refresher.stop().await;

    if let Some(archive_dir) = &opts.archive_directory {
        if !chunks[0].is_empty() {
            file::archive_records(&chunks[0], &source_dir, archive_dir)?;
        }
    }
    if opts.delete_on_completion {
        if let Some(dir) = &opts.directory {
            file::delete_dir_contents(dir)?;
        }
    }
    if opts.scratch_directory.is_some() {
        let _ = std::fs::remove_dir_all(&work_folder);
    }
    if opts.lambda_trigger {
        store.upload_trigger(&opts.org, &batch_folder).await?;
    }

    info!(elapsed_secs = start.elapsed().as_secs_f64(), "share complete");
    Ok(())
}

/// The metadata set is always chunk 0, even when empty; payload follows in
/// chunks of at most `chunk_size`.
fn plan_chunks(
    metadata: Vec<FileRecord>,
    payload: Vec<FileRecord>,
    chunk_size: usize,
) -> Vec<Vec<FileRecord>> {
    let mut chunks = vec![metadata];
    chunks.extend(file::chunk_records(payload, chunk_size));
    chunks
}

/// The cap is evaluated chunk-at-a-time; a chunk is never split across
/// folders.
fn needs_rollover(folder_count: usize, incoming: usize, cap: usize) -> bool {
    folder_count + incoming > cap
}

async fn build_stores(opts: &Options) -> Result<(Arc<dyn ObjectStore>, Option<Arc<S3Store>>)> {
    if opts.is_gcs {
        let store: Arc<dyn ObjectStore> = Arc::new(GcsStore::new(&opts.bucket).await?);
        Ok((store, None))
    } else {
        let s3 = Arc::new(S3Store::new(opts).await);
        let store: Arc<dyn ObjectStore> = s3.clone();
        Ok((store, Some(s3)))
    }
}

/// One worker: archive, encrypt, upload; intermediates are removed on every
/// exit path so an interrupted run restarts clean.
async fn process_record(
    ctx: WorkerContext,
    batch_folder: String,
    record: FileRecord,
) -> Result<()> {
    let started = Instant::now();
    debug!(file = %record.name, "processing file");

    if ctx.list_mode {
        return process_record_in_memory(&ctx, &batch_folder, record).await;
    }

    let fn_source = record.source_name(&ctx.source_dir);
    let fn_zip = record.zip_name(&ctx.work_folder);
    let fn_encrypted = record.encrypted_name(&ctx.work_folder);
    // the object key carries the .zip.gpg suffix in every mode; the receive
    // side derives the same key from the manifest entry
    let key_suffix = record.encrypted_suffix(&batch_folder);

    let result: Result<()> = async {
        let upload_path = match &ctx.public_key {
            Some(pk) => {
                let pk = pk.clone();
                let (src, zip, enc, base) = (
                    fn_source.clone(),
                    fn_zip.clone(),
                    fn_encrypted.clone(),
                    ctx.source_dir.clone(),
                );
                tokio::task::spawn_blocking(move || -> Result<()> {
                    archive::zip_file(&src, &zip, &base)?;
                    crypto::encrypt_file(&pk, &zip, &enc)?;
                    Ok(())
                })
                .await??;
                fn_encrypted.clone()
            }
            None => {
                // KMS-only mode: the store's encryption layer stands in for
                // the OpenPGP packet
                let (src, zip, base) =
                    (fn_source.clone(), fn_zip.clone(), ctx.source_dir.clone());
                tokio::task::spawn_blocking(move || -> Result<()> {
                    archive::zip_file(&src, &zip, &base)?;
                    Ok(())
                })
                .await??;
                fn_zip.clone()
            }
        };
        ctx.store
            .upload_file(&ctx.opts.org, &key_suffix, &upload_path)
            .await?;
        Ok(())
    }
    .await;

    file::cleanup_file(&fn_zip);
    file::cleanup_file(&fn_encrypted);
    if ctx.opts.scratch_directory.is_some() {
        file::prune_empty_parents(&fn_zip, &ctx.work_folder);
    }

    if result.is_ok() {
        debug!(file = %record.name, elapsed = ?started.elapsed(), "processed file");
    }
    result.with_context(|| format!("processing '{}'", record.name))
}

/// List-mode worker: the container and the encrypted packet only ever exist
/// as buffers, moved into the upload and freed when it returns.
async fn process_record_in_memory(
    ctx: &WorkerContext,
    batch_folder: &str,
    record: FileRecord,
) -> Result<()> {
    let source = record.source_name(&PathBuf::from("."));
    let key_suffix = record.encrypted_suffix(batch_folder);

    let bytes = match &ctx.public_key {
        Some(pk) => {
            let pk = pk.clone();
            let date_folder = ctx.date_folder.clone();
            let name = record.name.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                let zipped = archive::zip_bytes_in_memory(&source, &date_folder)?;
                Ok(crypto::encrypt_bytes(&pk, &name, &zipped)?)
            })
            .await??
        }
        None => {
            let date_folder = ctx.date_folder.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                Ok(archive::zip_bytes_in_memory(&source, &date_folder)?)
            })
            .await??
        }
    };

    ctx.store
        .upload_buffer(&ctx.opts.org, &key_suffix, bytes)
        .await
        .with_context(|| format!("processing '{}'", record.name))?;
    Ok(())
}
