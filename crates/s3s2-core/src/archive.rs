use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::Path;

use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::layout;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(String),
}

fn deflate() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Compresses `src` into a single-entry Deflate zip at `dst`. The in-archive
/// name is `src` relative to `base`, with forward slashes.
pub fn zip_file(src: &Path, dst: &Path, base: &Path) -> Result<(), ArchiveError> {
    debug!(src = %src.display(), dst = %dst.display(), "zipping file");

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let entry_name = match src.strip_prefix(base) {
        Ok(rel) => layout::to_posix(&rel.to_string_lossy()),
        Err(_) => layout::to_posix(&src.to_string_lossy()),
    };

    let mut source = File::open(src)?;
    let mut writer = ZipWriter::new(File::create(dst)?);
    writer
        .start_file(entry_name, deflate())
        .map_err(|e| ArchiveError::Zip(e.to_string()))?;
    io::copy(&mut source, &mut writer)?;
    writer.finish().map_err(|e| ArchiveError::Zip(e.to_string()))?;
    Ok(())
}

/// Same contract as [`zip_file`] but returns the container bytes; the entry
/// is named `<date_folder>/<basename-of-src>`.
pub fn zip_bytes_in_memory(src: &Path, date_folder: &str) -> Result<Vec<u8>, ArchiveError> {
    debug!(src = %src.display(), "zipping file in memory");

    let basename = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut source = File::open(src)?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(format!("{}/{}", date_folder, basename), deflate())
        .map_err(|e| ArchiveError::Zip(e.to_string()))?;
    io::copy(&mut source, &mut writer)?;
    let cursor = writer.finish().map_err(|e| ArchiveError::Zip(e.to_string()))?;
    Ok(cursor.into_inner())
}

/// Inflates every entry of the container at `src` to `join(base, dst)`.
/// Inputs without a `.zip` suffix are left alone.
pub fn unzip_file(src: &Path, dst: &Path, base: &Path) -> Result<(), ArchiveError> {
    if src.extension().map_or(true, |e| e != "zip") {
        warn!(src = %src.display(), "skipping inflate of non-zip file");
        return Ok(());
    }

    let mut archive =
        ZipArchive::new(File::open(src)?).map_err(|e| ArchiveError::Zip(e.to_string()))?;

    let out_path = base.join(dst);
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ArchiveError::Zip(e.to_string()))?;
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&out_path)?;
        io::copy(&mut entry, &mut output)?;
        debug!(entry = %entry.name(), to = %out_path.display(), "extracted file");
    }
    Ok(())
}
