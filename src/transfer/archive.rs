//! In-memory archives of several paths, built once and replayed per attempt.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;
use zip::write::FileOptions;

use super::TransferError;

/// Container format for directory or multi-path payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum ArchiveMethod {
    #[serde(rename = "tar.gz")]
    #[value(name = "tar.gz")]
    TarGz,
    #[serde(rename = "zip")]
    #[value(name = "zip")]
    Zip,
}

impl Default for ArchiveMethod {
    fn default() -> Self {
        if cfg!(windows) {
            ArchiveMethod::Zip
        } else {
            ArchiveMethod::TarGz
        }
    }
}

impl ArchiveMethod {
    /// File name suffix, leading dot included.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveMethod::TarGz => ".tar.gz",
            ArchiveMethod::Zip => ".zip",
        }
    }
}

/// Archives `sources` into a buffer. Blocking; run it under `spawn_blocking`.
///
/// Entry names are relative to each source's parent directory, so a
/// directory `photos/` yields `photos/a.jpg`, and a lone file keeps its
/// base name. Duplicate names get a numeric suffix. `cancel` is checked
/// between entries.
pub fn build_archive(
    method: ArchiveMethod,
    sources: &[PathBuf],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, TransferError> {
    // No files (an empty directory) still yields a valid, empty archive.
    let entries = collect_entries(sources)?;

    tracing::debug!(entries = entries.len(), ?method, "building archive");
    match method {
        ArchiveMethod::TarGz => write_tar_gz(&entries, cancel),
        ArchiveMethod::Zip => write_zip(&entries, cancel),
    }
}

fn collect_entries(sources: &[PathBuf]) -> Result<Vec<(PathBuf, String)>, TransferError> {
    let mut entries = Vec::new();
    let mut names = HashSet::<PathBuf>::new();

    for source in sources {
        let meta = std::fs::metadata(source)
            .map_err(|e| TransferError::io(format!("cannot stat {}", source.display()), e))?;

        if meta.is_dir() {
            let root = source
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("dir"));
            for entry in WalkDir::new(source).sort_by_file_name() {
                let entry = entry.map_err(|e| TransferError::Archive(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
                let name = unique_entry_name(&root.join(rel), &mut names);
                entries.push((entry.path().to_path_buf(), name));
            }
        } else {
            let wanted = source
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("file"));
            let name = unique_entry_name(&wanted, &mut names);
            entries.push((source.clone(), name));
        }
    }

    Ok(entries)
}

fn unique_entry_name(wanted: &Path, names: &mut HashSet<PathBuf>) -> String {
    if names.insert(wanted.to_path_buf()) {
        return entry_name(wanted);
    }

    let stem = wanted.file_stem().and_then(|x| x.to_str()).unwrap_or("file");
    let ext = wanted.extension().and_then(|x| x.to_str());
    let parent = wanted.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut idx = 2usize;
    loop {
        let candidate = match ext {
            Some(ext) if !ext.is_empty() => parent.join(format!("{stem}-{idx}.{ext}")),
            _ => parent.join(format!("{stem}-{idx}")),
        };
        if names.insert(candidate.clone()) {
            return entry_name(&candidate);
        }
        idx += 1;
    }
}

// Archive members always use '/' and never start with one.
fn entry_name(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .trim_start_matches('/')
        .to_string()
}

fn write_tar_gz(
    entries: &[(PathBuf, String)],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, TransferError> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (source, name) in entries {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        builder
            .append_path_with_name(source, name)
            .map_err(|e| TransferError::io(format!("cannot add {} to archive", source.display()), e))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| TransferError::io("cannot finish tar stream", e))?;
    encoder
        .finish()
        .map_err(|e| TransferError::io("cannot finish gzip stream", e))
}

fn write_zip(
    entries: &[(PathBuf, String)],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, TransferError> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (source, name) in entries {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let mut file = File::open(source)
            .map_err(|e| TransferError::io(format!("cannot open {}", source.display()), e))?;
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| TransferError::Archive(format!("cannot start entry {name}: {e}")))?;
        io::copy(&mut file, &mut writer)
            .map_err(|e| TransferError::io(format!("cannot add {} to archive", source.display()), e))?;
    }

    let mut cursor = writer
        .finish()
        .map_err(|e| TransferError::Archive(format!("cannot finish zip: {e}")))?;
    cursor
        .flush()
        .map_err(|e| TransferError::io("cannot flush zip buffer", e))?;
    Ok(cursor.into_inner())
}
