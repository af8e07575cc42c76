use crate::error::{CheckpointError, Result};
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::{FileOptions, ZipWriter};
use zip::{CompressionMethod, ZipArchive};

const DEFAULT_LEVEL: u8 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnpackSummary {
    pub file_count: usize,
    pub size: u64,
}

/// Packs a directory tree into a zip blob. Names in `exclude` are skipped
/// when they sit directly under `directory`.
pub fn pack(directory: &Path, exclude: &[&str]) -> Result<Vec<u8>> {
    pack_with_level(directory, exclude, DEFAULT_LEVEL)
}

pub fn pack_with_level(directory: &Path, exclude: &[&str], level: u8) -> Result<Vec<u8>> {
    if !directory.is_dir() {
        return Err(CheckpointError::SourceNotFound(directory.to_path_buf()));
    }

    let mut archive = ZipWriter::new(Cursor::new(Vec::new()));
    let file_options = zip_data_options(level);

    let walker = WalkDir::new(directory)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() != 1
                || !exclude
                    .iter()
                    .any(|name| *name == entry.file_name().to_string_lossy())
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            CheckpointError::io(
                format!("Failed to read directory {}", directory.display()),
                e.into(),
            )
        })?;
        if entry.depth() == 0 {
            continue;
        }

        let archive_name = archive_path(directory, entry.path())?;
        if entry.file_type().is_dir() {
            archive
                .add_directory(archive_name, zip_directory_options())
                .map_err(|e| CheckpointError::io("Failed to write archive", e.into()))?;
        } else if entry.path().is_file() {
            let mut source = File::open(entry.path()).map_err(|e| {
                CheckpointError::io(format!("Failed to open {}", entry.path().display()), e)
            })?;
            archive
                .start_file(archive_name, file_options)
                .map_err(|e| CheckpointError::io("Failed to write archive", e.into()))?;
            std::io::copy(&mut source, &mut archive).map_err(|e| {
                CheckpointError::io(format!("Failed to pack {}", entry.path().display()), e)
            })?;
        }
    }

    let cursor = archive
        .finish()
        .map_err(|e| CheckpointError::io("Failed to finish archive", e.into()))?;
    Ok(cursor.into_inner())
}

/// Extracts `bytes` into `destination`, all or nothing.
///
/// Entries are written to a sibling staging directory first and moved into
/// place only after every entry decoded cleanly. `destination` must be
/// absent or an empty directory. Entries named in `ignore` at the archive
/// root are dropped.
pub fn unpack(bytes: &[u8], destination: &Path, ignore: &[&str]) -> Result<UnpackSummary> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| CheckpointError::CorruptArchive(e.to_string()))?;

    let parent = destination.parent().ok_or_else(|| {
        CheckpointError::validation("destination", "archive destination has no parent directory")
    })?;
    fs::create_dir_all(parent).map_err(|e| {
        CheckpointError::io(format!("Failed to create directory {}", parent.display()), e)
    })?;
    let staging = parent.join(format!(".unpack-{}", Uuid::new_v4().simple()));
    fs::create_dir(&staging).map_err(|e| {
        CheckpointError::io(format!("Failed to create directory {}", staging.display()), e)
    })?;

    let result = extract_all(&mut archive, &staging, ignore)
        .and_then(|summary| move_into_place(&staging, destination).map(|()| summary));
    if result.is_err() {
        if let Err(e) = fs::remove_dir_all(&staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove staging directory {}: {}", staging.display(), e);
            }
        }
    }
    result
}

fn extract_all(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    staging: &Path,
    ignore: &[&str],
) -> Result<UnpackSummary> {
    let mut summary = UnpackSummary::default();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| CheckpointError::CorruptArchive(e.to_string()))?;
        let relative = entry
            .enclosed_name()
            .filter(|path| is_plain_relative(path))
            .ok_or_else(|| {
                CheckpointError::CorruptArchive(format!("unsafe entry path '{}'", entry.name()))
            })?;

        if relative.components().count() == 1 {
            let name = relative.to_string_lossy();
            if ignore.iter().any(|skip| *skip == name) {
                continue;
            }
        }

        let target = staging.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| {
                CheckpointError::io(format!("Failed to create directory {}", target.display()), e)
            })?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CheckpointError::io(format!("Failed to create directory {}", parent.display()), e)
            })?;
        }

        let mut out_file = File::create(&target).map_err(|e| {
            CheckpointError::io(format!("Failed to create {}", target.display()), e)
        })?;
        let name = entry.name().to_string();
        let copied = stream_entry(&mut entry, &mut out_file, &name, &target)?;

        summary.file_count += 1;
        summary.size += copied;
    }

    Ok(summary)
}

/// Copies one entry in fixed-size chunks. The size an entry declares is never
/// trusted. Decompression and CRC problems only surface while reading.
fn stream_entry(entry: &mut impl Read, out_file: &mut File, name: &str, target: &Path) -> Result<u64> {
    let mut buffer = [0u8; 64 * 1024];
    let mut copied = 0u64;
    loop {
        let read = match entry.read(&mut buffer) {
            Ok(0) => return Ok(copied),
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(CheckpointError::CorruptArchive(format!("entry '{}': {}", name, e)))
            }
        };
        out_file.write_all(&buffer[..read]).map_err(|e| {
            CheckpointError::io(format!("Failed to write {}", target.display()), e)
        })?;
        copied += read as u64;
    }
}

fn move_into_place(staging: &Path, destination: &Path) -> Result<()> {
    if destination.exists() {
        // Only an empty placeholder may be replaced.
        fs::remove_dir(destination).map_err(|e| {
            CheckpointError::io(
                format!("Archive destination {} is not empty", destination.display()),
                e,
            )
        })?;
    }
    fs::rename(staging, destination).map_err(|e| {
        CheckpointError::io(format!("Failed to move archive into {}", destination.display()), e)
    })
}

fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

fn archive_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|e| {
        CheckpointError::io(
            "Failed to calculate relative path",
            std::io::Error::new(std::io::ErrorKind::Other, e),
        )
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Ok(parts.join("/"))
}

fn zip_data_options(level: u8) -> FileOptions<'static, ()> {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(map_deflate_level(level)))
}

fn zip_directory_options() -> FileOptions<'static, ()> {
    FileOptions::default().compression_method(CompressionMethod::Stored)
}

fn map_deflate_level(level: u8) -> i64 {
    let clamped = level.clamp(1, 100) as i64;
    ((clamped - 1) * 8 / 99) + 1
}
