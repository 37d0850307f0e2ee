// In engine/src/checkpoint.rs
//!
//! Dated zip snapshots of the previous baseline (`previous-<yyyyMMdd-HHmm>.zip`).
//!
//! Archives are immutable once written. The newest one is chosen by name, so
//! the timestamp format must sort lexicographically.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, TimeZone};
use regex::Regex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;

use crate::Error;

pub const ARCHIVE_EXTENSION: &str = "zip";

fn archive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^previous-\d{8}-\d{4}\.zip$").expect("archive name pattern is valid")
    })
}

pub fn is_archive_name(name: &str) -> bool {
    archive_pattern().is_match(name)
}

pub fn archive_name<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("previous-{}.zip", timestamp.format("%Y%m%d-%H%M"))
}

/// Checkpoint archives in `dir`, sorted oldest first. A missing dir is empty.
pub fn list_archives(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut archives = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_archive_name(name) && entry.file_type()?.is_file() {
            archives.push(entry.path());
        }
    }
    archives.sort();
    Ok(archives)
}

/// The lexicographically greatest archive, or none on a first-ever run.
pub fn find_latest_archive(dir: &Path) -> Result<Option<PathBuf>, Error> {
    Ok(list_archives(dir)?.pop())
}

/// Unzips `archive` into `dest`, returning the extracted file paths.
pub fn extract(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, Error> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    fs::create_dir_all(dest)?;

    let mut extracted = Vec::new();
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(Error::Archive {
                path: archive.to_path_buf(),
                reason: format!("entry {} escapes the extraction directory", entry.name()),
            });
        };
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        debug!(path = %target.display(), "extracted");
        extracted.push(target);
    }

    if extracted.is_empty() {
        return Err(Error::Archive {
            path: archive.to_path_buf(),
            reason: "archive contains no files".to_string(),
        });
    }

    info!(
        archive = %archive.display(),
        files = extracted.len(),
        "checkpoint extracted"
    );
    Ok(extracted)
}

/// Removes everything under `dest` except checkpoint archives.
pub fn purge_extracted(dest: &Path) -> Result<(), Error> {
    let entries = match fs::read_dir(dest) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else if !is_zip(&path) {
            fs::remove_file(&path)?;
        }
    }
    debug!(dir = %dest.display(), "purged extracted files");
    Ok(())
}

/// Zips the files under `src` into `dest_archive`.
///
/// Dot entries and existing archives are skipped; entries are written in
/// sorted order with `/`-separated names relative to `src`. Returns the
/// relative names written.
pub fn compress<F>(src: &Path, dest_archive: &Path, include: F) -> Result<Vec<String>, Error>
where
    F: Fn(&Path) -> bool,
{
    if let Some(parent) = dest_archive.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(dest_archive)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut written = Vec::new();
    let walker = WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.path()));
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() || is_zip(entry.path()) {
            continue;
        }
        let path = entry.path();
        if path == dest_archive || !include(path) {
            continue;
        }
        let Some(name) = relative_name(src, path) else {
            continue;
        };

        zip.start_file(name.as_str(), options)?;
        zip.write_all(&fs::read(path)?)?;
        written.push(name);
    }
    zip.finish()?;

    info!(
        archive = %dest_archive.display(),
        files = written.len(),
        "checkpoint archive written"
    );
    Ok(written)
}

pub fn delete_archives(dir: &Path) -> Result<usize, Error> {
    let archives = list_archives(dir)?;
    for archive in &archives {
        fs::remove_file(archive)?;
        debug!(archive = %archive.display(), "archive deleted");
    }
    Ok(archives.len())
}

/// Copies the visible files under `src` into `dest`, preserving relative paths.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut copied = Vec::new();
    if !src.is_dir() {
        warn!(dir = %src.display(), "copy source does not exist");
        return Ok(copied);
    }

    let walker = WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.path()));
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| Error::Invalid(format!("unexpected walk path: {err}")))?;
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)?;
        copied.push(target);
    }
    Ok(copied)
}

fn relative_name(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
        .unwrap_or(false)
}
