use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use log::{debug, error, trace};
use notify::EventKind;
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

use crate::{OmniError, Result};

/// Returns true when a file system event touched `target`.
///
/// The local store writes by renaming a temp file over the target, so the
/// watched directory sees create/modify/rename events on the final path.
pub fn event_touches(event: &notify::Event, target: &Path) -> bool {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
            event.paths.iter().any(|p| p.file_name() == target.file_name())
        }
        _ => false,
    }
}

/// Serializes `value` and moves it into place atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    if !dir.exists() {
        debug!("Creating parent directory: {}", dir.display());
        fs::create_dir_all(dir).map_err(|e| {
            error!("Failed to create directory {}: {}", dir.display(), e);
            OmniError::DirectoryError {
                path: dir.to_path_buf(),
            }
        })?;
    }

    let mut temp_file = NamedTempFile::new_in(dir).map_err(|e| {
        error!("Failed to create temporary file: {}", e);
        OmniError::Io(e)
    })?;

    trace!("Serializing {}", path.display());
    let json = serde_json::to_string_pretty(value)?;
    temp_file.write_all(json.as_bytes())?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    temp_file.persist(path).map_err(|e| {
        error!("Failed to persist file {}: {}", path.display(), e.error);
        OmniError::Io(e.error)
    })?;
    Ok(())
}

/// Loads a JSON file, returning `None` when it does not exist.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!("Loading {}", path.display());
    let content = fs::read_to_string(path).map_err(|e| {
        error!("Failed to open {}: {}", path.display(), e);
        OmniError::Io(e)
    })?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Ensures a directory exists, creating it if needed.
pub fn ensure_dir(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        debug!("Directory does not exist, creating: {}", path.display());
        fs::create_dir_all(path).map_err(|e| {
            error!("Failed to create directory {}: {}", path.display(), e);
            OmniError::DirectoryError {
                path: path.to_path_buf(),
            }
        })?;
    }
    Ok(path.to_path_buf())
}

// Helper method for parsing tags
pub fn parse_tags(tags: Option<String>) -> Vec<String> {
    tags.map(|t| normalize_tags(t.split(',').map(str::to_string).collect()))
        .unwrap_or_default()
}

/// Trims, lowercases and de-duplicates tags, keeping first-seen order.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().trim_start_matches('#').to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// Parses a timestamp from the command line.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM` in local time, or a bare date
/// (local midnight).
pub fn parse_datetime(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| OmniError::validation(format!("unrecognized date/time '{}'", input)))?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| OmniError::validation(format!("'{}' does not exist in local time", input)))
}

/// First non-empty line of `content`, cut to `max_len` characters.
pub fn content_preview(content: &str, max_len: usize) -> String {
    let first_line = content
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim();

    if first_line.chars().count() <= max_len {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max_len).collect();
        format!("{}...", cut)
    }
}
