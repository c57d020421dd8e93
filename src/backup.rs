//! Zip backups of every collection.
//!
//! Each document is stored as `{collection}/{id}.json`, so an archive can be
//! inspected or partially restored by hand.
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use walkdir::WalkDir;
use zip::{write::SimpleFileOptions, ZipArchive, ZipWriter};

use crate::{
    ensure_dir, Collection, DocumentStore, OmniError, RestoreBackupSummary, Result, WriteBatch,
};

const BACKUP_PREFIX: &str = "omnidesk_backup_";

#[derive(Debug, Eq)]
struct BackupFile {
    path: PathBuf,
    modified_time: SystemTime,
}

impl PartialEq for BackupFile {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for BackupFile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BackupFile {
    // newer files are "greater"; names embed the timestamp and break ties
    fn cmp(&self, other: &Self) -> Ordering {
        self.modified_time
            .cmp(&other.modified_time)
            .then_with(|| self.path.cmp(&other.path))
    }
}

fn is_backup_file(path: &Path) -> bool {
    path.is_file()
        && path.extension().is_some_and(|ext| ext == "zip")
        && path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(BACKUP_PREFIX))
}

fn backup_files(backup_dir: &Path) -> Vec<BackupFile> {
    WalkDir::new(backup_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_backup_file(entry.path()))
        .filter_map(|entry| {
            let modified_time = entry.metadata().ok()?.modified().ok()?;
            Some(BackupFile {
                path: entry.path().to_path_buf(),
                modified_time,
            })
        })
        .collect()
}

fn next_backup_path(backup_dir: &Path) -> PathBuf {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
    let mut path = backup_dir.join(format!("{}{}.zip", BACKUP_PREFIX, timestamp));
    let mut n = 1;
    while path.exists() {
        path = backup_dir.join(format!("{}{}_{}.zip", BACKUP_PREFIX, timestamp, n));
        n += 1;
    }
    path
}

/// Writes every document of the store into a new archive in `backup_dir`,
/// then prunes old archives beyond `max_backups`.
pub async fn create_backup(
    store: &dyn DocumentStore,
    backup_dir: &Path,
    max_backups: u32,
) -> Result<PathBuf> {
    ensure_dir(backup_dir).map_err(|e| OmniError::BackupFailed {
        message: e.to_string(),
    })?;
    let snapshot = store.snapshot().await?;

    let backup_path = next_backup_path(backup_dir);
    let file = File::create(&backup_path).map_err(|e| OmniError::BackupFailed {
        message: e.to_string(),
    })?;
    let mut zip = ZipWriter::new(file);

    let mut count = 0;
    for (collection, documents) in &snapshot {
        for (id, document) in documents {
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .unix_permissions(0o644);
            let json = serde_json::to_string_pretty(document)?;
            zip.start_file(format!("{}/{}.json", collection.name(), id), options)?;
            zip.write_all(json.as_bytes())
                .map_err(|e| OmniError::BackupFailed {
                    message: format!("Failed to write {} {} to backup: {}", collection, id, e),
                })?;
            count += 1;
        }
    }
    zip.finish()?;

    cleanup_old_backups(backup_dir, max_backups)?;

    info!(
        "Backup created with {} documents at {}",
        count,
        backup_path.display()
    );
    Ok(backup_path)
}

/// Removes the oldest archives so at most `max_backups` remain. Zero keeps
/// everything. Returns how many were removed.
pub fn cleanup_old_backups(backup_dir: &Path, max_backups: u32) -> Result<usize> {
    if max_backups == 0 {
        return Ok(0);
    }

    // min-heap: the oldest kept archive sits on top
    let mut newest: BinaryHeap<Reverse<BackupFile>> =
        BinaryHeap::with_capacity(max_backups as usize + 1);
    let mut removed = 0;

    for backup in backup_files(backup_dir) {
        newest.push(Reverse(backup));
        if newest.len() > max_backups as usize {
            if let Some(Reverse(oldest)) = newest.pop() {
                match fs::remove_file(&oldest.path) {
                    Ok(_) => {
                        debug!("Removed old backup: {}", oldest.path.display());
                        removed += 1;
                    }
                    Err(e) => {
                        warn!(
                            "Failed to remove old backup {}: {}",
                            oldest.path.display(),
                            e
                        );
                    }
                }
            }
        }
    }

    if removed > 0 {
        debug!(
            "Cleanup complete: kept {} backups, removed {}",
            newest.len(),
            removed
        );
    }
    Ok(removed)
}

/// Archives in `backup_dir`, newest first.
pub fn list_backups(backup_dir: &Path) -> Vec<PathBuf> {
    let mut files = backup_files(backup_dir);
    files.sort_by(|a, b| b.cmp(a));
    files.into_iter().map(|f| f.path).collect()
}

fn parse_entry_name(name: &str) -> Option<(Collection, String)> {
    let (collection, file) = name.split_once('/')?;
    let id = file.strip_suffix(".json")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some((Collection::from_name(collection)?, id.to_string()))
}

/// Reads an archive back into the store as one batch.
///
/// Without `overwrite`, documents whose id already exists are left alone.
pub async fn restore_backup(
    store: &dyn DocumentStore,
    backup_path: &Path,
    overwrite: bool,
) -> Result<RestoreBackupSummary> {
    if !backup_path.is_file() {
        return Err(OmniError::RestoreFailed {
            message: format!("Backup file not found: {}", backup_path.display()),
        });
    }
    if backup_path.extension().map_or(true, |ext| ext != "zip") {
        return Err(OmniError::RestoreFailed {
            message: format!("Not a valid ZIP file: {}", backup_path.display()),
        });
    }

    let file = File::open(backup_path).map_err(|e| OmniError::RestoreFailed {
        message: format!("Failed to open backup file: {}", e),
    })?;
    let mut archive = ZipArchive::new(file)?;
    let current = store.snapshot().await?;

    let mut summary = RestoreBackupSummary {
        backup_file: backup_path.to_path_buf(),
        ..Default::default()
    };
    let mut batch = WriteBatch::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let Some((collection, id)) = parse_entry_name(&name) else {
            debug!("Skipping unrelated archive entry {}", name);
            continue;
        };
        summary.total_documents += 1;

        let exists = current
            .get(&collection)
            .is_some_and(|docs| docs.contains_key(&id));
        if exists && !overwrite {
            summary.documents_skipped += 1;
            continue;
        }

        let mut content = String::new();
        if let Err(e) = entry.read_to_string(&mut content) {
            warn!("Failed to read {} from backup: {}", name, e);
            summary.failed_documents.push((name, e.to_string()));
            continue;
        }
        match serde_json::from_str::<Value>(&content) {
            Ok(document) => {
                batch = batch.put(collection, id, document);
                summary.documents_restored += 1;
            }
            Err(e) => {
                warn!("Invalid JSON in {}: {}", name, e);
                summary.failed_documents.push((name, e.to_string()));
            }
        }
    }

    store.apply(batch).await?;

    info!(
        "Backup restoration complete: restored {}, skipped {}, failed {} documents from {}",
        summary.documents_restored,
        summary.documents_skipped,
        summary.failed_documents.len(),
        backup_path.display()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalStore;
    use serde_json::json;

    async fn seeded_store(dir: &Path) -> LocalStore {
        let store = LocalStore::open(dir).unwrap();
        store
            .apply(
                WriteBatch::new()
                    .put(Collection::Tasks, "t1", json!({"id": "t1", "title": "A"}))
                    .put(Collection::Ideas, "i1", json!({"id": "i1", "title": "B"}))
                    .put(Collection::Settings, "app", json!({"trashRetentionDays": 14})),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn backup_restores_into_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_store(&dir.path().join("a")).await;
        let backups = dir.path().join("backups");
        let archive = create_backup(&source, &backups, 5).await.unwrap();
        assert_eq!(list_backups(&backups), vec![archive.clone()]);

        let target = LocalStore::open(&dir.path().join("b")).unwrap();
        let summary = restore_backup(&target, &archive, false).await.unwrap();
        assert_eq!(summary.total_documents, 3);
        assert_eq!(summary.documents_restored, 3);
        assert_eq!(
            target.snapshot().await.unwrap(),
            source.snapshot().await.unwrap()
        );
    }

    #[tokio::test]
    async fn existing_documents_kept_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        let backups = dir.path().join("backups");
        let archive = create_backup(&store, &backups, 5).await.unwrap();

        store
            .apply(WriteBatch::new().put(
                Collection::Tasks,
                "t1",
                json!({"id": "t1", "title": "Edited"}),
            ))
            .await
            .unwrap();

        let summary = restore_backup(&store, &archive, false).await.unwrap();
        assert_eq!(summary.documents_skipped, 3);
        let task = store.get(Collection::Tasks, "t1").await.unwrap().unwrap();
        assert_eq!(task["title"], "Edited");

        restore_backup(&store, &archive, true).await.unwrap();
        let task = store.get(Collection::Tasks, "t1").await.unwrap().unwrap();
        assert_eq!(task["title"], "A");
    }

    #[tokio::test]
    async fn old_backups_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        let backups = dir.path().join("backups");
        for _ in 0..4 {
            create_backup(&store, &backups, 2).await.unwrap();
        }
        assert_eq!(list_backups(&backups).len(), 2);
    }

    #[tokio::test]
    async fn rejects_missing_or_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let missing = restore_backup(&store, &dir.path().join("nope.zip"), false).await;
        assert!(matches!(missing, Err(OmniError::RestoreFailed { .. })));

        let text = dir.path().join("notes.txt");
        fs::write(&text, "hi").unwrap();
        assert!(restore_backup(&store, &text, false).await.is_err());
    }

    #[test]
    fn entry_names() {
        assert_eq!(
            parse_entry_name("calendarEvents/e1.json"),
            Some((Collection::CalendarEvents, "e1".to_string()))
        );
        assert_eq!(parse_entry_name("unknown/e1.json"), None);
        assert_eq!(parse_entry_name("tasks/.json"), None);
        assert_eq!(parse_entry_name("tasks/t1.txt"), None);
    }
}
