use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;

use crate::{
    changed_collections, ensure_dir, event_touches, read_json_file, write_json_atomic,
    BackendKind, ChangeListener, Collection, DocumentStore, Documents, Listeners, OmniError,
    Result, StoreSnapshot, Subscription, WriteBatch,
};

const STORE_FILE: &str = "omnidesk.json";
const STORE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    collections: StoreSnapshot,
}

/// Local-persistence backend.
///
/// All collections live in one JSON file that is replaced atomically on
/// every write, so a batch either lands completely or not at all. An
/// in-memory copy serves reads.
pub struct LocalStore {
    /// Path of the store file
    path: PathBuf,

    /// In-memory copy of the store file
    cache: Arc<Mutex<StoreSnapshot>>,

    /// Serializes writers so each batch sees the previous one's result
    write_lock: TokioMutex<()>,

    /// Callbacks notified with each changed collection
    listeners: Arc<Listeners<Collection>>,

    /// File system watcher picking up edits made by other processes
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl LocalStore {
    /// Opens (or creates) the store in `data_dir` and loads it into memory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        ensure_dir(data_dir)?;
        let path = data_dir.join(STORE_FILE);

        let collections = match read_json_file::<StoreFile>(&path)? {
            Some(file) => {
                if file.version > STORE_VERSION {
                    warn!(
                        "Store file {} has version {}, newer than supported {}",
                        path.display(),
                        file.version,
                        STORE_VERSION
                    );
                }
                file.collections
            }
            None => {
                info!("No store file at {}, starting empty", path.display());
                StoreSnapshot::new()
            }
        };

        let documents: usize = collections.values().map(|docs| docs.len()).sum();
        info!(
            "Loaded local store {} ({} documents)",
            path.display(),
            documents
        );

        Ok(LocalStore {
            path,
            cache: Arc::new(Mutex::new(collections)),
            write_lock: TokioMutex::new(()),
            listeners: Arc::new(Listeners::new()),
            watcher: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_cache(&self) -> Result<StoreSnapshot> {
        self.cache
            .lock()
            .map(|cache| cache.clone())
            .map_err(|_| OmniError::LockAcquisitionFailed {
                message: "Failed to acquire lock on store cache".to_string(),
            })
    }

    fn persist(&self, collections: &StoreSnapshot) -> Result<()> {
        let file = StoreFile {
            version: STORE_VERSION,
            collections: collections.clone(),
        };
        write_json_atomic(&self.path, &file)
    }

    /// Starts watching the store file for changes made outside this process.
    ///
    /// When the file changes the cache is reloaded and subscribers are told
    /// which collections differ.
    pub fn watch(&self) -> Result<()> {
        let mut slot = self
            .watcher
            .lock()
            .map_err(|_| OmniError::LockAcquisitionFailed {
                message: "Failed to acquire lock on store watcher".to_string(),
            })?;
        if slot.is_some() {
            debug!("File system watcher already initialized");
            return Ok(());
        }

        let path = self.path.clone();
        let cache = Arc::clone(&self.cache);
        let listeners = Arc::clone(&self.listeners);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if event_touches(&event, &path) => {
                    reload_from_disk(&path, &cache, &listeners);
                }
                Ok(_) => {}
                Err(e) => warn!("Watch error on {}: {}", path.display(), e),
            }
        })
        .map_err(|e| OmniError::ApplicationError {
            message: format!("Failed to create file watcher: {}", e),
        })?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| OmniError::ApplicationError {
                message: format!("Failed to watch {}: {}", dir.display(), e),
            })?;

        info!("Watching {} for external changes", self.path.display());
        *slot = Some(watcher);
        Ok(())
    }
}

fn reload_from_disk(
    path: &Path,
    cache: &Arc<Mutex<StoreSnapshot>>,
    listeners: &Arc<Listeners<Collection>>,
) {
    let file = match read_json_file::<StoreFile>(path) {
        Ok(Some(file)) => file,
        Ok(None) => return,
        Err(e) => {
            error!("Failed to reload store from {}: {}", path.display(), e);
            return;
        }
    };

    let changed = match cache.lock() {
        Ok(mut current) => {
            let changed = changed_collections(&current, &file.collections);
            if !changed.is_empty() {
                *current = file.collections;
            }
            changed
        }
        Err(e) => {
            warn!("Failed to acquire lock for cache reload: {}", e);
            return;
        }
    };

    for collection in changed {
        debug!("External change to {}", collection);
        listeners.emit(&collection);
    }
}

#[async_trait]
impl DocumentStore for LocalStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn list(&self, collection: Collection) -> Result<Documents> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| OmniError::LockAcquisitionFailed {
                message: "Failed to acquire lock on store cache".to_string(),
            })?;
        Ok(cache.get(&collection).cloned().unwrap_or_default())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| OmniError::LockAcquisitionFailed {
                message: "Failed to acquire lock on store cache".to_string(),
            })?;
        Ok(cache.get(&collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        let mut next = self.read_cache()?;
        batch.check(&next)?;
        batch.apply_to(&mut next);

        // the file is the commit point; the cache follows only after it lands
        self.persist(&next)?;

        match self.cache.lock() {
            Ok(mut cache) => *cache = next,
            Err(e) => {
                warn!("Failed to acquire lock for cache update: {}", e);
                return Err(OmniError::LockAcquisitionFailed {
                    message: "store file written but cache not updated".to_string(),
                });
            }
        }
        trace!("Applied batch of {} ops", batch.len());

        for collection in batch.touched() {
            self.listeners.emit(&collection);
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<StoreSnapshot> {
        self.read_cache()
    }

    fn subscribe(&self, listener: ChangeListener) -> Option<Subscription> {
        Some(self.listeners.subscribe(listener))
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut slot) = self.watcher.lock() {
            if slot.take().is_some() {
                info!("File system watcher stopped");
            }
        }
        self.listeners.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store
            .apply(
                WriteBatch::new()
                    .put(Collection::Tasks, "t1", json!({"id": "t1", "title": "A"}))
                    .put(Collection::Trash, "x1", json!({"id": "x1"})),
            )
            .await
            .unwrap();
        drop(store);

        let reopened = LocalStore::open(dir.path()).unwrap();
        let tasks = reopened.list(Collection::Tasks).await.unwrap();
        assert_eq!(tasks["t1"]["title"], "A");
        assert!(reopened.get(Collection::Trash, "x1").await.unwrap().is_some());
        assert!(reopened.get(Collection::Ideas, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subscribers_hear_touched_collections() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = store
            .subscribe(Box::new(move |c| {
                if *c == Collection::Ideas {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .expect("local store supports subscriptions");

        store
            .apply(WriteBatch::new().put(Collection::Ideas, "i", json!({})))
            .await
            .unwrap();
        store
            .apply(WriteBatch::new().put(Collection::Tasks, "t", json!({})))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        store
            .apply(WriteBatch::new().delete(Collection::Ideas, "i"))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reload_picks_up_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let mut external = StoreSnapshot::new();
        external
            .entry(Collection::Domains)
            .or_default()
            .insert("d1".into(), json!({"id": "d1"}));
        write_json_atomic(
            store.path(),
            &StoreFile {
                version: STORE_VERSION,
                collections: external,
            },
        )
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store.subscribe(Box::new(move |c| sink.lock().unwrap().push(*c)));

        reload_from_disk(store.path(), &store.cache, &store.listeners);
        assert!(store.get(Collection::Domains, "d1").await.unwrap().is_some());
        assert_eq!(*seen.lock().unwrap(), vec![Collection::Domains]);
    }
}
