//! The persistence boundary: an opaque document store holding JSON records
//! grouped in named collections.
//!
//! Backends only know about collections, ids and JSON values. Typing,
//! validation and the trash redirection live one layer up in
//! [`crate::Storage`].
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    BackendConfig, Config, EntityKind, LocalStore, OmniError, RemoteStore, Result, Subscription,
    SyncStatusReporter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Domains,
    Tasks,
    Ideas,
    IdeaFolders,
    CalendarEvents,
    Settings,
    Trash,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Domains,
        Collection::Tasks,
        Collection::Ideas,
        Collection::IdeaFolders,
        Collection::CalendarEvents,
        Collection::Settings,
        Collection::Trash,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Domains => "domains",
            Self::Tasks => "tasks",
            Self::Ideas => "ideas",
            Self::IdeaFolders => "ideaFolders",
            Self::CalendarEvents => "calendarEvents",
            Self::Settings => "settings",
            Self::Trash => "trash",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// The live collection holding entities of `kind`.
    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Domain => Self::Domains,
            EntityKind::Task => Self::Tasks,
            EntityKind::Idea => Self::Ideas,
            EntityKind::IdeaFolder => Self::IdeaFolders,
            EntityKind::CalendarEvent => Self::CalendarEvents,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Documents of one collection keyed by id.
pub type Documents = BTreeMap<String, Value>;

/// Every collection of a store.
pub type StoreSnapshot = BTreeMap<Collection, Documents>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WriteOp {
    Put {
        collection: Collection,
        id: String,
        value: Value,
    },
    Delete {
        collection: Collection,
        id: String,
    },
    Clear {
        collection: Collection,
    },
}

impl WriteOp {
    pub fn collection(&self) -> Collection {
        match self {
            WriteOp::Put { collection, .. }
            | WriteOp::Delete { collection, .. }
            | WriteOp::Clear { collection } => *collection,
        }
    }
}

/// A document addressed by collection and id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRef {
    pub collection: Collection,
    pub id: String,
}

/// A group of writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
    /// Documents that must exist when the batch is applied, or it is refused.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<DocRef>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, collection: Collection, id: impl Into<String>, value: Value) -> Self {
        self.ops.push(WriteOp::Put {
            collection,
            id: id.into(),
            value,
        });
        self
    }

    pub fn delete(mut self, collection: Collection, id: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete {
            collection,
            id: id.into(),
        });
        self
    }

    pub fn clear(mut self, collection: Collection) -> Self {
        self.ops.push(WriteOp::Clear { collection });
        self
    }

    pub fn require(mut self, collection: Collection, id: impl Into<String>) -> Self {
        self.requires.push(DocRef {
            collection,
            id: id.into(),
        });
        self
    }

    /// Fails with `NotFound` when a required document is absent from
    /// `snapshot`. Backends call this under the same lock that applies the
    /// batch, so two writers cannot both pass it for the same document.
    pub fn check(&self, snapshot: &StoreSnapshot) -> Result<()> {
        for doc in &self.requires {
            let present = snapshot
                .get(&doc.collection)
                .is_some_and(|docs| docs.contains_key(&doc.id));
            if !present {
                return Err(OmniError::not_found(doc.collection.name(), doc.id.clone()));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn touched(&self) -> BTreeSet<Collection> {
        self.ops.iter().map(WriteOp::collection).collect()
    }

    /// Applies the ops in order. Deleting an absent id is a no-op; a put over
    /// an existing id replaces it.
    pub fn apply_to(&self, snapshot: &mut StoreSnapshot) {
        for op in &self.ops {
            match op {
                WriteOp::Put {
                    collection,
                    id,
                    value,
                } => {
                    snapshot
                        .entry(*collection)
                        .or_default()
                        .insert(id.clone(), value.clone());
                }
                WriteOp::Delete { collection, id } => {
                    if let Some(docs) = snapshot.get_mut(collection) {
                        docs.remove(id);
                    }
                }
                WriteOp::Clear { collection } => {
                    snapshot.remove(collection);
                }
            }
        }
    }
}

/// Collections whose contents differ between two snapshots.
pub fn changed_collections(before: &StoreSnapshot, after: &StoreSnapshot) -> BTreeSet<Collection> {
    let empty = Documents::new();
    Collection::ALL
        .into_iter()
        .filter(|c| before.get(c).unwrap_or(&empty) != after.get(c).unwrap_or(&empty))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Remote => f.write_str("remote"),
        }
    }
}

/// Callback receiving the collection that changed.
pub type ChangeListener = Box<dyn Fn(&Collection) + Send + Sync>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> BackendKind;

    async fn list(&self, collection: Collection) -> Result<Documents>;

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>>;

    /// Applies every op of `batch` or none of them. Returns once the batch is
    /// durable (local) or durably queued (remote).
    async fn apply(&self, batch: WriteBatch) -> Result<()>;

    async fn snapshot(&self) -> Result<StoreSnapshot>;

    /// Push notification of changed collections. Backends without push
    /// support return `None` and callers poll by re-listing.
    fn subscribe(&self, _listener: ChangeListener) -> Option<Subscription> {
        None
    }

    /// Whether the authoritative copy can be reached right now. Stores that
    /// are their own authority are always reachable.
    async fn check_connection(&self) -> bool {
        true
    }

    /// Reconciles with the authoritative copy, if there is one.
    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Releases watchers and flushes anything buffered.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens the backend named by the configuration. Called once at startup.
pub async fn open_store(
    config: &Config,
    status: Arc<SyncStatusReporter>,
) -> Result<Arc<dyn DocumentStore>> {
    match &config.backend {
        BackendConfig::Local => {
            info!("Opening local store in {}", config.data_dir.display());
            let store = LocalStore::open(&config.data_dir)?;
            if let Err(e) = store.watch() {
                log::warn!("Local store change watching disabled: {}", e);
            }
            Ok(Arc::new(store))
        }
        BackendConfig::Remote { url, token } => {
            info!("Opening remote store at {}", url);
            let store = RemoteStore::connect(
                url,
                token.clone(),
                &config.data_dir,
                config.request_timeout(),
                status,
            )
            .await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_applies_in_order() {
        let mut snapshot = StoreSnapshot::new();
        WriteBatch::new()
            .put(Collection::Tasks, "a", json!({"id": "a"}))
            .put(Collection::Tasks, "b", json!({"id": "b"}))
            .delete(Collection::Tasks, "a")
            .delete(Collection::Ideas, "missing")
            .apply_to(&mut snapshot);

        let tasks = &snapshot[&Collection::Tasks];
        assert_eq!(tasks.len(), 1);
        assert!(tasks.contains_key("b"));
        assert!(!snapshot.contains_key(&Collection::Ideas));
    }

    #[test]
    fn clear_drops_whole_collection() {
        let mut snapshot = StoreSnapshot::new();
        let batch = WriteBatch::new()
            .put(Collection::Trash, "x", json!({}))
            .put(Collection::Tasks, "t", json!({}))
            .clear(Collection::Trash);
        batch.apply_to(&mut snapshot);
        assert!(!snapshot.contains_key(&Collection::Trash));
        assert_eq!(
            batch.touched(),
            [Collection::Tasks, Collection::Trash].into_iter().collect()
        );
    }

    #[test]
    fn requirements_must_be_present() {
        let mut snapshot = StoreSnapshot::new();
        let batch = WriteBatch::new()
            .require(Collection::Tasks, "t")
            .delete(Collection::Tasks, "t");
        assert!(matches!(batch.check(&snapshot), Err(OmniError::NotFound { .. })));

        WriteBatch::new()
            .put(Collection::Tasks, "t", json!({}))
            .apply_to(&mut snapshot);
        assert!(batch.check(&snapshot).is_ok());
    }

    #[test]
    fn empty_and_missing_collections_compare_equal() {
        let mut a = StoreSnapshot::new();
        a.insert(Collection::Ideas, Documents::new());
        let mut b = StoreSnapshot::new();
        b.entry(Collection::Tasks)
            .or_default()
            .insert("t".into(), json!(1));
        let changed = changed_collections(&a, &b);
        assert_eq!(changed, [Collection::Tasks].into_iter().collect());
    }

    #[test]
    fn collection_names_round_trip() {
        for c in Collection::ALL {
            assert_eq!(Collection::from_name(c.name()), Some(c));
        }
        assert_eq!(
            serde_json::to_value(Collection::CalendarEvents).unwrap(),
            json!("calendarEvents")
        );
    }
}
