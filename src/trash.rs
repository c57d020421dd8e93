//! Soft-delete lifecycle.
//!
//! An entity is `Live` in its collection until it is trashed. Trashing moves
//! the full record into the trash collection inside one [`WriteBatch`], so
//! the store never holds it in both places or in neither. From there it is
//! either restored (back to `Live` under its original id) or purged.
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    new_id, Collection, DocumentStore, Entity, EntityKind, OmniError, Result, WriteBatch,
};

const DAY_MS: i64 = 86_400_000;

/// Items with at most this many days left are shown as urgent.
pub const URGENT_WITHIN_DAYS: i64 = 7;

/// A trashed entity together with when it was deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrashItem {
    /// Id of the trash record, distinct from the entity's own id.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    /// The entity exactly as it was stored when deleted.
    pub item: Value,
    pub deleted_at: DateTime<Utc>,
}

impl TrashItem {
    pub fn original_id(&self) -> Option<&str> {
        self.item.get("id").and_then(Value::as_str)
    }

    /// Title for display; folders and domains carry a name instead.
    pub fn title(&self) -> &str {
        self.item
            .get("title")
            .or_else(|| self.item.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("(untitled)")
    }

    pub fn decode<T: Entity>(&self) -> Result<T> {
        if self.kind != T::KIND {
            return Err(OmniError::ApplicationError {
                message: format!(
                    "trash item {} holds a {}, not a {}",
                    self.id,
                    self.kind,
                    T::KIND
                ),
            });
        }
        Ok(serde_json::from_value(self.item.clone())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryClass {
    Normal,
    Urgent,
    Expiring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiration {
    pub expires_at: DateTime<Utc>,
    /// Whole days until expiry, rounded up. Zero or negative once expired.
    pub days_left: i64,
    pub class: ExpiryClass,
}

impl Expiration {
    pub fn is_expired(&self) -> bool {
        self.days_left <= 0
    }

    /// Presentational sub-state of a trashed item.
    pub fn is_expiring_soon(&self) -> bool {
        self.class != ExpiryClass::Normal
    }
}

/// When `item` stops being restorable under a retention of `retention_days`.
pub fn compute_expiration(
    item: &TrashItem,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Expiration {
    // saturate instead of overflowing for retention periods past the calendar
    let expires_at = item
        .deleted_at
        .checked_add_signed(Duration::days(i64::from(retention_days)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let remaining_ms = expires_at.signed_duration_since(now).num_milliseconds();

    // ceiling division that stays correct for negative remainders
    let days_left =
        remaining_ms.div_euclid(DAY_MS) + i64::from(remaining_ms.rem_euclid(DAY_MS) > 0);

    let class = if days_left <= 0 {
        ExpiryClass::Expiring
    } else if days_left <= URGENT_WITHIN_DAYS {
        ExpiryClass::Urgent
    } else {
        ExpiryClass::Normal
    };

    Expiration {
        expires_at,
        days_left,
        class,
    }
}

/// Moves entities between their live collection and the trash.
pub struct TrashManager {
    store: Arc<dyn DocumentStore>,
}

impl TrashManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        TrashManager { store }
    }

    /// All trash records, most recently deleted first.
    pub async fn list(&self) -> Result<Vec<TrashItem>> {
        let docs = self.store.list(Collection::Trash).await?;
        let mut items = Vec::with_capacity(docs.len());
        for (id, value) in docs {
            match serde_json::from_value::<TrashItem>(value) {
                Ok(item) => items.push(item),
                Err(e) => error!("Skipping unreadable trash record {}: {}", id, e),
            }
        }
        items.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    pub async fn get(&self, trash_id: &str) -> Result<TrashItem> {
        match self.store.get(Collection::Trash, trash_id).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(OmniError::not_found("trash item", trash_id)),
        }
    }

    /// Removes an entity from its live collection and records it in trash.
    pub async fn soft_delete(
        &self,
        kind: EntityKind,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<TrashItem> {
        let collection = Collection::for_kind(kind);
        let item = match self.store.get(collection, id).await? {
            Some(value) => value,
            None => {
                error!("Cannot delete {} {}: not found", kind, id);
                return Err(OmniError::not_found(kind.label(), id));
            }
        };

        let record = TrashItem {
            id: new_id(),
            kind,
            item,
            deleted_at: now,
        };

        // a concurrent delete of the same id loses here instead of trashing twice
        let batch = WriteBatch::new()
            .require(collection, id)
            .delete(collection, id)
            .put(Collection::Trash, record.id.clone(), serde_json::to_value(&record)?);
        self.store.apply(batch).await?;

        info!("Moved {} {} to trash as {}", kind, id, record.id);
        Ok(record)
    }

    /// Puts the wrapped entity back under its original id and drops the
    /// trash record. An entity already live under that id is overwritten.
    pub async fn restore(&self, trash_id: &str) -> Result<TrashItem> {
        let record = self.get(trash_id).await?;
        let original_id = record.original_id().ok_or_else(|| OmniError::RestoreFailed {
            message: format!("trash item {} has no original id", trash_id),
        })?;

        let collection = Collection::for_kind(record.kind);
        if self.store.get(collection, original_id).await?.is_some() {
            debug!(
                "{} {} is live again; restore overwrites it",
                record.kind, original_id
            );
        }

        let batch = WriteBatch::new()
            .require(Collection::Trash, trash_id)
            .put(collection, original_id, record.item.clone())
            .delete(Collection::Trash, trash_id);
        self.store.apply(batch).await?;

        info!("Restored {} {} from trash", record.kind, original_id);
        Ok(record)
    }

    /// Deletes a trash record for good.
    pub async fn purge(&self, trash_id: &str) -> Result<()> {
        if self.store.get(Collection::Trash, trash_id).await?.is_none() {
            return Err(OmniError::not_found("trash item", trash_id));
        }
        self.store
            .apply(
                WriteBatch::new()
                    .require(Collection::Trash, trash_id)
                    .delete(Collection::Trash, trash_id),
            )
            .await?;
        info!("Purged trash item {}", trash_id);
        Ok(())
    }

    /// Purges every trash record. Live collections are untouched.
    pub async fn empty(&self) -> Result<usize> {
        let count = self.store.list(Collection::Trash).await?.len();
        if count > 0 {
            self.store
                .apply(WriteBatch::new().clear(Collection::Trash))
                .await?;
        }
        info!("Emptied trash ({} items)", count);
        Ok(count)
    }

    /// Purges every record whose retention has run out.
    pub async fn sweep_expired(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrashItem>> {
        let expired: Vec<TrashItem> = self
            .list()
            .await?
            .into_iter()
            .filter(|item| compute_expiration(item, retention_days, now).is_expired())
            .collect();

        if expired.is_empty() {
            debug!("Trash sweep: nothing expired");
            return Ok(expired);
        }

        let batch = expired.iter().fold(WriteBatch::new(), |batch, item| {
            batch.delete(Collection::Trash, item.id.clone())
        });
        self.store.apply(batch).await?;

        info!(
            "Trash sweep purged {} items older than {} days",
            expired.len(),
            retention_days
        );
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalStore;
    use serde_json::json;

    fn item_deleted_at(deleted_at: DateTime<Utc>) -> TrashItem {
        TrashItem {
            id: "trash-1".into(),
            kind: EntityKind::Task,
            item: json!({"id": "task-1", "title": "Call plumber"}),
            deleted_at,
        }
    }

    #[test]
    fn expiration_classifies_by_days_left() {
        let t0 = Utc::now();
        let item = item_deleted_at(t0);

        let at_25 = compute_expiration(&item, 30, t0 + Duration::days(25));
        assert_eq!(at_25.days_left, 5);
        assert_eq!(at_25.class, ExpiryClass::Urgent);

        let at_31 = compute_expiration(&item, 30, t0 + Duration::days(31));
        assert!(at_31.days_left <= 0);
        assert_eq!(at_31.class, ExpiryClass::Expiring);

        let fresh = compute_expiration(&item, 30, t0);
        assert_eq!(fresh.days_left, 30);
        assert_eq!(fresh.class, ExpiryClass::Normal);
        assert_eq!(fresh.expires_at, t0 + Duration::days(30));
    }

    #[test]
    fn partial_days_round_up() {
        let t0 = Utc::now();
        let item = item_deleted_at(t0);
        let e = compute_expiration(&item, 1, t0 + Duration::hours(1));
        assert_eq!(e.days_left, 1);
        let e = compute_expiration(&item, 1, t0 + Duration::hours(25));
        assert_eq!(e.days_left, 0);
        assert!(e.is_expired());
    }

    #[test]
    fn huge_retention_saturates() {
        let t0 = Utc::now();
        let item = item_deleted_at(t0);
        let e = compute_expiration(&item, u32::MAX, t0);
        assert_eq!(e.expires_at, DateTime::<Utc>::MAX_UTC);
        assert_eq!(e.class, ExpiryClass::Normal);
        assert!(e.days_left > 0);
    }

    #[test]
    fn days_left_never_increases_over_time() {
        let t0 = Utc::now();
        let item = item_deleted_at(t0);
        let mut previous = i64::MAX;
        for hours in (0..24 * 40).step_by(7) {
            let e = compute_expiration(&item, 30, t0 + Duration::hours(hours));
            assert!(e.days_left <= previous);
            previous = e.days_left;
        }
    }

    #[test]
    fn trash_item_serializes_with_type_tag() {
        let item = item_deleted_at(Utc::now());
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "task");
        assert!(value.get("deletedAt").is_some());
        assert_eq!(item.title(), "Call plumber");
        assert_eq!(item.original_id(), Some("task-1"));
    }

    async fn manager() -> (tempfile::TempDir, Arc<dyn DocumentStore>, TrashManager) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(LocalStore::open(dir.path()).unwrap());
        let trash = TrashManager::new(Arc::clone(&store));
        (dir, store, trash)
    }

    #[tokio::test]
    async fn soft_delete_then_restore_returns_same_document() {
        let (_dir, store, trash) = manager().await;
        let doc = json!({"id": "idea-1", "title": "Balcony garden", "notes": []});
        store
            .apply(WriteBatch::new().put(Collection::Ideas, "idea-1", doc.clone()))
            .await
            .unwrap();

        let record = trash
            .soft_delete(EntityKind::Idea, "idea-1", Utc::now())
            .await
            .unwrap();
        assert_ne!(record.id, "idea-1");
        assert!(store.get(Collection::Ideas, "idea-1").await.unwrap().is_none());
        assert_eq!(trash.list().await.unwrap().len(), 1);

        trash.restore(&record.id).await.unwrap();
        assert_eq!(
            store.get(Collection::Ideas, "idea-1").await.unwrap(),
            Some(doc)
        );
        assert!(trash.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_ids_report_not_found() {
        let (_dir, _store, trash) = manager().await;
        let err = trash
            .soft_delete(EntityKind::Task, "ghost", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, OmniError::NotFound { .. }));
        assert!(matches!(
            trash.restore("ghost").await,
            Err(OmniError::NotFound { .. })
        ));
        assert!(matches!(
            trash.purge("ghost").await,
            Err(OmniError::NotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deletes_trash_once() {
        let (_dir, store, trash) = manager().await;
        store
            .apply(WriteBatch::new().put(Collection::Tasks, "t1", json!({"id": "t1"})))
            .await
            .unwrap();

        let trash = Arc::new(trash);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let trash = Arc::clone(&trash);
                tokio::spawn(async move {
                    trash.soft_delete(EntityKind::Task, "t1", Utc::now()).await
                })
            })
            .collect();

        let mut deleted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => deleted += 1,
                Err(e) => assert!(matches!(e, OmniError::NotFound { .. })),
            }
        }
        assert_eq!(deleted, 1);
        assert_eq!(trash.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_read_cannot_trash_a_missing_entity() {
        let (_dir, store, trash) = manager().await;
        // what a second deleter would send after the first one already won
        let batch = WriteBatch::new()
            .require(Collection::Tasks, "t1")
            .delete(Collection::Tasks, "t1")
            .put(Collection::Trash, "dup", json!({"id": "dup"}));
        assert!(matches!(
            store.apply(batch).await,
            Err(OmniError::NotFound { .. })
        ));
        assert!(store.list(Collection::Trash).await.unwrap().is_empty());
        assert!(trash.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_purges_only_expired_items() {
        let (_dir, store, trash) = manager().await;
        let now = Utc::now();
        for (id, age_days) in [("old", 40), ("recent", 3)] {
            let record = TrashItem {
                id: id.into(),
                kind: EntityKind::Task,
                item: json!({"id": format!("task-{}", id), "title": id}),
                deleted_at: now - Duration::days(age_days),
            };
            store
                .apply(WriteBatch::new().put(
                    Collection::Trash,
                    id,
                    serde_json::to_value(&record).unwrap(),
                ))
                .await
                .unwrap();
        }

        let purged = trash.sweep_expired(30, now).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].id, "old");
        let left: Vec<String> = trash.list().await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(left, vec!["recent".to_string()]);
    }
}
