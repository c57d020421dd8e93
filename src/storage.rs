use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::{
    new_id, AppSettings, BackendKind, ChangeListener, Collection, DocumentStore, Entity,
    EntityKind, Idea, NewTask, OmniError, Result, SettingsPatch, Subscription, Task, TrashItem,
    TrashManager, WriteBatch,
};

const SETTINGS_KEY: &str = "app";

/// The typed storage interface over whichever backend was opened at startup.
///
/// This is where ids and timestamps are generated, partial updates are
/// merged, payloads are validated, and deletes are redirected to the trash.
pub struct Storage {
    store: Arc<dyn DocumentStore>,
    trash: TrashManager,
}

impl Storage {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let trash = TrashManager::new(Arc::clone(&store));
        Storage { store, trash }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn backend(&self) -> BackendKind {
        self.store.backend()
    }

    pub fn trash(&self) -> &TrashManager {
        &self.trash
    }

    /// All live entities of one kind, oldest first.
    pub async fn list<T: Entity>(&self) -> Result<Vec<T>> {
        let collection = Collection::for_kind(T::KIND);
        let docs = self.store.list(collection).await?;

        let mut load_errors = 0;
        let mut items: Vec<T> = Vec::with_capacity(docs.len());
        for (id, value) in docs {
            match serde_json::from_value::<T>(value) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!("Failed to decode {} {}: {}", T::KIND, id, e);
                    load_errors += 1;
                }
            }
        }
        if load_errors > 0 {
            error!(
                "Encountered {} unreadable documents in {}",
                load_errors, collection
            );
        }

        items.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(items)
    }

    pub async fn get<T: Entity>(&self, id: &str) -> Result<T> {
        match self.store.get(Collection::for_kind(T::KIND), id).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(OmniError::not_found(T::KIND.label(), id)),
        }
    }

    async fn exists(&self, kind: EntityKind, id: &str) -> Result<bool> {
        Ok(self
            .store
            .get(Collection::for_kind(kind), id)
            .await?
            .is_some())
    }

    /// Field checks plus existence of every reference not already present in
    /// `previous`. References that were valid when written are not re-checked,
    /// so an entity pointing at a trashed record can still be edited.
    async fn check<T: Entity>(&self, entity: &T, previous: Option<&T>) -> Result<()> {
        entity.validate()?;
        let known = previous.map(|p| p.references()).unwrap_or_default();
        for (kind, id) in entity.references() {
            if known.contains(&(kind, id)) {
                continue;
            }
            if !self.exists(kind, id).await? {
                return Err(OmniError::validation(format!(
                    "{} {} referenced by {} {} does not exist",
                    kind,
                    id,
                    T::KIND,
                    entity.id()
                )));
            }
        }
        Ok(())
    }

    async fn put<T: Entity>(&self, entity: &T) -> Result<()> {
        let batch = WriteBatch::new().put(
            Collection::for_kind(T::KIND),
            entity.id(),
            serde_json::to_value(entity)?,
        );
        self.store.apply(batch).await
    }

    /// Creates an entity from `draft` with a fresh id and timestamps.
    pub async fn add<T: Entity>(&self, draft: T::Draft) -> Result<T> {
        let entity = T::from_draft(new_id(), Utc::now(), draft);
        self.check(&entity, None).await?;
        self.put(&entity).await?;
        info!("Added {} {}", T::KIND, entity.id());
        Ok(entity)
    }

    /// Merges `patch` into the stored entity.
    pub async fn update<T: Entity>(&self, id: &str, patch: T::Patch) -> Result<T> {
        let current: T = self.get(id).await.map_err(|e| {
            error!("Cannot update {} {}: {}", T::KIND, id, e);
            e
        })?;
        let mut updated = current.clone();
        updated.apply_patch(patch, Utc::now())?;
        self.check(&updated, Some(&current)).await?;
        self.put(&updated).await?;
        debug!("Updated {} {}", T::KIND, id);
        Ok(updated)
    }

    /// Moves the entity to trash. Nothing is erased.
    pub async fn delete<T: Entity>(&self, id: &str) -> Result<TrashItem> {
        self.trash.soft_delete(T::KIND, id, Utc::now()).await
    }

    pub async fn get_settings(&self) -> Result<AppSettings> {
        match self.store.get(Collection::Settings, SETTINGS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(AppSettings::default()),
        }
    }

    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<AppSettings> {
        let mut settings = self.get_settings().await?;
        settings.apply(patch);
        self.save_settings(&settings).await?;
        Ok(settings)
    }

    pub async fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        settings.validate()?;
        self.store
            .apply(WriteBatch::new().put(
                Collection::Settings,
                SETTINGS_KEY,
                serde_json::to_value(settings)?,
            ))
            .await?;
        info!("Settings saved");
        Ok(())
    }

    pub async fn get_trash(&self) -> Result<Vec<TrashItem>> {
        self.trash.list().await
    }

    pub async fn restore_from_trash(&self, trash_id: &str) -> Result<TrashItem> {
        self.trash.restore(trash_id).await
    }

    pub async fn permanently_delete(&self, trash_id: &str) -> Result<()> {
        self.trash.purge(trash_id).await
    }

    pub async fn empty_trash(&self) -> Result<usize> {
        self.trash.empty().await
    }

    /// Purges trash older than the configured retention.
    pub async fn sweep_expired_trash(&self, now: DateTime<Utc>) -> Result<Vec<TrashItem>> {
        let settings = self.get_settings().await?;
        self.trash
            .sweep_expired(settings.trash_retention_days, now)
            .await
    }

    /// Creates a task linked back to the idea it came from.
    pub async fn convert_idea_to_task(&self, idea_id: &str, mut draft: NewTask) -> Result<Task> {
        let idea: Idea = self.get(idea_id).await?;
        if draft.title.trim().is_empty() {
            draft.title = idea.title.clone();
        }
        if draft.description.is_none() {
            let body = idea.body();
            draft.description = (!body.trim().is_empty()).then_some(body);
        }
        draft.idea_id = Some(idea.id.clone());
        let task: Task = self.add(draft).await?;
        info!("Converted idea {} into task {}", idea.id, task.id);
        Ok(task)
    }

    /// Tasks created from an idea. Derived from each task's `idea_id`.
    pub async fn converted_tasks(&self, idea_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .list::<Task>()
            .await?
            .into_iter()
            .filter(|t| t.idea_id.as_deref() == Some(idea_id))
            .collect())
    }

    pub fn subscribe(&self, listener: ChangeListener) -> Option<Subscription> {
        self.store.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CalendarEvent, Domain, IdeaPatch, LocalStore, NewCalendarEvent, NewDomain, NewIdea,
        NoteKind, NoteOp, TaskPatch, TaskState,
    };
    use chrono::Duration;

    fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        (dir, Storage::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn add_generates_id_and_timestamps() {
        let (_dir, storage) = storage();
        let task: Task = storage.add(NewTask::titled("  Water plants ")).await.unwrap();
        assert!(!task.id.is_empty());
        assert_eq!(task.title, "Water plants");
        assert_eq!(task.created_at, task.updated_at);
        assert_eq!(storage.list::<Task>().await.unwrap(), vec![task]);
    }

    #[tokio::test]
    async fn update_missing_id_is_not_found() {
        let (_dir, storage) = storage();
        let err = storage
            .update::<Task>("ghost", TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OmniError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_merges_partial_payload() {
        let (_dir, storage) = storage();
        let task: Task = storage
            .add(NewTask {
                title: "Draft essay".into(),
                description: Some("on gardens".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let updated = storage
            .update::<Task>(
                &task.id,
                TaskPatch {
                    state: Some(TaskState::Doing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.state, TaskState::Doing);
        assert_eq!(updated.description.as_deref(), Some("on gardens"));
        assert_eq!(updated.created_at, task.created_at);
    }

    #[tokio::test]
    async fn blank_title_rejected_at_boundary() {
        let (_dir, storage) = storage();
        let err = storage.add::<Idea>(NewIdea::titled("   ")).await.unwrap_err();
        assert!(matches!(err, OmniError::Validation { .. }));
        assert!(storage.list::<Idea>().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dangling_references_rejected() {
        let (_dir, storage) = storage();
        let err = storage
            .add::<Task>(NewTask {
                title: "Orphan".into(),
                domain_id: Some("no-such-domain".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OmniError::Validation { .. }));

        let domain: Domain = storage
            .add(NewDomain {
                name: "Health".into(),
                color: "#0f0".into(),
            })
            .await
            .unwrap();
        let task: Task = storage
            .add(NewTask {
                title: "Run".into(),
                domain_id: Some(domain.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        // trashing the domain does not block edits to the task pointing at it
        storage.delete::<Domain>(&domain.id).await.unwrap();
        storage
            .update::<Task>(
                &task.id,
                TaskPatch {
                    title: Some("Run 5k".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_goes_to_trash_for_every_kind() {
        let (_dir, storage) = storage();
        let now = Utc::now();
        let event: CalendarEvent = storage
            .add(NewCalendarEvent::new("Dentist", now, now + Duration::hours(1)))
            .await
            .unwrap();
        let record = storage.delete::<CalendarEvent>(&event.id).await.unwrap();

        assert_eq!(record.kind, EntityKind::CalendarEvent);
        assert!(storage.list::<CalendarEvent>().await.unwrap().is_empty());
        assert_eq!(storage.get_trash().await.unwrap(), vec![record.clone()]);
        assert_eq!(record.decode::<CalendarEvent>().unwrap(), event);
    }

    #[tokio::test]
    async fn converted_tasks_follow_task_links() {
        let (_dir, storage) = storage();
        let idea: Idea = storage
            .add(NewIdea {
                title: "Podcast".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        storage
            .update::<Idea>(
                &idea.id,
                IdeaPatch {
                    notes: vec![NoteOp::Append {
                        kind: NoteKind::Text,
                        content: "weekly, 30 minutes".into(),
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let task = storage
            .convert_idea_to_task(&idea.id, NewTask::default())
            .await
            .unwrap();
        assert_eq!(task.title, "Podcast");
        assert_eq!(task.idea_id.as_deref(), Some(idea.id.as_str()));
        assert_eq!(task.description.as_deref(), Some("weekly, 30 minutes"));

        let trashed = storage.delete::<Task>(&task.id).await.unwrap();
        assert!(storage.converted_tasks(&idea.id).await.unwrap().is_empty());

        // restoring the task brings the link back with it
        storage.restore_from_trash(&trashed.id).await.unwrap();
        let linked = storage.converted_tasks(&idea.id).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, task.id);
    }

    #[tokio::test]
    async fn settings_default_then_persist() {
        let (_dir, storage) = storage();
        assert_eq!(storage.get_settings().await.unwrap(), AppSettings::default());

        let updated = storage
            .update_settings(SettingsPatch {
                trash_retention_days: Some(14),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.trash_retention_days, 14);
        assert_eq!(storage.get_settings().await.unwrap().trash_retention_days, 14);

        let err = storage
            .update_settings(SettingsPatch {
                trash_retention_days: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OmniError::Validation { .. }));
        assert_eq!(storage.get_settings().await.unwrap().trash_retention_days, 14);
    }

    #[tokio::test]
    async fn sweep_uses_configured_retention() {
        let (_dir, storage) = storage();
        let task: Task = storage.add(NewTask::titled("Old chore")).await.unwrap();
        storage.delete::<Task>(&task.id).await.unwrap();

        let later = Utc::now() + Duration::days(10);
        assert!(storage.sweep_expired_trash(later).await.unwrap().is_empty());

        storage
            .update_settings(SettingsPatch {
                trash_retention_days: Some(7),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(storage.sweep_expired_trash(later).await.unwrap().len(), 1);
        assert!(storage.get_trash().await.unwrap().is_empty());
    }
}
