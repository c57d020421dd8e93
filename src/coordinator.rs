//! Application State Coordinator.
//!
//! Holds the in-memory mirror of every collection that the interface
//! renders from. Each mutation goes through [`Storage`] and, once it has
//! succeeded, the touched collections are re-read and swapped in whole. A
//! failed mutation leaves the snapshot exactly as it was.
use std::{
    collections::BTreeSet,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::{
    compute_expiration, AppSettings, CalendarEvent, CalendarEventPatch, Collection, Domain,
    DomainPatch, Entity, Expiration, Idea, IdeaFolder, IdeaFolderPatch, IdeaPatch,
    NewCalendarEvent, NewDomain, NewIdea, NewIdeaFolder, NewTask, OmniError, Result,
    SettingsPatch, Storage, Subscription, SyncStatus, SyncStatusReporter, Task, TaskPatch,
    TaskState, TrashItem,
};

/// Every collection as last read from storage.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub domains: Arc<Vec<Domain>>,
    pub tasks: Arc<Vec<Task>>,
    pub ideas: Arc<Vec<Idea>>,
    pub idea_folders: Arc<Vec<IdeaFolder>>,
    pub calendar_events: Arc<Vec<CalendarEvent>>,
    pub trash: Arc<Vec<TrashItem>>,
    pub settings: Arc<AppSettings>,
}

async fn with_timeout<T, F>(timeout: Duration, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} did not finish within {:?}", operation, timeout);
            Err(OmniError::Timeout {
                operation: operation.to_string(),
                seconds: timeout.as_secs(),
            })
        }
    }
}

pub struct AppState {
    storage: Arc<Storage>,
    status: Arc<SyncStatusReporter>,
    timeout: Duration,
    snapshot: Snapshot,
    /// Collections the backend reported as changed since they were last read
    stale: Arc<Mutex<BTreeSet<Collection>>>,
    subscription: Option<Subscription>,
}

impl AppState {
    pub fn new(storage: Arc<Storage>, status: Arc<SyncStatusReporter>, timeout: Duration) -> Self {
        AppState {
            storage,
            status,
            timeout,
            snapshot: Snapshot::default(),
            stale: Arc::new(Mutex::new(BTreeSet::new())),
            subscription: None,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn domains(&self) -> &[Domain] {
        &self.snapshot.domains
    }

    pub fn tasks(&self) -> &[Task] {
        &self.snapshot.tasks
    }

    pub fn ideas(&self) -> &[Idea] {
        &self.snapshot.ideas
    }

    pub fn idea_folders(&self) -> &[IdeaFolder] {
        &self.snapshot.idea_folders
    }

    pub fn calendar_events(&self) -> &[CalendarEvent] {
        &self.snapshot.calendar_events
    }

    pub fn trash(&self) -> &[TrashItem] {
        &self.snapshot.trash
    }

    pub fn settings(&self) -> &AppSettings {
        &self.snapshot.settings
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.status.status()
    }

    /// Reads every collection. Called once after the store is opened.
    pub async fn load(&mut self) -> Result<()> {
        for collection in Collection::ALL {
            self.refresh(collection).await?;
        }
        info!(
            "Loaded state: {} tasks, {} ideas, {} domains, {} events, {} in trash",
            self.snapshot.tasks.len(),
            self.snapshot.ideas.len(),
            self.snapshot.domains.len(),
            self.snapshot.calendar_events.len(),
            self.snapshot.trash.len()
        );
        Ok(())
    }

    /// Re-reads one collection and replaces it in the snapshot.
    pub async fn refresh(&mut self, collection: Collection) -> Result<()> {
        let storage = Arc::clone(&self.storage);
        let op = format!("refresh {}", collection);
        match collection {
            Collection::Domains => {
                self.snapshot.domains =
                    Arc::new(with_timeout(self.timeout, &op, storage.list::<Domain>()).await?);
            }
            Collection::Tasks => {
                self.snapshot.tasks =
                    Arc::new(with_timeout(self.timeout, &op, storage.list::<Task>()).await?);
            }
            Collection::Ideas => {
                self.snapshot.ideas =
                    Arc::new(with_timeout(self.timeout, &op, storage.list::<Idea>()).await?);
            }
            Collection::IdeaFolders => {
                self.snapshot.idea_folders =
                    Arc::new(with_timeout(self.timeout, &op, storage.list::<IdeaFolder>()).await?);
            }
            Collection::CalendarEvents => {
                self.snapshot.calendar_events = Arc::new(
                    with_timeout(self.timeout, &op, storage.list::<CalendarEvent>()).await?,
                );
            }
            Collection::Settings => {
                self.snapshot.settings =
                    Arc::new(with_timeout(self.timeout, &op, storage.get_settings()).await?);
            }
            Collection::Trash => {
                self.snapshot.trash =
                    Arc::new(with_timeout(self.timeout, &op, storage.get_trash()).await?);
            }
        }
        if let Ok(mut stale) = self.stale.lock() {
            stale.remove(&collection);
        }
        debug!("Refreshed {}", collection);
        Ok(())
    }

    /// Subscribes to backend change pushes. Changed collections are marked
    /// stale and picked up by [`AppState::refresh_stale`]. Returns false when
    /// the backend has no push support and callers must poll instead.
    pub fn watch_changes(&mut self) -> bool {
        if self.subscription.is_some() {
            return true;
        }
        let stale = Arc::clone(&self.stale);
        let subscription = self.storage.subscribe(Box::new(move |collection| {
            if let Ok(mut stale) = stale.lock() {
                stale.insert(*collection);
            }
        }));
        self.subscription = subscription;
        self.subscription.is_some()
    }

    pub fn stale_collections(&self) -> BTreeSet<Collection> {
        self.stale
            .lock()
            .map(|stale| stale.clone())
            .unwrap_or_default()
    }

    pub async fn refresh_stale(&mut self) -> Result<Vec<Collection>> {
        let stale: Vec<Collection> = self.stale_collections().into_iter().collect();
        for collection in &stale {
            self.refresh(*collection).await?;
        }
        Ok(stale)
    }

    async fn refresh_all(&mut self, collections: &[Collection]) -> Result<()> {
        for collection in collections {
            self.refresh(*collection).await?;
        }
        Ok(())
    }

    // -- generic mutations ---------------------------------------------------

    pub async fn add<T: Entity>(&mut self, draft: T::Draft) -> Result<T> {
        let storage = Arc::clone(&self.storage);
        let op = format!("add {}", T::KIND);
        let created = with_timeout(self.timeout, &op, storage.add::<T>(draft)).await?;
        self.refresh(Collection::for_kind(T::KIND)).await?;
        Ok(created)
    }

    pub async fn update<T: Entity>(&mut self, id: &str, patch: T::Patch) -> Result<T> {
        let storage = Arc::clone(&self.storage);
        let op = format!("update {} {}", T::KIND, id);
        let updated = with_timeout(self.timeout, &op, storage.update::<T>(id, patch)).await?;
        self.refresh(Collection::for_kind(T::KIND)).await?;
        Ok(updated)
    }

    pub async fn delete<T: Entity>(&mut self, id: &str) -> Result<TrashItem> {
        let storage = Arc::clone(&self.storage);
        let op = format!("delete {} {}", T::KIND, id);
        let record = with_timeout(self.timeout, &op, storage.delete::<T>(id)).await?;
        self.refresh_all(&[Collection::for_kind(T::KIND), Collection::Trash])
            .await?;
        Ok(record)
    }

    // -- per-entity operations -----------------------------------------------

    pub async fn add_domain(&mut self, draft: NewDomain) -> Result<Domain> {
        self.add::<Domain>(draft).await
    }

    pub async fn update_domain(&mut self, id: &str, patch: DomainPatch) -> Result<Domain> {
        self.update::<Domain>(id, patch).await
    }

    pub async fn delete_domain(&mut self, id: &str) -> Result<TrashItem> {
        self.delete::<Domain>(id).await
    }

    pub async fn add_task(&mut self, draft: NewTask) -> Result<Task> {
        self.add::<Task>(draft).await
    }

    pub async fn update_task(&mut self, id: &str, patch: TaskPatch) -> Result<Task> {
        self.update::<Task>(id, patch).await
    }

    /// Moves a task to another kanban column.
    pub async fn move_task(&mut self, id: &str, state: TaskState) -> Result<Task> {
        self.update_task(
            id,
            TaskPatch {
                state: Some(state),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete_task(&mut self, id: &str) -> Result<TrashItem> {
        self.delete::<Task>(id).await
    }

    pub async fn add_idea(&mut self, draft: NewIdea) -> Result<Idea> {
        self.add::<Idea>(draft).await
    }

    pub async fn update_idea(&mut self, id: &str, patch: IdeaPatch) -> Result<Idea> {
        self.update::<Idea>(id, patch).await
    }

    pub async fn delete_idea(&mut self, id: &str) -> Result<TrashItem> {
        self.delete::<Idea>(id).await
    }

    pub async fn add_idea_folder(&mut self, draft: NewIdeaFolder) -> Result<IdeaFolder> {
        self.add::<IdeaFolder>(draft).await
    }

    pub async fn update_idea_folder(
        &mut self,
        id: &str,
        patch: IdeaFolderPatch,
    ) -> Result<IdeaFolder> {
        self.update::<IdeaFolder>(id, patch).await
    }

    pub async fn delete_idea_folder(&mut self, id: &str) -> Result<TrashItem> {
        self.delete::<IdeaFolder>(id).await
    }

    pub async fn add_calendar_event(&mut self, draft: NewCalendarEvent) -> Result<CalendarEvent> {
        self.add::<CalendarEvent>(draft).await
    }

    pub async fn update_calendar_event(
        &mut self,
        id: &str,
        patch: CalendarEventPatch,
    ) -> Result<CalendarEvent> {
        self.update::<CalendarEvent>(id, patch).await
    }

    pub async fn delete_calendar_event(&mut self, id: &str) -> Result<TrashItem> {
        self.delete::<CalendarEvent>(id).await
    }

    pub async fn convert_idea_to_task(&mut self, idea_id: &str, draft: NewTask) -> Result<Task> {
        let storage = Arc::clone(&self.storage);
        let op = format!("convert idea {}", idea_id);
        let task = with_timeout(
            self.timeout,
            &op,
            storage.convert_idea_to_task(idea_id, draft),
        )
        .await?;
        self.refresh(Collection::Tasks).await?;
        Ok(task)
    }

    // -- settings --------------------------------------------------------------

    pub async fn update_settings(&mut self, patch: SettingsPatch) -> Result<AppSettings> {
        let storage = Arc::clone(&self.storage);
        let settings =
            with_timeout(self.timeout, "update settings", storage.update_settings(patch)).await?;
        self.refresh(Collection::Settings).await?;
        Ok(settings)
    }

    pub async fn replace_settings(&mut self, settings: AppSettings) -> Result<()> {
        let storage = Arc::clone(&self.storage);
        with_timeout(self.timeout, "save settings", storage.save_settings(&settings)).await?;
        self.refresh(Collection::Settings).await
    }

    // -- trash -------------------------------------------------------------------

    pub async fn restore_from_trash(&mut self, trash_id: &str) -> Result<TrashItem> {
        let storage = Arc::clone(&self.storage);
        let op = format!("restore {}", trash_id);
        let record = with_timeout(self.timeout, &op, storage.restore_from_trash(trash_id)).await?;
        self.refresh_all(&[Collection::for_kind(record.kind), Collection::Trash])
            .await?;
        Ok(record)
    }

    pub async fn permanently_delete(&mut self, trash_id: &str) -> Result<()> {
        let storage = Arc::clone(&self.storage);
        let op = format!("purge {}", trash_id);
        with_timeout(self.timeout, &op, storage.permanently_delete(trash_id)).await?;
        self.refresh(Collection::Trash).await
    }

    pub async fn empty_trash(&mut self) -> Result<usize> {
        let storage = Arc::clone(&self.storage);
        let count = with_timeout(self.timeout, "empty trash", storage.empty_trash()).await?;
        self.refresh(Collection::Trash).await?;
        Ok(count)
    }

    pub async fn sweep_expired_trash(&mut self, now: DateTime<Utc>) -> Result<Vec<TrashItem>> {
        let storage = Arc::clone(&self.storage);
        let purged =
            with_timeout(self.timeout, "sweep trash", storage.sweep_expired_trash(now)).await?;
        self.refresh(Collection::Trash).await?;
        Ok(purged)
    }

    /// Asks the backend whether its authoritative copy is reachable. A check
    /// that outlasts the request timeout counts as unreachable.
    pub async fn check_connection(&self) -> bool {
        let check = async { Ok(self.storage.store().check_connection().await) };
        with_timeout(self.timeout, "connection check", check)
            .await
            .unwrap_or(false)
    }

    /// Flushes and pulls through the backend, then re-reads whatever changed.
    pub async fn sync(&mut self) -> Result<()> {
        let storage = Arc::clone(&self.storage);
        with_timeout(self.timeout, "sync", storage.store().sync()).await?;
        if self.subscription.is_some() {
            self.refresh_stale().await?;
        } else {
            self.load().await?;
        }
        Ok(())
    }

    // -- derived views -------------------------------------------------------

    /// Tasks created from an idea, derived from the tasks' own links.
    pub fn converted_tasks(&self, idea_id: &str) -> Vec<&Task> {
        self.snapshot
            .tasks
            .iter()
            .filter(|t| t.idea_id.as_deref() == Some(idea_id))
            .collect()
    }

    pub fn tasks_in_state(&self, state: TaskState) -> Vec<&Task> {
        self.snapshot
            .tasks
            .iter()
            .filter(|t| t.state == state)
            .collect()
    }

    /// Kanban columns in configured order with their tasks.
    pub fn board(&self) -> Vec<(String, Vec<&Task>)> {
        self.snapshot
            .settings
            .kanban_columns
            .iter()
            .filter_map(|column| {
                TaskState::from_id(&column.id)
                    .map(|state| (column.label.clone(), self.tasks_in_state(state)))
            })
            .collect()
    }

    pub fn events_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<&CalendarEvent> {
        let mut events: Vec<&CalendarEvent> = self
            .snapshot
            .calendar_events
            .iter()
            .filter(|e| e.overlaps(from, to))
            .collect();
        events.sort_by_key(|e| e.starts_at);
        events
    }

    /// Trash records with their expiration under the current retention.
    pub fn trash_entries(&self, now: DateTime<Utc>) -> Vec<(&TrashItem, Expiration)> {
        let retention = self.snapshot.settings.trash_retention_days;
        self.snapshot
            .trash
            .iter()
            .map(|item| (item, compute_expiration(item, retention, now)))
            .collect()
    }

    /// Drops the change subscription and all sync status subscribers.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.status.clear();
        self.storage.store().close().await?;
        info!("Application state shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DocumentStore, ExpiryClass, LocalStore, RemoteStore};
    use chrono::Duration as ChronoDuration;

    fn app_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(LocalStore::open(dir.path()).unwrap());
        let storage = Arc::new(Storage::new(store));
        let status = Arc::new(SyncStatusReporter::new());
        (dir, AppState::new(storage, status, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn mutations_refresh_touched_collections() {
        let (_dir, mut state) = app_state();
        state.load().await.unwrap();

        let task = state.add_task(NewTask::titled("Buy paint")).await.unwrap();
        assert_eq!(state.tasks().len(), 1);

        let record = state.delete_task(&task.id).await.unwrap();
        assert!(state.tasks().is_empty());
        assert_eq!(state.trash().len(), 1);

        state.restore_from_trash(&record.id).await.unwrap();
        assert_eq!(state.tasks(), &[task][..]);
        assert!(state.trash().is_empty());
    }

    #[tokio::test]
    async fn failed_mutation_leaves_snapshot_untouched() {
        let (_dir, mut state) = app_state();
        state.add_task(NewTask::titled("Keep me")).await.unwrap();
        let before = Arc::clone(&state.snapshot().tasks);

        assert!(state.delete_task("ghost").await.is_err());
        assert!(state.add_task(NewTask::titled("")).await.is_err());
        assert!(Arc::ptr_eq(&before, &state.snapshot().tasks));
    }

    #[tokio::test]
    async fn restored_idea_keeps_id_and_content() {
        let (_dir, mut state) = app_state();
        let idea = state
            .add_idea(NewIdea {
                title: "Reading nook".into(),
                tags: vec!["home".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        let record = state.delete_idea(&idea.id).await.unwrap();
        assert!(state.ideas().is_empty());
        state.restore_from_trash(&record.id).await.unwrap();

        assert_eq!(state.ideas().len(), 1);
        assert_eq!(state.ideas()[0], idea);
        assert!(state.trash().iter().all(|t| t.id != record.id));
    }

    #[tokio::test]
    async fn empty_trash_leaves_live_collections_alone() {
        let (_dir, mut state) = app_state();
        let keep = state.add_task(NewTask::titled("Stay")).await.unwrap();
        for i in 0..5 {
            let t = state
                .add_task(NewTask::titled(format!("Temp {}", i)))
                .await
                .unwrap();
            state.delete_task(&t.id).await.unwrap();
        }
        assert_eq!(state.trash().len(), 5);

        assert_eq!(state.empty_trash().await.unwrap(), 5);
        assert!(state.trash().is_empty());
        assert_eq!(state.tasks(), &[keep][..]);
    }

    #[tokio::test]
    async fn live_plus_trash_count_is_conserved() {
        let (_dir, mut state) = app_state();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(state.add_task(NewTask::titled(format!("T{}", i))).await.unwrap().id);
        }
        let total = |s: &AppState| s.tasks().len() + s.trash().len();
        assert_eq!(total(&state), 4);

        let a = state.delete_task(&ids[0]).await.unwrap();
        let b = state.delete_task(&ids[1]).await.unwrap();
        assert_eq!(total(&state), 4);

        state.restore_from_trash(&a.id).await.unwrap();
        assert_eq!(total(&state), 4);

        state.permanently_delete(&b.id).await.unwrap();
        assert_eq!(total(&state), 3);

        let again = state.permanently_delete(&b.id).await.unwrap_err();
        assert!(matches!(again, OmniError::NotFound { .. }));
        assert_eq!(total(&state), 3);
    }

    #[tokio::test]
    async fn trash_entries_use_current_retention() {
        let (_dir, mut state) = app_state();
        let task = state.add_task(NewTask::titled("Expire me")).await.unwrap();
        state.delete_task(&task.id).await.unwrap();

        let later = Utc::now() + ChronoDuration::days(25);
        let entries = state.trash_entries(later);
        assert_eq!(entries[0].1.class, ExpiryClass::Urgent);

        state
            .update_settings(SettingsPatch {
                trash_retention_days: Some(60),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(state.trash_entries(later)[0].1.class, ExpiryClass::Normal);
    }

    #[tokio::test]
    async fn pushed_changes_mark_collections_stale() {
        let (_dir, mut state) = app_state();
        assert!(state.watch_changes());

        // a write that bypasses the coordinator
        let storage = Arc::clone(state.storage());
        storage.add::<Domain>(NewDomain {
            name: "Work".into(),
            color: "#00f".into(),
        })
        .await
        .unwrap();
        assert!(state.domains().is_empty());
        assert!(state.stale_collections().contains(&Collection::Domains));

        let refreshed = state.refresh_stale().await.unwrap();
        assert_eq!(refreshed, vec![Collection::Domains]);
        assert_eq!(state.domains().len(), 1);
        assert!(state.stale_collections().is_empty());
    }

    #[tokio::test]
    async fn board_groups_tasks_by_column() {
        let (_dir, mut state) = app_state();
        state.load().await.unwrap();
        let t = state.add_task(NewTask::titled("Sketch")).await.unwrap();
        state.move_task(&t.id, TaskState::Doing).await.unwrap();

        let board = state.board();
        assert_eq!(board.len(), 4);
        let doing = board.iter().find(|(label, _)| label == "Doing").unwrap();
        assert_eq!(doing.1.len(), 1);
    }

    #[tokio::test]
    async fn stalled_calls_time_out() {
        let result: Result<()> = with_timeout(Duration::from_millis(20), "stall", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(OmniError::Timeout { .. })));
    }

    #[tokio::test]
    async fn slow_remote_still_accepts_writes_within_timeout() {
        // accepts connections and never answers them
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let timeout = Duration::from_secs(1);
        let status = Arc::new(SyncStatusReporter::new());
        let store = RemoteStore::connect(&url, None, dir.path(), timeout, Arc::clone(&status))
            .await
            .unwrap();
        let storage = Arc::new(Storage::new(Arc::new(store)));
        let mut state = AppState::new(storage, status, timeout);

        state.add_task(NewTask::titled("Queued")).await.unwrap();
        assert_eq!(state.tasks().len(), 1);
        assert_eq!(state.sync_status().pending_changes, 1);
        assert!(!state.check_connection().await);
    }
}
