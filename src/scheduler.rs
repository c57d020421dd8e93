// src/scheduler.rs - Background maintenance: sync, trash sweep, backups
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::{create_backup, Config, OmniError, Result, Storage};

#[derive(Debug, Clone, Default)]
pub struct MaintenanceStatus {
    /// Whether the scheduler is running
    pub is_running: bool,
    /// When the last maintenance pass finished
    pub last_run_time: Option<DateTime<Utc>>,
    /// Trash records purged by the last pass
    pub last_purged: usize,
    /// The path to the last backup file
    pub last_backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum MaintenanceCommand {
    /// Run a maintenance pass immediately
    RunNow,
    /// Stop the scheduler
    Stop,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub synced: bool,
    pub purged: usize,
    pub backup_path: Option<PathBuf>,
}

/// One pass: reconcile with the backend, purge expired trash, back up.
///
/// A failed sync is logged and does not stop the rest of the pass.
pub async fn run_maintenance(storage: &Storage, config: &Config) -> Result<MaintenanceReport> {
    let mut report = MaintenanceReport::default();

    match storage.store().sync().await {
        Ok(()) => report.synced = true,
        Err(e) => warn!("Maintenance sync skipped: {}", e),
    }

    if config.auto_purge_expired {
        report.purged = storage.sweep_expired_trash(Utc::now()).await?.len();
    }

    if config.auto_backup {
        let path = create_backup(
            storage.store().as_ref(),
            &config.backup_dir,
            config.max_backups,
        )
        .await?;
        report.backup_path = Some(path);
    }

    debug!("Maintenance pass finished: {:?}", report);
    Ok(report)
}

pub struct MaintenanceScheduler {
    config: Config,

    /// Channel to send commands to the scheduler task
    command_tx: Option<mpsc::Sender<MaintenanceCommand>>,

    /// Handle to the scheduler task
    scheduler_task: Option<JoinHandle<()>>,

    /// Shared with the scheduler task, which records each pass
    status: Arc<Mutex<MaintenanceStatus>>,

    /// The scheduler never keeps storage alive on its own
    storage: Weak<Storage>,
}

impl MaintenanceScheduler {
    pub fn new(config: Config, storage: &Arc<Storage>) -> Self {
        debug!(
            "Initializing maintenance scheduler every {} minutes",
            config.maintenance_interval_minutes
        );
        Self {
            config,
            command_tx: None,
            scheduler_task: None,
            status: Arc::new(Mutex::new(MaintenanceStatus::default())),
            storage: Arc::downgrade(storage),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.start_with_interval(self.config.maintenance_interval())
    }

    pub fn start_with_interval(&mut self, period: Duration) -> Result<()> {
        if self.scheduler_task.is_some() {
            debug!("Maintenance scheduler already running");
            return Ok(());
        }
        info!("Starting maintenance scheduler (every {:?})", period);

        if self.storage.upgrade().is_none() {
            error!("Storage dropped before the maintenance scheduler started");
            return Err(OmniError::ApplicationError {
                message: "Storage reference is no longer valid.".to_string(),
            });
        }

        let (command_tx, mut command_rx) = mpsc::channel(10);
        self.command_tx = Some(command_tx);

        let storage = self.storage.clone();
        let config = self.config.clone();
        let status = Arc::clone(&self.status);

        let task = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.tick().await; // Initial tick

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !run_pass(&storage, &config, &status, "Scheduled").await {
                            break;
                        }
                    }
                    cmd = command_rx.recv() => match cmd {
                        Some(MaintenanceCommand::RunNow) => {
                            if !run_pass(&storage, &config, &status, "Manual").await {
                                break;
                            }
                        }
                        Some(MaintenanceCommand::Stop) | None => {
                            info!("Maintenance scheduler stopping...");
                            break;
                        }
                    }
                }
            }

            if let Ok(mut status) = status.lock() {
                status.is_running = false;
            }
        });

        self.scheduler_task = Some(task);
        if let Ok(mut status) = self.status.lock() {
            status.is_running = true;
        }
        Ok(())
    }

    /// Stop the scheduler if it's running
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.scheduler_task.take() {
            if let Some(tx) = self.command_tx.take() {
                if let Err(e) = tx.send(MaintenanceCommand::Stop).await {
                    debug!("Maintenance scheduler already gone: {}", e);
                }
            }

            if let Err(e) = task.await {
                let message = format!("Failed to stop maintenance scheduler: {}", e);
                error!("{}", message);
                return Err(OmniError::ApplicationError { message });
            }
            info!("Maintenance scheduler stopped");
        } else {
            debug!("Maintenance scheduler is not running");
        }
        Ok(())
    }

    /// Run a pass immediately, regardless of the schedule
    pub async fn run_now(&self) -> Result<()> {
        let tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| OmniError::ApplicationError {
                message: "Maintenance scheduler is not running".to_string(),
            })?;
        tx.send(MaintenanceCommand::RunNow)
            .await
            .map_err(|e| OmniError::ApplicationError {
                message: format!("Failed to send maintenance command: {}", e),
            })
    }

    pub fn get_status(&self) -> MaintenanceStatus {
        self.status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default()
    }
}

/// Returns false once storage is gone and the loop should end.
async fn run_pass(
    storage: &Weak<Storage>,
    config: &Config,
    status: &Arc<Mutex<MaintenanceStatus>>,
    label: &str,
) -> bool {
    let Some(storage) = storage.upgrade() else {
        warn!("Storage dropped, maintenance scheduler exiting");
        return false;
    };
    match run_maintenance(&storage, config).await {
        Ok(report) => {
            info!(
                "{} maintenance completed: {} purged, backup {}",
                label,
                report.purged,
                report
                    .backup_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "skipped".to_string())
            );
            if let Ok(mut status) = status.lock() {
                status.last_run_time = Some(Utc::now());
                status.last_purged = report.purged;
                if report.backup_path.is_some() {
                    status.last_backup_path = report.backup_path;
                }
            }
        }
        Err(e) => error!("{} maintenance failed: {}", label, e),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{list_backups, DocumentStore, LocalStore, NewTask, Task, TrashItem};
    use chrono::Duration as ChronoDuration;

    fn storage(dir: &std::path::Path) -> Arc<Storage> {
        let store: Arc<dyn DocumentStore> = Arc::new(LocalStore::open(dir).unwrap());
        Arc::new(Storage::new(store))
    }

    async fn trash_old_task(storage: &Storage) -> TrashItem {
        let task: Task = storage.add(NewTask::titled("Old")).await.unwrap();
        let mut record = storage.delete::<Task>(&task.id).await.unwrap();
        // backdate past the default retention
        record.deleted_at = Utc::now() - ChronoDuration::days(45);
        storage
            .store()
            .apply(crate::WriteBatch::new().put(
                crate::Collection::Trash,
                record.id.clone(),
                serde_json::to_value(&record).unwrap(),
            ))
            .await
            .unwrap();
        record
    }

    #[tokio::test]
    async fn pass_purges_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir.path().join("data"));
        trash_old_task(&storage).await;

        let config = Config {
            data_dir: dir.path().join("data"),
            backup_dir: dir.path().join("backups"),
            auto_backup: true,
            ..Config::default()
        };
        let report = run_maintenance(&storage, &config).await.unwrap();
        assert!(report.synced);
        assert_eq!(report.purged, 1);
        assert!(storage.get_trash().await.unwrap().is_empty());
        assert_eq!(list_backups(&config.backup_dir).len(), 1);
    }

    #[tokio::test]
    async fn purge_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        trash_old_task(&storage).await;

        let config = Config {
            auto_purge_expired: false,
            ..Config::default()
        };
        let report = run_maintenance(&storage, &config).await.unwrap();
        assert_eq!(report.purged, 0);
        assert_eq!(storage.get_trash().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_now_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        trash_old_task(&storage).await;

        let mut scheduler = MaintenanceScheduler::new(Config::default(), &storage);
        assert!(scheduler.run_now().await.is_err());

        scheduler
            .start_with_interval(Duration::from_secs(3600))
            .unwrap();
        assert!(scheduler.get_status().is_running);
        scheduler.run_now().await.unwrap();

        for _ in 0..50 {
            if scheduler.get_status().last_run_time.is_some() {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(scheduler.get_status().last_purged, 1);

        scheduler.stop().await.unwrap();
        assert!(!scheduler.get_status().is_running);
    }
}
