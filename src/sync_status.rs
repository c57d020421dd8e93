//! Observable online/offline state reported by the active backend.
//!
//! One reporter is created at startup and passed by `Arc` to whichever
//! components need it; there is no global instance.
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{Listeners, Subscription};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    /// Writes accepted locally but not yet acknowledged by the backend.
    pub pending_changes: usize,
    pub is_syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

pub struct SyncStatusReporter {
    state: Mutex<SyncStatus>,
    listeners: Listeners<SyncStatus>,
}

impl SyncStatusReporter {
    /// Starts offline with nothing pending.
    pub fn new() -> Self {
        SyncStatusReporter {
            state: Mutex::new(SyncStatus::default()),
            listeners: Listeners::new(),
        }
    }

    pub fn status(&self) -> SyncStatus {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(e) => {
                warn!("Sync status lock poisoned: {}", e);
                e.into_inner().clone()
            }
        }
    }

    /// Registers a callback invoked after every change of state.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Applies `change` and notifies subscribers if anything differs.
    pub fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut SyncStatus),
    {
        let changed = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(e) => e.into_inner(),
            };
            let before = state.clone();
            change(&mut state);
            (*state != before).then(|| state.clone())
        };

        if let Some(status) = changed {
            debug!(
                "Sync status: online={} pending={} syncing={}",
                status.is_online, status.pending_changes, status.is_syncing
            );
            self.listeners.emit(&status);
        }
    }

    pub fn set_online(&self, online: bool) {
        self.update(|s| s.is_online = online);
    }

    pub fn set_pending(&self, pending: usize) {
        self.update(|s| s.pending_changes = pending);
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.update(|s| s.is_syncing = syncing);
    }

    pub fn mark_synced(&self, at: DateTime<Utc>) {
        self.update(|s| {
            s.is_syncing = false;
            s.last_synced_at = Some(at);
        });
    }

    /// Drops every subscriber. Called once at shutdown.
    pub fn clear(&self) {
        self.listeners.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for SyncStatusReporter {
    fn default() -> Self {
        Self::new()
    }
}
