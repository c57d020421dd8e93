//! User-facing application settings stored alongside the collections.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{OmniError, Result, TaskState};

pub const DEFAULT_TRASH_RETENTION_DAYS: u32 = 30;

/// Upper bound on the retention setting, one hundred years.
pub const MAX_TRASH_RETENTION_DAYS: u32 = 36_500;

/// A kanban column. `id` is one of the fixed task state identifiers; the label
/// and color are free to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KanbanColumn {
    pub id: String,
    pub label: String,
    pub color: String,
}

impl KanbanColumn {
    fn new(state: TaskState, label: &str, color: &str) -> Self {
        KanbanColumn {
            id: state.as_id().to_string(),
            label: label.to_string(),
            color: color.to_string(),
        }
    }
}

pub fn default_kanban_columns() -> Vec<KanbanColumn> {
    vec![
        KanbanColumn::new(TaskState::Exploring, "Exploring", "#a78bfa"),
        KanbanColumn::new(TaskState::Shaping, "Shaping", "#60a5fa"),
        KanbanColumn::new(TaskState::Doing, "Doing", "#fbbf24"),
        KanbanColumn::new(TaskState::Done, "Done", "#34d399"),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub task_reminders: bool,
    pub event_reminders: bool,
    pub trash_expiry_warnings: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        NotificationSettings {
            enabled: true,
            task_reminders: true,
            event_reminders: true,
            trash_expiry_warnings: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    /// Days a soft-deleted item stays restorable.
    pub trash_retention_days: u32,
    pub kanban_columns: Vec<KanbanColumn>,
    pub profile: UserProfile,
    pub notifications: NotificationSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            trash_retention_days: DEFAULT_TRASH_RETENTION_DAYS,
            kanban_columns: default_kanban_columns(),
            profile: UserProfile::default(),
            notifications: NotificationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub trash_retention_days: Option<u32>,
    pub kanban_columns: Option<Vec<KanbanColumn>>,
    pub profile: Option<UserProfile>,
    pub notifications: Option<NotificationSettings>,
}

impl AppSettings {
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(days) = patch.trash_retention_days {
            self.trash_retention_days = days;
        }
        if let Some(columns) = patch.kanban_columns {
            self.kanban_columns = columns;
        }
        if let Some(profile) = patch.profile {
            self.profile = profile;
        }
        if let Some(notifications) = patch.notifications {
            self.notifications = notifications;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.trash_retention_days == 0 {
            return Err(OmniError::validation(
                "trashRetentionDays must be a positive number of days",
            ));
        }
        if self.trash_retention_days > MAX_TRASH_RETENTION_DAYS {
            return Err(OmniError::validation(format!(
                "trashRetentionDays must be at most {} days",
                MAX_TRASH_RETENTION_DAYS
            )));
        }

        let mut seen = HashSet::new();
        for column in &self.kanban_columns {
            if TaskState::from_id(&column.id).is_none() {
                return Err(OmniError::validation(format!(
                    "kanban column '{}' is not a task state",
                    column.id
                )));
            }
            if !seen.insert(column.id.as_str()) {
                return Err(OmniError::validation(format!(
                    "kanban column '{}' is defined twice",
                    column.id
                )));
            }
            if column.label.trim().is_empty() {
                return Err(OmniError::validation(format!(
                    "kanban column '{}' needs a label",
                    column.id
                )));
            }
        }
        Ok(())
    }

    /// Label for a task state, falling back to the state id.
    pub fn column_label(&self, state: TaskState) -> &str {
        self.kanban_columns
            .iter()
            .find(|c| c.id == state.as_id())
            .map(|c| c.label.as_str())
            .unwrap_or(state.as_id())
    }

    /// Applies a `key=value` assignment from the command line.
    pub fn set_from_str(&mut self, assignment: &str) -> Result<()> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            OmniError::validation(format!("expected key=value, got '{}'", assignment))
        })?;
        let value = value.trim();
        let bad = |what: &str| OmniError::validation(format!("invalid {}: '{}'", what, value));

        match key.trim() {
            "trashRetentionDays" | "trash_retention_days" => {
                self.trash_retention_days = value.parse().map_err(|_| bad("day count"))?;
            }
            "profile.name" => self.profile.name = value.to_string(),
            "profile.email" => {
                self.profile.email = (!value.is_empty()).then(|| value.to_string());
            }
            "notifications.enabled" => {
                self.notifications.enabled = value.parse().map_err(|_| bad("boolean"))?;
            }
            "notifications.taskReminders" => {
                self.notifications.task_reminders = value.parse().map_err(|_| bad("boolean"))?;
            }
            "notifications.eventReminders" => {
                self.notifications.event_reminders = value.parse().map_err(|_| bad("boolean"))?;
            }
            "notifications.trashExpiryWarnings" => {
                self.notifications.trash_expiry_warnings =
                    value.parse().map_err(|_| bad("boolean"))?;
            }
            other => {
                // column.<state>.label / column.<state>.color
                let parts: Vec<&str> = other.split('.').collect();
                match parts.as_slice() {
                    ["column", id, field] => {
                        let column = self
                            .kanban_columns
                            .iter_mut()
                            .find(|c| c.id == *id)
                            .ok_or_else(|| OmniError::not_found("kanban column", *id))?;
                        match *field {
                            "label" => column.label = value.to_string(),
                            "color" => column.color = value.to_string(),
                            _ => return Err(unknown_setting(other)),
                        }
                    }
                    _ => return Err(unknown_setting(other)),
                }
            }
        }
        Ok(())
    }
}

fn unknown_setting(key: &str) -> OmniError {
    OmniError::validation(format!("unknown setting '{}'", key))
}
