//! Core data structures for the omnidesk application.
//!
//! Every persisted record implements [`Entity`], which is what lets the
//! storage layer generate ids and timestamps, apply partial updates and
//! validate payloads once for all five collections.
use std::fmt::{self, Debug};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{normalize_tags, OmniError, Result};

/// Generates a fresh identifier for entities, subtasks, notes and trash records.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// The kinds of entity held in live collections and wrapped by trash records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Task,
    Idea,
    Domain,
    IdeaFolder,
    CalendarEvent,
}

impl EntityKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Idea => "idea",
            Self::Domain => "domain",
            Self::IdeaFolder => "idea folder",
            Self::CalendarEvent => "calendar event",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Behaviour shared by every persisted record.
pub trait Entity: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Payload accepted by `add`.
    type Draft: Send + 'static;

    /// Partial payload accepted by `update`.
    type Patch: Send + 'static;

    fn id(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;

    fn updated_at(&self) -> DateTime<Utc>;

    fn from_draft(id: String, now: DateTime<Utc>, draft: Self::Draft) -> Self;

    /// Applies a partial update in place. Fails when the patch addresses a
    /// nested record (subtask, note) that does not exist.
    fn apply_patch(&mut self, patch: Self::Patch, now: DateTime<Utc>) -> Result<()>;

    /// Field-level checks that do not need to look at other collections.
    fn validate(&self) -> Result<()>;

    /// Other entities this one points at. Each must exist when set.
    fn references(&self) -> Vec<(EntityKind, &str)> {
        Vec::new()
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(OmniError::validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn missing(kind: &str, id: &str) -> OmniError {
    OmniError::not_found(kind, id)
}

// ---------------------------------------------------------------------------
// Domain

/// A user-defined area of life used to categorize tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub id: String,
    pub name: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewDomain {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Default)]
pub struct DomainPatch {
    pub name: Option<String>,
    pub color: Option<String>,
}

impl Entity for Domain {
    const KIND: EntityKind = EntityKind::Domain;
    type Draft = NewDomain;
    type Patch = DomainPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn from_draft(id: String, now: DateTime<Utc>, draft: NewDomain) -> Self {
        Domain {
            id,
            name: draft.name.trim().to_string(),
            color: draft.color,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply_patch(&mut self, patch: DomainPatch, now: DateTime<Utc>) -> Result<()> {
        if let Some(name) = patch.name {
            self.name = name.trim().to_string();
        }
        if let Some(color) = patch.color {
            self.color = color;
        }
        self.updated_at = now;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        require_text("domain name", &self.name)
    }
}

// ---------------------------------------------------------------------------
// Task

/// Kanban lifecycle of a task. The identifiers are fixed; labels and colors
/// are configured through the kanban columns in the settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Exploring,
    Shaping,
    Doing,
    Done,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [
        TaskState::Exploring,
        TaskState::Shaping,
        TaskState::Doing,
        TaskState::Done,
    ];

    pub fn as_id(&self) -> &'static str {
        match self {
            Self::Exploring => "exploring",
            Self::Shaping => "shaping",
            Self::Doing => "doing",
            Self::Done => "done",
        }
    }

    pub fn from_id(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "exploring" => Some(Self::Exploring),
            "shaping" => Some(Self::Shaping),
            "doing" => Some(Self::Doing),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskState {
    #[default]
    Exploring,
    Shaping,
    Done,
}

impl SubtaskState {
    pub fn from_id(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "exploring" => Some(Self::Exploring),
            "shaping" => Some(Self::Shaping),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

/// A step of a task. Owned by exactly one task and never stored on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub state: SubtaskState,
}

impl Subtask {
    pub fn new(title: impl Into<String>) -> Self {
        Subtask {
            id: new_id(),
            title: title.into().trim().to_string(),
            state: SubtaskState::Exploring,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    /// The idea this task was converted from. This is the only stored side of
    /// the idea/task link; an idea's converted tasks are derived from it.
    #[serde(default)]
    pub idea_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub domain_id: Option<String>,
    pub state: TaskState,
    pub subtasks: Vec<String>,
    pub idea_id: Option<String>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        NewTask {
            title: title.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum SubtaskOp {
    Add { title: String },
    Rename { id: String, title: String },
    SetState { id: String, state: SubtaskState },
    Remove { id: String },
}

#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub domain_id: Option<Option<String>>,
    pub state: Option<TaskState>,
    pub idea_id: Option<Option<String>>,
    pub subtasks: Vec<SubtaskOp>,
}

impl Task {
    fn subtask_mut(&mut self, id: &str) -> Result<&mut Subtask> {
        self.subtasks
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| missing("subtask", id))
    }

    fn apply_subtask_op(&mut self, op: SubtaskOp) -> Result<()> {
        match op {
            SubtaskOp::Add { title } => self.subtasks.push(Subtask::new(title)),
            SubtaskOp::Rename { id, title } => {
                self.subtask_mut(&id)?.title = title.trim().to_string();
            }
            SubtaskOp::SetState { id, state } => self.subtask_mut(&id)?.state = state,
            SubtaskOp::Remove { id } => {
                let before = self.subtasks.len();
                self.subtasks.retain(|s| s.id != id);
                if self.subtasks.len() == before {
                    return Err(missing("subtask", &id));
                }
            }
        }
        Ok(())
    }
}

impl Entity for Task {
    const KIND: EntityKind = EntityKind::Task;
    type Draft = NewTask;
    type Patch = TaskPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn from_draft(id: String, now: DateTime<Utc>, draft: NewTask) -> Self {
        Task {
            id,
            title: draft.title.trim().to_string(),
            description: draft.description,
            domain_id: draft.domain_id,
            state: draft.state,
            subtasks: draft.subtasks.into_iter().map(Subtask::new).collect(),
            idea_id: draft.idea_id,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply_patch(&mut self, patch: TaskPatch, now: DateTime<Utc>) -> Result<()> {
        if let Some(title) = patch.title {
            self.title = title.trim().to_string();
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(domain_id) = patch.domain_id {
            self.domain_id = domain_id;
        }
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(idea_id) = patch.idea_id {
            self.idea_id = idea_id;
        }
        for op in patch.subtasks {
            self.apply_subtask_op(op)?;
        }
        self.updated_at = now;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        require_text("task title", &self.title)?;
        for subtask in &self.subtasks {
            require_text("subtask title", &subtask.title)?;
        }
        Ok(())
    }

    fn references(&self) -> Vec<(EntityKind, &str)> {
        let mut refs = Vec::new();
        if let Some(domain_id) = &self.domain_id {
            refs.push((EntityKind::Domain, domain_id.as_str()));
        }
        if let Some(idea_id) = &self.idea_id {
            refs.push((EntityKind::Idea, idea_id.as_str()));
        }
        refs
    }
}

// ---------------------------------------------------------------------------
// Idea

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    #[default]
    Text,
    Link,
    Image,
    Other,
}

impl NoteKind {
    pub fn from_id(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Some(Self::Text),
            "link" => Some(Self::Link),
            "image" => Some(Self::Image),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// One block of an idea's body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeaNote {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: NoteKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub order: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Idea {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub notes: Vec<IdeaNote>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whether this idea has its own spatial canvas.
    #[serde(default)]
    pub canvas_enabled: bool,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewNote {
    pub kind: NoteKind,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewIdea {
    pub title: String,
    pub notes: Vec<NewNote>,
    pub tags: Vec<String>,
    pub canvas_enabled: bool,
    pub folder_id: Option<String>,
}

impl NewIdea {
    pub fn titled(title: impl Into<String>) -> Self {
        NewIdea {
            title: title.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum NoteOp {
    Append { kind: NoteKind, content: String },
    Edit { id: String, content: String },
    Remove { id: String },
}

#[derive(Debug, Clone, Default)]
pub struct IdeaPatch {
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    pub canvas_enabled: Option<bool>,
    pub folder_id: Option<Option<String>>,
    pub notes: Vec<NoteOp>,
}

impl Idea {
    fn push_note(&mut self, kind: NoteKind, content: String, now: DateTime<Utc>) {
        let order = self.notes.iter().map(|n| n.order + 1).max().unwrap_or(0);
        self.notes.push(IdeaNote {
            id: new_id(),
            kind,
            content,
            created_at: now,
            order,
        });
    }

    /// Notes sorted by their order index.
    pub fn ordered_notes(&self) -> Vec<&IdeaNote> {
        let mut notes: Vec<&IdeaNote> = self.notes.iter().collect();
        notes.sort_by_key(|n| n.order);
        notes
    }

    /// All note contents joined, in order. Used for previews and search.
    pub fn body(&self) -> String {
        self.ordered_notes()
            .into_iter()
            .map(|n| n.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn apply_note_op(&mut self, op: NoteOp, now: DateTime<Utc>) -> Result<()> {
        match op {
            NoteOp::Append { kind, content } => self.push_note(kind, content, now),
            NoteOp::Edit { id, content } => {
                let note = self
                    .notes
                    .iter_mut()
                    .find(|n| n.id == id)
                    .ok_or_else(|| missing("note", &id))?;
                note.content = content;
            }
            NoteOp::Remove { id } => {
                let before = self.notes.len();
                self.notes.retain(|n| n.id != id);
                if self.notes.len() == before {
                    return Err(missing("note", &id));
                }
                // keep order indices dense
                self.notes.sort_by_key(|n| n.order);
                for (index, note) in self.notes.iter_mut().enumerate() {
                    note.order = index as u32;
                }
            }
        }
        Ok(())
    }
}

impl Entity for Idea {
    const KIND: EntityKind = EntityKind::Idea;
    type Draft = NewIdea;
    type Patch = IdeaPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn from_draft(id: String, now: DateTime<Utc>, draft: NewIdea) -> Self {
        let mut idea = Idea {
            id,
            title: draft.title.trim().to_string(),
            notes: Vec::new(),
            tags: normalize_tags(draft.tags),
            canvas_enabled: draft.canvas_enabled,
            folder_id: draft.folder_id,
            created_at: now,
            updated_at: now,
        };
        for note in draft.notes {
            idea.push_note(note.kind, note.content, now);
        }
        idea
    }

    fn apply_patch(&mut self, patch: IdeaPatch, now: DateTime<Utc>) -> Result<()> {
        if let Some(title) = patch.title {
            self.title = title.trim().to_string();
        }
        if let Some(tags) = patch.tags {
            self.tags = normalize_tags(tags);
        }
        if let Some(canvas_enabled) = patch.canvas_enabled {
            self.canvas_enabled = canvas_enabled;
        }
        if let Some(folder_id) = patch.folder_id {
            self.folder_id = folder_id;
        }
        for op in patch.notes {
            self.apply_note_op(op, now)?;
        }
        self.updated_at = now;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        require_text("idea title", &self.title)
    }

    fn references(&self) -> Vec<(EntityKind, &str)> {
        match &self.folder_id {
            Some(folder_id) => vec![(EntityKind::IdeaFolder, folder_id.as_str())],
            None => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// IdeaFolder

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeaFolder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewIdeaFolder {
    pub name: String,
    pub color: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IdeaFolderPatch {
    pub name: Option<String>,
    pub color: Option<Option<String>>,
    pub parent_id: Option<Option<String>>,
}

impl Entity for IdeaFolder {
    const KIND: EntityKind = EntityKind::IdeaFolder;
    type Draft = NewIdeaFolder;
    type Patch = IdeaFolderPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn from_draft(id: String, now: DateTime<Utc>, draft: NewIdeaFolder) -> Self {
        IdeaFolder {
            id,
            name: draft.name.trim().to_string(),
            color: draft.color,
            parent_id: draft.parent_id,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply_patch(&mut self, patch: IdeaFolderPatch, now: DateTime<Utc>) -> Result<()> {
        if let Some(name) = patch.name {
            self.name = name.trim().to_string();
        }
        if let Some(color) = patch.color {
            self.color = color;
        }
        if let Some(parent_id) = patch.parent_id {
            self.parent_id = parent_id;
        }
        self.updated_at = now;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        require_text("folder name", &self.name)?;
        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(OmniError::validation("a folder cannot be its own parent"));
        }
        Ok(())
    }

    fn references(&self) -> Vec<(EntityKind, &str)> {
        match &self.parent_id {
            Some(parent_id) => vec![(EntityKind::IdeaFolder, parent_id.as_str())],
            None => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// CalendarEvent

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub idea_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCalendarEvent {
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub all_day: bool,
    pub description: Option<String>,
    pub task_id: Option<String>,
    pub idea_id: Option<String>,
}

impl NewCalendarEvent {
    pub fn new(title: impl Into<String>, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        NewCalendarEvent {
            title: title.into(),
            starts_at,
            ends_at,
            all_day: false,
            description: None,
            task_id: None,
            idea_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CalendarEventPatch {
    pub title: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub all_day: Option<bool>,
    pub description: Option<Option<String>>,
    pub task_id: Option<Option<String>>,
    pub idea_id: Option<Option<String>>,
}

impl CalendarEvent {
    /// Whether the event overlaps the half-open range `[from, to)`.
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.starts_at < to && self.ends_at >= from
    }
}

impl Entity for CalendarEvent {
    const KIND: EntityKind = EntityKind::CalendarEvent;
    type Draft = NewCalendarEvent;
    type Patch = CalendarEventPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn from_draft(id: String, now: DateTime<Utc>, draft: NewCalendarEvent) -> Self {
        CalendarEvent {
            id,
            title: draft.title.trim().to_string(),
            starts_at: draft.starts_at,
            ends_at: draft.ends_at,
            all_day: draft.all_day,
            description: draft.description,
            task_id: draft.task_id,
            idea_id: draft.idea_id,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply_patch(&mut self, patch: CalendarEventPatch, now: DateTime<Utc>) -> Result<()> {
        if let Some(title) = patch.title {
            self.title = title.trim().to_string();
        }
        if let Some(starts_at) = patch.starts_at {
            self.starts_at = starts_at;
        }
        if let Some(ends_at) = patch.ends_at {
            self.ends_at = ends_at;
        }
        if let Some(all_day) = patch.all_day {
            self.all_day = all_day;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(task_id) = patch.task_id {
            self.task_id = task_id;
        }
        if let Some(idea_id) = patch.idea_id {
            self.idea_id = idea_id;
        }
        self.updated_at = now;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        require_text("event title", &self.title)?;
        if self.ends_at < self.starts_at {
            return Err(OmniError::validation(format!(
                "event ends ({}) before it starts ({})",
                self.ends_at.to_rfc3339(),
                self.starts_at.to_rfc3339()
            )));
        }
        Ok(())
    }

    fn references(&self) -> Vec<(EntityKind, &str)> {
        let mut refs = Vec::new();
        if let Some(task_id) = &self.task_id {
            refs.push((EntityKind::Task, task_id.as_str()));
        }
        if let Some(idea_id) = &self.idea_id {
            refs.push((EntityKind::Idea, idea_id.as_str()));
        }
        refs
    }
}
