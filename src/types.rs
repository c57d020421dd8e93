//! Shared result alias, summaries and the command-line surface.
use std::path::PathBuf;

use clap::Subcommand;

use crate::OmniError;

/// A specialized Result type for omnidesk operations.
pub type Result<T> = std::result::Result<T, OmniError>;

/// Summary of a backup restoration operation
#[derive(Debug, Clone, Default)]
pub struct RestoreBackupSummary {
    /// Path to the backup file that was restored
    pub backup_file: PathBuf,
    /// Total number of documents found in the backup
    pub total_documents: usize,
    /// Number of documents written back
    pub documents_restored: usize,
    /// Number of documents skipped because they already exist
    pub documents_skipped: usize,
    /// Entries that could not be read
    pub failed_documents: Vec<(String, String)>, // (entry name, error message)
}

/// Available subcommands for the omnidesk application
#[derive(Subcommand)]
pub enum Commands {
    /// Task operations
    Task {
        #[clap(subcommand)]
        action: TaskCommand,
    },

    /// Idea operations
    Idea {
        #[clap(subcommand)]
        action: IdeaCommand,
    },

    /// Domain operations
    Domain {
        #[clap(subcommand)]
        action: DomainCommand,
    },

    /// Idea folder operations
    Folder {
        #[clap(subcommand)]
        action: FolderCommand,
    },

    /// Calendar event operations
    Event {
        #[clap(subcommand)]
        action: EventCommand,
    },

    /// Inspect and manage deleted items
    Trash {
        #[clap(subcommand)]
        action: TrashCommand,
    },

    /// Show the kanban board
    Board,

    /// Search tasks and ideas by title and content
    Search {
        /// Search query text
        query: String,

        /// Limit the number of search results
        #[clap(short = 'n', long, default_value_t = 10)]
        limit: usize,

        /// Format output as JSON
        #[clap(short, long)]
        json: bool,
    },

    /// Application settings stored alongside the data
    Settings {
        /// Show current settings
        #[clap(short = 'S', long)]
        show: bool,

        /// Update a setting (key=value)
        #[clap(short, long)]
        set: Option<String>,

        /// Reset settings to defaults
        #[clap(short, long)]
        reset: bool,
    },

    /// Show backend and sync status
    Status,

    /// Flush queued changes and pull the latest data
    Sync,

    /// Create a backup of all collections
    Backup {
        /// Directory to write the backup into (default uses config setting)
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Restore collections from a backup
    Restore {
        /// Path to the backup file
        backup_file: PathBuf,

        /// Replace documents that already exist
        #[clap(short, long)]
        overwrite: bool,

        /// Skip confirmation prompt
        #[clap(short, long)]
        force: bool,
    },

    /// Run background maintenance until interrupted
    Daemon {
        /// Override the maintenance interval (in minutes)
        #[clap(short, long)]
        interval: Option<u32>,
    },
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Create a new task
    Add {
        /// Title of the task
        title: String,

        #[clap(short, long)]
        description: Option<String>,

        /// Write the description in the editor
        #[clap(short, long)]
        edit: bool,

        #[clap(long)]
        domain: Option<String>,

        /// Initial column (exploring, shaping, doing, done)
        #[clap(short, long)]
        state: Option<String>,

        /// Subtask titles (comma-separated)
        #[clap(long)]
        subtasks: Option<String>,
    },

    /// List tasks
    List {
        #[clap(short, long)]
        state: Option<String>,

        #[clap(long)]
        domain: Option<String>,

        #[clap(short, long)]
        json: bool,
    },

    /// View a task by ID
    View {
        id: String,

        #[clap(short, long)]
        json: bool,
    },

    /// Edit an existing task
    Edit {
        id: String,

        #[clap(short = 'T', long)]
        title: Option<String>,

        #[clap(short, long)]
        description: Option<String>,

        /// Edit the description in the editor
        #[clap(short, long)]
        edit: bool,

        #[clap(long, conflicts_with = "no_domain")]
        domain: Option<String>,

        /// Detach the task from its domain
        #[clap(long)]
        no_domain: bool,
    },

    /// Move a task to another column
    Move { id: String, state: String },

    /// Manage subtasks of a task
    Subtask {
        id: String,

        /// Add a subtask with this title
        #[clap(short, long)]
        add: Option<String>,

        /// Set a subtask's state (subtask_id=state)
        #[clap(short, long)]
        set: Option<String>,

        /// Remove a subtask by ID
        #[clap(short, long)]
        remove: Option<String>,
    },

    /// Move a task to the trash
    Delete {
        id: String,

        /// Skip confirmation prompt
        #[clap(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum IdeaCommand {
    /// Capture a new idea
    Add {
        title: String,

        /// First text note
        #[clap(short, long)]
        note: Option<String>,

        /// Write the first note in the editor
        #[clap(short, long)]
        edit: bool,

        /// Tags (comma-separated)
        #[clap(short = 't', long)]
        tags: Option<String>,

        #[clap(short, long)]
        folder: Option<String>,
    },

    /// List ideas
    List {
        #[clap(short, long)]
        tag: Option<String>,

        #[clap(short, long)]
        folder: Option<String>,

        #[clap(short, long)]
        json: bool,
    },

    /// View an idea with its notes and converted tasks
    View {
        id: String,

        #[clap(short, long)]
        json: bool,
    },

    /// Edit an idea
    Edit {
        id: String,

        #[clap(short = 'T', long)]
        title: Option<String>,

        /// Replace tags (comma-separated)
        #[clap(short = 't', long)]
        tags: Option<String>,

        #[clap(short, long, conflicts_with = "no_folder")]
        folder: Option<String>,

        #[clap(long)]
        no_folder: bool,
    },

    /// Append or remove notes
    Note {
        id: String,

        /// Append a text note
        #[clap(short, long)]
        add: Option<String>,

        /// Append a link note
        #[clap(short, long)]
        link: Option<String>,

        /// Remove a note by ID
        #[clap(short, long)]
        remove: Option<String>,
    },

    /// Create a task from an idea
    Convert {
        id: String,

        /// Task title (defaults to the idea title)
        #[clap(short = 'T', long)]
        title: Option<String>,

        #[clap(long)]
        domain: Option<String>,
    },

    /// Move an idea to the trash
    Delete {
        id: String,

        #[clap(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum DomainCommand {
    Add {
        name: String,

        #[clap(short, long, default_value = "#6b7280")]
        color: String,
    },
    List {
        #[clap(short, long)]
        json: bool,
    },
    Edit {
        id: String,

        #[clap(short, long)]
        name: Option<String>,

        #[clap(short, long)]
        color: Option<String>,
    },
    Delete {
        id: String,

        #[clap(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum FolderCommand {
    Add {
        name: String,

        #[clap(short, long)]
        color: Option<String>,

        /// Parent folder ID
        #[clap(short, long)]
        parent: Option<String>,
    },
    List {
        #[clap(short, long)]
        json: bool,
    },
    Edit {
        id: String,

        #[clap(short, long)]
        name: Option<String>,

        #[clap(short, long)]
        color: Option<String>,
    },
    Delete {
        id: String,

        #[clap(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum EventCommand {
    /// Schedule an event (times as RFC 3339, "YYYY-MM-DD HH:MM" or a date)
    Add {
        title: String,

        #[clap(short, long)]
        start: String,

        /// Defaults to one hour after the start
        #[clap(short, long)]
        end: Option<String>,

        #[clap(long)]
        all_day: bool,

        #[clap(short, long)]
        description: Option<String>,

        /// Related task ID
        #[clap(long)]
        task: Option<String>,

        /// Related idea ID
        #[clap(long)]
        idea: Option<String>,
    },

    /// List events in a window (defaults to the next seven days)
    List {
        #[clap(short, long)]
        from: Option<String>,

        #[clap(short, long)]
        to: Option<String>,

        #[clap(short, long)]
        json: bool,
    },

    Edit {
        id: String,

        #[clap(short = 'T', long)]
        title: Option<String>,

        #[clap(short, long)]
        start: Option<String>,

        #[clap(short, long)]
        end: Option<String>,
    },

    Delete {
        id: String,

        #[clap(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum TrashCommand {
    /// List deleted items with their expiration
    List {
        #[clap(short, long)]
        json: bool,
    },

    /// Put an item back where it came from
    Restore {
        /// Trash record ID
        id: String,
    },

    /// Delete one item for good
    Purge {
        id: String,

        #[clap(short, long)]
        force: bool,
    },

    /// Delete everything in the trash for good
    Empty {
        #[clap(short, long)]
        force: bool,
    },

    /// Purge items past their retention period
    Sweep,
}
