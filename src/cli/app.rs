//! CLI module for the omnidesk application
//!
//! This module turns parsed commands into calls on the [`AppState`]
//! coordinator and renders the results.
use std::{
    fs::{read_to_string, OpenOptions},
    io::{stdin, stdout, Write},
    path::{Path, PathBuf},
    process::Command,
};

use chrono::{Duration as ChronoDuration, Utc};
use console::style;
use log::info;
use serde::Serialize;
use shell_words::split;
use tempfile::Builder;

use crate::{
    content_preview, create_backup, parse_datetime, parse_tags, restore_backup, search,
    AppSettings, AppState, BackendKind, CalendarEventPatch, Commands, Config, DomainCommand,
    DomainPatch, Entity, EventCommand, ExpiryClass, FolderCommand, IdeaCommand, IdeaFolderPatch,
    IdeaPatch, MaintenanceScheduler, NewCalendarEvent, NewDomain, NewIdea, NewIdeaFolder, NewNote,
    NewTask, NoteKind, NoteOp, OmniError, Result, SubtaskOp, SubtaskState, Task, TaskCommand,
    TaskPatch, TaskState, TrashCommand,
};

/// Finds an item by exact id or by an unambiguous id prefix.
fn resolve<'a, T>(
    items: &'a [T],
    id_of: impl Fn(&T) -> &str,
    kind: &str,
    id: &str,
) -> Result<&'a T> {
    if let Some(item) = items.iter().find(|item| id_of(*item) == id) {
        return Ok(item);
    }
    let mut matches = items.iter().filter(|item| id_of(*item).starts_with(id));
    match (matches.next(), matches.next()) {
        (Some(item), None) if !id.is_empty() => Ok(item),
        (Some(_), Some(_)) => Err(OmniError::validation(format!(
            "{} id prefix '{}' is ambiguous",
            kind, id
        ))),
        _ => Err(OmniError::not_found(kind, id)),
    }
}

fn resolve_entity<'a, T: Entity>(items: &'a [T], id: &str) -> Result<&'a T> {
    resolve(items, |item| item.id(), T::KIND.label(), id)
}

fn parse_state(value: &str) -> Result<TaskState> {
    TaskState::from_id(&value.trim().to_lowercase()).ok_or_else(|| {
        OmniError::validation(format!(
            "unknown task state '{}', expected one of: exploring, shaping, doing, done",
            value
        ))
    })
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn term_width() -> usize {
    terminal_size::terminal_size()
        .map(|(w, _)| w.0 as usize)
        .unwrap_or(80)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Footer for the trash listing. Expired items only disappear when a sweep runs.
fn retention_notice(retention_days: u32, auto_purge: bool) -> String {
    let sweeper = if auto_purge {
        "`omnidesk trash sweep` or the maintenance daemon"
    } else {
        "`omnidesk trash sweep`"
    };
    format!(
        "Items stay restorable for {} days. Expired items are removed by {}.",
        retention_days, sweeper
    )
}

/// Drops the `<!-- ... -->` guidance lines written into the editor template.
fn strip_editor_comments(content: &str) -> String {
    content
        .lines()
        .filter(|line| !(line.trim_start().starts_with("<!--") && line.trim_end().ends_with("-->")))
        .collect::<Vec<&str>>()
        .join("\n")
        .trim()
        .to_string()
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N]: ", question);
    stdout().flush().map_err(OmniError::Io)?;

    let mut input = String::new();
    stdin().read_line(&mut input).map_err(OmniError::Io)?;

    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}

/// CLI Application handler - processes CLI commands against the application state
pub struct App {
    state: AppState,

    /// Application configuration
    config: Config,

    /// Whether to display verbose output
    verbose: bool,
}

impl App {
    pub fn new(state: AppState, config: Config, verbose: bool) -> Self {
        Self {
            state,
            config,
            verbose,
        }
    }

    /// Run the CLI application with the given command
    pub async fn run(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Task { action } => self.handle_task(action).await,
            Commands::Idea { action } => self.handle_idea(action).await,
            Commands::Domain { action } => self.handle_domain(action).await,
            Commands::Folder { action } => self.handle_folder(action).await,
            Commands::Event { action } => self.handle_event(action).await,
            Commands::Trash { action } => self.handle_trash(action).await,
            Commands::Board => {
                self.display_board();
                Ok(())
            }
            Commands::Search { query, limit, json } => self.handle_search(&query, limit, json),
            Commands::Settings { show, set, reset } => {
                self.handle_settings(show, set, reset).await
            }
            Commands::Status => {
                let reachable = self.state.check_connection().await;
                self.display_status(Some(reachable));
                Ok(())
            }
            Commands::Sync => {
                self.state.sync().await?;
                println!("{}", style("Synced.").green());
                self.display_status(None);
                Ok(())
            }
            Commands::Backup { output } => self.handle_backup(output).await,
            Commands::Restore {
                backup_file,
                overwrite,
                force,
            } => self.handle_restore(&backup_file, overwrite, force).await,
            Commands::Daemon { interval } => self.handle_daemon(interval).await,
        }
    }

    /// Releases subscriptions and closes the backend.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.state.shutdown().await
    }

    // -- editor ----------------------------------------------------------------

    fn open_editor(&self, title: &str, existing_content: &str) -> Result<String> {
        let temp_file = Builder::new().suffix(".md").tempfile()?;
        let temp_path = temp_file.path().to_path_buf();

        let editor_cmd = self.config.get_editor_command();
        self.write_editor_template(&temp_path, title, existing_content)?;

        info!("Opening editor. Save and exit when done...");
        self.launch_editor(&editor_cmd, &temp_path)?;

        let content = read_to_string(&temp_path)?;
        Ok(strip_editor_comments(&content))
    }

    fn write_editor_template(&self, path: &Path, title: &str, existing: &str) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;

        writeln!(file, "<!-- {} -->", title)?;
        writeln!(
            file,
            "<!-- Lines that start with <!-- and end with --> are ignored. -->"
        )?;
        writeln!(file, "<!-- Save and exit the editor when you're done. -->")?;
        if !existing.is_empty() {
            writeln!(file, "{}", existing)?;
        }
        Ok(())
    }

    fn launch_editor(&self, editor_cmd: &str, file_path: &Path) -> Result<()> {
        let path_str = file_path.to_string_lossy();

        let args = split(editor_cmd).map_err(|e| OmniError::EditorError {
            message: format!("Failed to parse editor command: {}", e),
        })?;

        let Some((program, rest)) = args.split_first() else {
            return Err(OmniError::EditorError {
                message: "Empty editor command".to_string(),
            });
        };

        let status = Command::new(program)
            .args(rest)
            .arg(path_str.as_ref())
            .status()?;

        if !status.success() {
            return Err(OmniError::EditorError {
                message: "Editor exited with non-zero status".to_string(),
            });
        }
        Ok(())
    }

    // -- tasks -----------------------------------------------------------------

    async fn handle_task(&mut self, action: TaskCommand) -> Result<()> {
        match action {
            TaskCommand::Add {
                title,
                description,
                edit,
                domain,
                state,
                subtasks,
            } => {
                let description = match (description, edit) {
                    (Some(d), _) => Some(d),
                    (None, true) => Some(self.open_editor(&title, "")?),
                    (None, false) => None,
                };
                let domain_id = match domain {
                    Some(id) => Some(resolve_entity(self.state.domains(), &id)?.id.clone()),
                    None => None,
                };
                let state = state.as_deref().map(parse_state).transpose()?;
                let subtasks = subtasks
                    .map(|s| {
                        s.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                let task = self
                    .state
                    .add_task(NewTask {
                        title,
                        description,
                        domain_id,
                        state: state.unwrap_or_default(),
                        subtasks,
                        idea_id: None,
                    })
                    .await?;
                println!("Task created with ID: {}", task.id);
            }

            TaskCommand::List {
                state,
                domain,
                json,
            } => {
                let state = state.as_deref().map(parse_state).transpose()?;
                let domain_id = match domain {
                    Some(id) => Some(resolve_entity(self.state.domains(), &id)?.id.clone()),
                    None => None,
                };
                let tasks: Vec<&Task> = self
                    .state
                    .tasks()
                    .iter()
                    .filter(|t| state.map_or(true, |s| t.state == s))
                    .filter(|t| domain_id.is_none() || t.domain_id == domain_id)
                    .collect();
                if json {
                    print_json(&tasks)?;
                } else if tasks.is_empty() {
                    println!("No tasks found.");
                } else {
                    for task in tasks {
                        self.display_task_line(task);
                    }
                }
            }

            TaskCommand::View { id, json } => {
                let task = resolve_entity(self.state.tasks(), &id)?;
                if json {
                    print_json(task)?;
                } else {
                    self.display_task(task);
                }
            }

            TaskCommand::Edit {
                id,
                title,
                description,
                edit,
                domain,
                no_domain,
            } => {
                let task = resolve_entity(self.state.tasks(), &id)?.clone();
                let description = match (description, edit) {
                    (Some(d), _) => Some(Some(d)),
                    (None, true) => {
                        let current = task.description.clone().unwrap_or_default();
                        let edited = self.open_editor(&task.title, &current)?;
                        Some((!edited.is_empty()).then_some(edited))
                    }
                    (None, false) => None,
                };
                let domain_id = match (domain, no_domain) {
                    (Some(id), _) => {
                        Some(Some(resolve_entity(self.state.domains(), &id)?.id.clone()))
                    }
                    (None, true) => Some(None),
                    (None, false) => None,
                };
                let updated = self
                    .state
                    .update_task(
                        &task.id,
                        TaskPatch {
                            title,
                            description,
                            domain_id,
                            ..Default::default()
                        },
                    )
                    .await?;
                println!("Task '{}' updated.", updated.title);
            }

            TaskCommand::Move { id, state } => {
                let task_id = resolve_entity(self.state.tasks(), &id)?.id.clone();
                let state = parse_state(&state)?;
                let task = self.state.move_task(&task_id, state).await?;
                println!(
                    "Task '{}' moved to {}.",
                    task.title,
                    style(self.state.settings().column_label(state)).bold()
                );
            }

            TaskCommand::Subtask {
                id,
                add,
                set,
                remove,
            } => {
                let task = resolve_entity(self.state.tasks(), &id)?.clone();
                let mut ops = Vec::new();
                if let Some(title) = add {
                    ops.push(SubtaskOp::Add { title });
                }
                if let Some(assignment) = set {
                    let (sub_id, value) = assignment.split_once('=').ok_or_else(|| {
                        OmniError::validation("expected subtask_id=state")
                    })?;
                    let subtask =
                        resolve(&task.subtasks, |s| s.id.as_str(), "subtask", sub_id.trim())?;
                    let state = SubtaskState::from_id(value.trim()).ok_or_else(|| {
                        OmniError::validation(format!(
                            "unknown subtask state '{}', expected exploring, shaping or done",
                            value
                        ))
                    })?;
                    ops.push(SubtaskOp::SetState {
                        id: subtask.id.clone(),
                        state,
                    });
                }
                if let Some(sub_id) = remove {
                    let subtask = resolve(&task.subtasks, |s| s.id.as_str(), "subtask", &sub_id)?;
                    ops.push(SubtaskOp::Remove {
                        id: subtask.id.clone(),
                    });
                }
                if ops.is_empty() {
                    self.display_task(&task);
                    return Ok(());
                }
                let updated = self
                    .state
                    .update_task(
                        &task.id,
                        TaskPatch {
                            subtasks: ops,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.display_task(&updated);
            }

            TaskCommand::Delete { id, force } => {
                let task = resolve_entity(self.state.tasks(), &id)?.clone();
                if !force {
                    println!("ID:      {}", task.id);
                    println!("Title:   {}", task.title);
                    println!("Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S"));
                    if !confirm("Move this task to the trash?")? {
                        println!("Deletion cancelled.");
                        return Ok(());
                    }
                }
                self.state.delete_task(&task.id).await?;
                self.report_trashed(&task.title);
            }
        }
        Ok(())
    }

    fn report_trashed(&self, title: &str) {
        println!(
            "'{}' moved to the trash. It can be restored for {} days.",
            title,
            self.state.settings().trash_retention_days
        );
    }

    fn domain_name(&self, domain_id: Option<&str>) -> Option<&str> {
        let id = domain_id?;
        self.state
            .domains()
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.name.as_str())
    }

    fn display_task_line(&self, task: &Task) {
        let done = task
            .subtasks
            .iter()
            .filter(|s| s.state == SubtaskState::Done)
            .count();
        let subtasks = if task.subtasks.is_empty() {
            String::new()
        } else {
            format!(" ({}/{})", done, task.subtasks.len())
        };
        let domain = self
            .domain_name(task.domain_id.as_deref())
            .map(|name| format!(" @{}", name))
            .unwrap_or_default();
        println!(
            "{}  {:<10} {}{}{}",
            style(short_id(&task.id)).dim(),
            self.state.settings().column_label(task.state),
            style(&task.title).bold(),
            style(subtasks).dim(),
            style(domain).cyan()
        );
    }

    fn display_task(&self, task: &Task) {
        println!("ID: {} | Created: {}", task.id, task.created_at.format("%Y-%m-%d %H:%M"));
        println!("Title: {}", style(&task.title).bold());
        println!("State: {}", self.state.settings().column_label(task.state));
        if let Some(name) = self.domain_name(task.domain_id.as_deref()) {
            println!("Domain: {}", style(name).cyan());
        }
        if let Some(idea_id) = &task.idea_id {
            let from = self
                .state
                .ideas()
                .iter()
                .find(|i| &i.id == idea_id)
                .map(|i| i.title.as_str())
                .unwrap_or("(idea no longer live)");
            println!("From idea: {}", from);
        }
        if let Some(description) = &task.description {
            println!("\n{}", description);
        }
        if !task.subtasks.is_empty() {
            println!("\nSubtasks:");
            for subtask in &task.subtasks {
                let mark = match subtask.state {
                    SubtaskState::Done => style("x").green(),
                    SubtaskState::Shaping => style("~").yellow(),
                    SubtaskState::Exploring => style(" ").dim(),
                };
                println!("  [{}] {} {}", mark, style(short_id(&subtask.id)).dim(), subtask.title);
            }
        }
    }

    fn display_board(&self) {
        let width = term_width().min(60);
        for (label, tasks) in self.state.board() {
            println!("{} ({})", style(label).bold().underlined(), tasks.len());
            for task in tasks {
                println!(
                    "  {} {}",
                    style(short_id(&task.id)).dim(),
                    content_preview(&task.title, width)
                );
            }
            println!();
        }
    }

    // -- ideas -----------------------------------------------------------------

    async fn handle_idea(&mut self, action: IdeaCommand) -> Result<()> {
        match action {
            IdeaCommand::Add {
                title,
                note,
                edit,
                tags,
                folder,
            } => {
                let note = match (note, edit) {
                    (Some(n), _) => Some(n),
                    (None, true) => Some(self.open_editor(&title, "")?),
                    (None, false) => None,
                };
                let folder_id = match folder {
                    Some(id) => Some(resolve_entity(self.state.idea_folders(), &id)?.id.clone()),
                    None => None,
                };
                let idea = self
                    .state
                    .add_idea(NewIdea {
                        title,
                        notes: note
                            .filter(|n| !n.trim().is_empty())
                            .map(|content| NewNote {
                                kind: NoteKind::Text,
                                content,
                            })
                            .into_iter()
                            .collect(),
                        tags: parse_tags(tags),
                        canvas_enabled: false,
                        folder_id,
                    })
                    .await?;
                println!("Idea created with ID: {}", idea.id);
            }

            IdeaCommand::List { tag, folder, json } => {
                let tag = tag.map(|t| t.trim().trim_start_matches('#').to_lowercase());
                let folder_id = match folder {
                    Some(id) => Some(resolve_entity(self.state.idea_folders(), &id)?.id.clone()),
                    None => None,
                };
                let ideas: Vec<_> = self
                    .state
                    .ideas()
                    .iter()
                    .filter(|i| tag.as_ref().map_or(true, |t| i.tags.contains(t)))
                    .filter(|i| folder_id.is_none() || i.folder_id == folder_id)
                    .collect();
                if json {
                    print_json(&ideas)?;
                    return Ok(());
                }
                if ideas.is_empty() {
                    println!("No ideas found.");
                }
                let width = term_width();
                for (n, idea) in ideas.iter().enumerate() {
                    if n > 0 {
                        println!("{}", "-".repeat(width.min(50)));
                    }
                    println!("{}  {}", style(short_id(&idea.id)).dim(), style(&idea.title).bold());
                    if !idea.tags.is_empty() {
                        let tags = idea
                            .tags
                            .iter()
                            .map(|tag| format!("#{}", tag))
                            .collect::<Vec<_>>()
                            .join(" ");
                        println!("Tags: {}", style(tags).cyan());
                    }
                    let preview = content_preview(&idea.body(), 100);
                    if !preview.is_empty() {
                        println!("{}", preview);
                    }
                }
            }

            IdeaCommand::View { id, json } => {
                let idea = resolve_entity(self.state.ideas(), &id)?;
                let converted = self.state.converted_tasks(&idea.id);
                if json {
                    print_json(idea)?;
                    return Ok(());
                }
                println!("ID: {} | Created: {}", idea.id, idea.created_at.format("%Y-%m-%d %H:%M"));
                println!("Title: {}", style(&idea.title).bold());
                if !idea.tags.is_empty() {
                    println!("Tags: {}", style(idea.tags.join(", ")).cyan());
                }
                for note in idea.ordered_notes() {
                    let marker = match note.kind {
                        NoteKind::Link => style("link").blue(),
                        NoteKind::Image => style("image").magenta(),
                        _ => style("note").dim(),
                    };
                    println!(
                        "\n[{} {}]\n{}",
                        marker,
                        style(short_id(&note.id)).dim(),
                        note.content
                    );
                }
                if !converted.is_empty() {
                    println!("\nConverted to:");
                    for task in converted {
                        self.display_task_line(task);
                    }
                }
            }

            IdeaCommand::Edit {
                id,
                title,
                tags,
                folder,
                no_folder,
            } => {
                let idea_id = resolve_entity(self.state.ideas(), &id)?.id.clone();
                let folder_id = match (folder, no_folder) {
                    (Some(id), _) => Some(Some(
                        resolve_entity(self.state.idea_folders(), &id)?.id.clone(),
                    )),
                    (None, true) => Some(None),
                    (None, false) => None,
                };
                let idea = self
                    .state
                    .update_idea(
                        &idea_id,
                        IdeaPatch {
                            title,
                            tags: tags.map(|t| parse_tags(Some(t))),
                            folder_id,
                            ..Default::default()
                        },
                    )
                    .await?;
                println!("Idea '{}' updated.", idea.title);
            }

            IdeaCommand::Note {
                id,
                add,
                link,
                remove,
            } => {
                let idea = resolve_entity(self.state.ideas(), &id)?.clone();
                let mut notes = Vec::new();
                if let Some(content) = add {
                    notes.push(NoteOp::Append {
                        kind: NoteKind::Text,
                        content,
                    });
                }
                if let Some(content) = link {
                    notes.push(NoteOp::Append {
                        kind: NoteKind::Link,
                        content,
                    });
                }
                if let Some(note_id) = remove {
                    let note = resolve(&idea.notes, |n| n.id.as_str(), "note", &note_id)?;
                    notes.push(NoteOp::Remove {
                        id: note.id.clone(),
                    });
                }
                if notes.is_empty() {
                    return Err(OmniError::validation(
                        "nothing to do, pass --add, --link or --remove",
                    ));
                }
                let updated = self
                    .state
                    .update_idea(
                        &idea.id,
                        IdeaPatch {
                            notes,
                            ..Default::default()
                        },
                    )
                    .await?;
                println!("Idea '{}' now has {} notes.", updated.title, updated.notes.len());
            }

            IdeaCommand::Convert { id, title, domain } => {
                let idea_id = resolve_entity(self.state.ideas(), &id)?.id.clone();
                let domain_id = match domain {
                    Some(id) => Some(resolve_entity(self.state.domains(), &id)?.id.clone()),
                    None => None,
                };
                let task = self
                    .state
                    .convert_idea_to_task(
                        &idea_id,
                        NewTask {
                            title: title.unwrap_or_default(),
                            domain_id,
                            ..Default::default()
                        },
                    )
                    .await?;
                println!("Task created with ID: {}", task.id);
            }

            IdeaCommand::Delete { id, force } => {
                let idea = resolve_entity(self.state.ideas(), &id)?.clone();
                if !force {
                    println!("ID:    {}", idea.id);
                    println!("Title: {}", idea.title);
                    println!("Notes: {}", idea.notes.len());
                    if !confirm("Move this idea to the trash?")? {
                        println!("Deletion cancelled.");
                        return Ok(());
                    }
                }
                self.state.delete_idea(&idea.id).await?;
                self.report_trashed(&idea.title);
            }
        }
        Ok(())
    }

    // -- domains and folders -----------------------------------------------------

    async fn handle_domain(&mut self, action: DomainCommand) -> Result<()> {
        match action {
            DomainCommand::Add { name, color } => {
                let domain = self.state.add_domain(NewDomain { name, color }).await?;
                println!("Domain created with ID: {}", domain.id);
            }
            DomainCommand::List { json } => {
                if json {
                    return print_json(self.state.domains());
                }
                for domain in self.state.domains() {
                    let count = self
                        .state
                        .tasks()
                        .iter()
                        .filter(|t| t.domain_id.as_deref() == Some(domain.id.as_str()))
                        .count();
                    println!(
                        "{}  {} {} ({} tasks)",
                        style(short_id(&domain.id)).dim(),
                        style(&domain.name).bold(),
                        style(&domain.color).dim(),
                        count
                    );
                }
            }
            DomainCommand::Edit { id, name, color } => {
                let domain_id = resolve_entity(self.state.domains(), &id)?.id.clone();
                let domain = self
                    .state
                    .update_domain(&domain_id, DomainPatch { name, color })
                    .await?;
                println!("Domain '{}' updated.", domain.name);
            }
            DomainCommand::Delete { id, force } => {
                let domain = resolve_entity(self.state.domains(), &id)?.clone();
                if !force && !confirm(&format!("Move domain '{}' to the trash?", domain.name))? {
                    println!("Deletion cancelled.");
                    return Ok(());
                }
                self.state.delete_domain(&domain.id).await?;
                self.report_trashed(&domain.name);
            }
        }
        Ok(())
    }

    async fn handle_folder(&mut self, action: FolderCommand) -> Result<()> {
        match action {
            FolderCommand::Add {
                name,
                color,
                parent,
            } => {
                let parent_id = match parent {
                    Some(id) => Some(resolve_entity(self.state.idea_folders(), &id)?.id.clone()),
                    None => None,
                };
                let folder = self
                    .state
                    .add_idea_folder(NewIdeaFolder {
                        name,
                        color,
                        parent_id,
                    })
                    .await?;
                println!("Folder created with ID: {}", folder.id);
            }
            FolderCommand::List { json } => {
                if json {
                    return print_json(self.state.idea_folders());
                }
                for folder in self.state.idea_folders() {
                    let count = self
                        .state
                        .ideas()
                        .iter()
                        .filter(|i| i.folder_id.as_deref() == Some(folder.id.as_str()))
                        .count();
                    println!(
                        "{}  {} ({} ideas)",
                        style(short_id(&folder.id)).dim(),
                        style(&folder.name).bold(),
                        count
                    );
                }
            }
            FolderCommand::Edit { id, name, color } => {
                let folder_id = resolve_entity(self.state.idea_folders(), &id)?.id.clone();
                let folder = self
                    .state
                    .update_idea_folder(
                        &folder_id,
                        IdeaFolderPatch {
                            name,
                            color: color.map(Some),
                            ..Default::default()
                        },
                    )
                    .await?;
                println!("Folder '{}' updated.", folder.name);
            }
            FolderCommand::Delete { id, force } => {
                let folder = resolve_entity(self.state.idea_folders(), &id)?.clone();
                if !force && !confirm(&format!("Move folder '{}' to the trash?", folder.name))? {
                    println!("Deletion cancelled.");
                    return Ok(());
                }
                self.state.delete_idea_folder(&folder.id).await?;
                self.report_trashed(&folder.name);
            }
        }
        Ok(())
    }

    // -- calendar ----------------------------------------------------------------

    async fn handle_event(&mut self, action: EventCommand) -> Result<()> {
        match action {
            EventCommand::Add {
                title,
                start,
                end,
                all_day,
                description,
                task,
                idea,
            } => {
                let starts_at = parse_datetime(&start)?;
                let ends_at = match end {
                    Some(end) => parse_datetime(&end)?,
                    None if all_day => starts_at + ChronoDuration::days(1),
                    None => starts_at + ChronoDuration::hours(1),
                };
                let task_id = match task {
                    Some(id) => Some(resolve_entity(self.state.tasks(), &id)?.id.clone()),
                    None => None,
                };
                let idea_id = match idea {
                    Some(id) => Some(resolve_entity(self.state.ideas(), &id)?.id.clone()),
                    None => None,
                };
                let event = self
                    .state
                    .add_calendar_event(NewCalendarEvent {
                        all_day,
                        description,
                        task_id,
                        idea_id,
                        ..NewCalendarEvent::new(title, starts_at, ends_at)
                    })
                    .await?;
                println!("Event created with ID: {}", event.id);
            }
            EventCommand::List { from, to, json } => {
                let from = match from {
                    Some(s) => parse_datetime(&s)?,
                    None => Utc::now(),
                };
                let to = match to {
                    Some(s) => parse_datetime(&s)?,
                    None => from + ChronoDuration::days(7),
                };
                let events = self.state.events_between(from, to);
                if json {
                    return print_json(&events);
                }
                if events.is_empty() {
                    println!(
                        "No events between {} and {}.",
                        from.format("%Y-%m-%d"),
                        to.format("%Y-%m-%d")
                    );
                }
                for event in events {
                    let when = if event.all_day {
                        event.starts_at.format("%a %Y-%m-%d (all day)").to_string()
                    } else {
                        format!(
                            "{} - {}",
                            event.starts_at.format("%a %Y-%m-%d %H:%M"),
                            event.ends_at.format("%H:%M")
                        )
                    };
                    println!(
                        "{}  {}  {}",
                        style(short_id(&event.id)).dim(),
                        style(when).cyan(),
                        style(&event.title).bold()
                    );
                }
            }
            EventCommand::Edit {
                id,
                title,
                start,
                end,
            } => {
                let event_id = resolve_entity(self.state.calendar_events(), &id)?.id.clone();
                let event = self
                    .state
                    .update_calendar_event(
                        &event_id,
                        CalendarEventPatch {
                            title,
                            starts_at: start.as_deref().map(parse_datetime).transpose()?,
                            ends_at: end.as_deref().map(parse_datetime).transpose()?,
                            ..Default::default()
                        },
                    )
                    .await?;
                println!("Event '{}' updated.", event.title);
            }
            EventCommand::Delete { id, force } => {
                let event = resolve_entity(self.state.calendar_events(), &id)?.clone();
                if !force && !confirm(&format!("Move event '{}' to the trash?", event.title))? {
                    println!("Deletion cancelled.");
                    return Ok(());
                }
                self.state.delete_calendar_event(&event.id).await?;
                self.report_trashed(&event.title);
            }
        }
        Ok(())
    }

    // -- trash -------------------------------------------------------------------

    async fn handle_trash(&mut self, action: TrashCommand) -> Result<()> {
        match action {
            TrashCommand::List { json } => {
                let mut entries = self.state.trash_entries(Utc::now());
                entries.sort_by(|a, b| b.0.deleted_at.cmp(&a.0.deleted_at));
                if json {
                    let items: Vec<_> = entries.iter().map(|(item, _)| *item).collect();
                    return print_json(&items);
                }
                if entries.is_empty() {
                    println!("Trash is empty.");
                    return Ok(());
                }
                for (item, expiration) in entries {
                    let left = match expiration.class {
                        ExpiryClass::Expiring => style("expired".to_string()).red().bold(),
                        ExpiryClass::Urgent => {
                            style(format!("{} days left", expiration.days_left)).yellow()
                        }
                        ExpiryClass::Normal => {
                            style(format!("{} days left", expiration.days_left)).dim()
                        }
                    };
                    println!(
                        "{}  {:<15} {}  {}",
                        style(short_id(&item.id)).dim(),
                        item.kind.label(),
                        style(item.title()).bold(),
                        left
                    );
                }
                println!(
                    "\n{}",
                    retention_notice(
                        self.state.settings().trash_retention_days,
                        self.config.auto_purge_expired
                    )
                );
            }
            TrashCommand::Restore { id } => {
                let trash_id = resolve(self.state.trash(), |t| t.id.as_str(), "trash item", &id)?
                    .id
                    .clone();
                let record = self.state.restore_from_trash(&trash_id).await?;
                println!("Restored {} '{}'.", record.kind, record.title());
            }
            TrashCommand::Purge { id, force } => {
                let item =
                    resolve(self.state.trash(), |t| t.id.as_str(), "trash item", &id)?.clone();
                if !force {
                    println!("This action cannot be undone!");
                    if !confirm(&format!("Permanently delete {} '{}'?", item.kind, item.title()))? {
                        println!("Deletion cancelled.");
                        return Ok(());
                    }
                }
                self.state.permanently_delete(&item.id).await?;
                println!("'{}' has been permanently deleted.", item.title());
            }
            TrashCommand::Empty { force } => {
                let count = self.state.trash().len();
                if count == 0 {
                    println!("Trash is already empty.");
                    return Ok(());
                }
                if !force {
                    println!("This action cannot be undone!");
                    if !confirm(&format!("Permanently delete all {} items in the trash?", count))? {
                        println!("Cancelled.");
                        return Ok(());
                    }
                }
                let removed = self.state.empty_trash().await?;
                println!("Removed {} items from the trash.", removed);
            }
            TrashCommand::Sweep => {
                let purged = self.state.sweep_expired_trash(Utc::now()).await?;
                if purged.is_empty() {
                    println!("Nothing has expired.");
                }
                for item in &purged {
                    println!("Purged expired {} '{}'.", item.kind, item.title());
                }
            }
        }
        Ok(())
    }

    // -- search, settings, status ------------------------------------------------

    fn handle_search(&self, query: &str, limit: usize, json: bool) -> Result<()> {
        let hits = search(self.state.snapshot(), query, limit);
        if json {
            return print_json(&hits);
        }
        if hits.is_empty() {
            println!("Nothing found matching query: \"{}\"", query);
            return Ok(());
        }
        for hit in &hits {
            print!(
                "{}  {:<15} {}",
                style(short_id(&hit.id)).dim(),
                hit.kind.label(),
                style(&hit.title).bold()
            );
            if self.verbose {
                print!("  {}", style(format!("score {}", hit.score)).dim());
            }
            println!();
        }
        if hits.len() == limit {
            println!("\nShowing the first {} results. Use --limit to show more.", limit);
        }
        Ok(())
    }

    async fn handle_settings(
        &mut self,
        show: bool,
        set: Option<String>,
        reset: bool,
    ) -> Result<()> {
        let show = show || (set.is_none() && !reset);
        if reset {
            if !confirm("Reset all settings to defaults?")? {
                println!("Cancelled.");
                return Ok(());
            }
            self.state.replace_settings(AppSettings::default()).await?;
            println!("Settings reset.");
        }
        if let Some(assignment) = set {
            let mut settings = self.state.settings().clone();
            settings.set_from_str(&assignment)?;
            self.state.replace_settings(settings).await?;
            println!("Updated {}.", assignment.split('=').next().unwrap_or_default().trim());
        }
        if show {
            print_json(self.state.settings())?;
        }
        Ok(())
    }

    /// `reachable` is the result of a fresh health check, when one was made.
    fn display_status(&self, reachable: Option<bool>) {
        let status = self.state.sync_status();
        let backend = self.state.storage().backend();
        let connection = match backend {
            BackendKind::Local => style("local only"),
            BackendKind::Remote if status.is_online => style("online").green(),
            BackendKind::Remote => style("offline").red(),
        };
        println!("Backend:   {} ({})", backend, connection);
        if let (BackendKind::Remote, Some(reachable)) = (backend, reachable) {
            let answer = if reachable {
                style("yes").green()
            } else {
                style("no").red()
            };
            println!("Reachable: {}", answer);
        }
        println!("Data dir:  {}", self.config.data_dir.display());
        if status.pending_changes > 0 {
            println!(
                "Pending:   {}",
                style(format!("{} change batches", status.pending_changes)).yellow()
            );
        }
        if status.is_syncing {
            println!("Syncing:   yes");
        }
        match status.last_synced_at {
            Some(at) => println!("Synced:    {}", at.format("%Y-%m-%d %H:%M:%S")),
            None => println!("Synced:    never"),
        }
        let snapshot = self.state.snapshot();
        println!(
            "Contents:  {} tasks, {} ideas, {} domains, {} folders, {} events",
            snapshot.tasks.len(),
            snapshot.ideas.len(),
            snapshot.domains.len(),
            snapshot.idea_folders.len(),
            snapshot.calendar_events.len()
        );
        let now = Utc::now();
        let entries = self.state.trash_entries(now);
        let expiring = entries
            .iter()
            .filter(|(_, e)| e.is_expiring_soon())
            .count();
        println!("Trash:     {} items ({} expiring soon)", entries.len(), expiring);
    }

    // -- backup --------------------------------------------------------------------

    async fn handle_backup(&self, output: Option<PathBuf>) -> Result<()> {
        let dir = output.unwrap_or_else(|| self.config.backup_dir.clone());
        let path = create_backup(
            self.state.storage().store().as_ref(),
            &dir,
            self.config.max_backups,
        )
        .await?;
        println!("Backup written to {}", path.display());
        Ok(())
    }

    async fn handle_restore(
        &mut self,
        backup_file: &Path,
        overwrite: bool,
        force: bool,
    ) -> Result<()> {
        if !force {
            let question = if overwrite {
                "Restore this backup, replacing existing items with the same ID?"
            } else {
                "Restore this backup, keeping existing items?"
            };
            if !confirm(question)? {
                println!("Restore cancelled.");
                return Ok(());
            }
        }
        let summary =
            restore_backup(self.state.storage().store().as_ref(), backup_file, overwrite).await?;
        self.state.load().await?;

        println!(
            "Restored {} of {} documents ({} skipped).",
            summary.documents_restored, summary.total_documents, summary.documents_skipped
        );
        for (name, error) in &summary.failed_documents {
            println!("  {} {}: {}", style("failed").red(), name, error);
        }
        Ok(())
    }

    async fn handle_daemon(&mut self, interval: Option<u32>) -> Result<()> {
        let mut config = self.config.clone();
        if let Some(minutes) = interval {
            config.maintenance_interval_minutes = minutes.max(1);
        }
        let mut scheduler = MaintenanceScheduler::new(config, self.state.storage());
        scheduler.start()?;
        scheduler.run_now().await?;
        println!("Maintenance running. Press Ctrl+C to stop.");

        tokio::signal::ctrl_c().await?;
        scheduler.stop().await?;
        let status = scheduler.get_status();
        if let Some(at) = status.last_run_time {
            println!("Last pass at {}", at.format("%Y-%m-%d %H:%M:%S"));
        }
        Ok(())
    }
}
