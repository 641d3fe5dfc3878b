//! In-memory board backed by a [`SnapshotStore`].
//!
//! Every mutation builds the next task list, re-indexes positions, saves the
//! whole snapshot and adopts what the store hands back. When the save fails
//! the in-memory state is left exactly as it was and an error notification
//! is queued instead.

use std::fmt;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::calendar::completed_tasks_for_day;
use crate::datastore::SnapshotStore;
use crate::datetime::{day_key, to_iso_string};
use crate::organize::{OrganizeOptions, OrganizedTasks, distinct_tags, organize};
use crate::sorting::compare_tasks;
use crate::task::{
    Board, BoardSnapshot, CustomFieldDefinition, CustomFieldDraft, DEFAULT_TASK_TITLE, Task, TaskDraft,
    TaskPatch, TaskStatus, normalize_tags,
};
use crate::timer::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    fn success(message: &str) -> Self {
        Self {
            level: NotificationLevel::Success,
            message: message.to_string(),
        }
    }

    fn error(message: &str) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One status column as shown on the board.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub status: TaskStatus,
    pub organized: OrganizedTasks,
    /// Tasks in the column before filtering.
    pub total: usize,
}

/// Assigns dense zero-based positions within each status column, following
/// the board comparator.
pub fn reindex_positions(tasks: &mut [Task]) {
    for status in TaskStatus::ALL {
        let mut column: Vec<usize> = (0..tasks.len())
            .filter(|&idx| tasks[idx].status == status)
            .collect();
        column.sort_by(|&a, &b| compare_tasks(&tasks[a], &tasks[b]));
        for (position, idx) in column.into_iter().enumerate() {
            tasks[idx].position = position as u32;
        }
    }
}

/// Sets the status and keeps the completion marker in step: entering
/// `completed` stamps it, leaving clears it.
fn apply_status(task: &mut Task, status: TaskStatus, now: DateTime<Utc>) {
    if task.status == status {
        return;
    }
    if status == TaskStatus::Completed {
        task.completed_at = Some(to_iso_string(now));
    } else if task.status == TaskStatus::Completed {
        task.completed_at = None;
    }
    task.status = status;
}

/// Appends `note` to `description` as a `• note` bullet on its own line.
pub fn append_note_bullet(description: &str, note: &str) -> String {
    let note = note.trim();
    if note.is_empty() {
        return description.to_string();
    }
    let bullet = format!("• {note}");
    let description = description.trim();
    if description.is_empty() {
        bullet
    } else {
        format!("{description}\n{bullet}")
    }
}

#[derive(Debug)]
pub struct BoardState<S: SnapshotStore> {
    store: S,
    snapshot: BoardSnapshot,
    notifications: Vec<Notification>,
}

impl<S: SnapshotStore> BoardState<S> {
    /// Loads the board. A failing store leaves an empty default board in
    /// memory and queues an error notification.
    #[tracing::instrument(skip(store, now))]
    pub fn open(mut store: S, now: DateTime<Utc>) -> Self {
        let mut notifications = vec![];
        let mut snapshot = match store.load(now) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to load board");
                notifications.push(Notification::error("Failed to load local board data"));
                BoardSnapshot::empty(now)
            }
        };
        reindex_positions(&mut snapshot.tasks);
        info!(
            board = %snapshot.board.id,
            tasks = snapshot.tasks.len(),
            fields = snapshot.custom_fields.len(),
            "opened board"
        );

        Self {
            store,
            snapshot,
            notifications,
        }
    }

    pub fn board(&self) -> &Board {
        &self.snapshot.board
    }

    pub fn tasks(&self) -> &[Task] {
        &self.snapshot.tasks
    }

    pub fn custom_fields(&self) -> &[CustomFieldDefinition] {
        &self.snapshot.custom_fields
    }

    pub fn snapshot(&self) -> &BoardSnapshot {
        &self.snapshot
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.snapshot.tasks.iter().find(|task| task.id == task_id)
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Resolves an exact id or a unique id prefix.
    pub fn resolve_task_id(&self, raw: &str) -> anyhow::Result<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("task id cannot be empty");
        }
        if let Some(task) = self.task(raw) {
            return Ok(task.id.clone());
        }

        let matches: Vec<&Task> = self
            .snapshot
            .tasks
            .iter()
            .filter(|task| task.id.starts_with(raw))
            .collect();
        match matches.as_slice() {
            [task] => Ok(task.id.clone()),
            [] => Err(anyhow!("no task matches id '{raw}'")),
            many => Err(anyhow!(
                "task id prefix '{raw}' is ambiguous ({} tasks match)",
                many.len()
            )),
        }
    }

    /// Resolves a custom field by exact id, unique id prefix or name.
    pub fn resolve_field_id(&self, raw: &str) -> anyhow::Result<String> {
        let raw = raw.trim();
        let fields = &self.snapshot.custom_fields;
        if let Some(field) = fields.iter().find(|f| f.id == raw) {
            return Ok(field.id.clone());
        }
        let by_name: Vec<&CustomFieldDefinition> = fields
            .iter()
            .filter(|f| f.name.eq_ignore_ascii_case(raw))
            .collect();
        if let [field] = by_name.as_slice() {
            return Ok(field.id.clone());
        }
        let by_prefix: Vec<&CustomFieldDefinition> = fields
            .iter()
            .filter(|f| !raw.is_empty() && f.id.starts_with(raw))
            .collect();
        match by_prefix.as_slice() {
            [field] => Ok(field.id.clone()),
            [] => Err(anyhow!("no custom field matches '{raw}'")),
            _ => Err(anyhow!("custom field '{raw}' is ambiguous")),
        }
    }

    fn task_or_err(&self, task_id: &str) -> anyhow::Result<&Task> {
        self.task(task_id)
            .ok_or_else(|| anyhow!("task not found: {task_id}"))
    }

    /// Saves `next` and adopts the stored result. On failure nothing in
    /// memory changes and `failure` is queued when given.
    fn persist(
        &mut self,
        mut next: BoardSnapshot,
        now: DateTime<Utc>,
        failure: Option<&str>,
    ) -> anyhow::Result<()> {
        reindex_positions(&mut next.tasks);
        match self.store.save(&next, now) {
            Ok(mut stored) => {
                reindex_positions(&mut stored.tasks);
                debug!(tasks = stored.tasks.len(), "applied stored board");
                self.snapshot = stored;
                Ok(())
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to save board");
                if let Some(message) = failure {
                    self.notifications.push(Notification::error(message));
                }
                Err(err).context("failed to save board")
            }
        }
    }

    fn with_tasks(&self, tasks: Vec<Task>) -> BoardSnapshot {
        BoardSnapshot {
            board: self.snapshot.board.clone(),
            tasks,
            custom_fields: self.snapshot.custom_fields.clone(),
        }
    }

    /// Reloads from the store. On failure the current state is kept.
    #[tracing::instrument(skip(self, now))]
    pub fn refresh(&mut self, now: DateTime<Utc>) -> anyhow::Result<&[Task]> {
        let mut snapshot = self.store.load(now).context("failed to refresh board")?;
        reindex_positions(&mut snapshot.tasks);
        self.snapshot = snapshot;
        Ok(&self.snapshot.tasks)
    }

    #[tracing::instrument(skip(self, draft, now))]
    pub fn create_task(&mut self, draft: TaskDraft, now: DateTime<Utc>) -> anyhow::Result<Task> {
        let title = draft
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TASK_TITLE);

        let mut task = Task::new(&self.snapshot.board.id, title, now);
        task.description = draft.description.unwrap_or_default();
        apply_status(&mut task, draft.status.unwrap_or_default(), now);
        task.priority = draft.priority.unwrap_or_default();
        task.due_date = draft.due_date.filter(|d| !d.trim().is_empty());
        task.scheduled_time = draft.scheduled_time.filter(|t| !t.trim().is_empty());
        task.estimated_minutes = draft.estimated_minutes;
        task.tags = normalize_tags(draft.tags.iter().map(String::as_str));
        task.assignee = draft.assignee.unwrap_or_default();
        task.custom_field_values = draft.custom_field_values;
        task.normalize();
        task.position = self
            .snapshot
            .tasks
            .iter()
            .filter(|t| t.status == task.status)
            .count() as u32;

        let mut tasks = self.snapshot.tasks.clone();
        tasks.push(task.clone());
        self.persist(self.with_tasks(tasks), now, Some("Failed to create task"))?;

        self.notifications.push(Notification::success("Task created"));
        info!(task = %task.id, title = %task.title, "created task");
        Ok(self.task(&task.id).cloned().unwrap_or(task))
    }

    #[tracing::instrument(skip(self, patch, now))]
    pub fn update_task(
        &mut self,
        task_id: &str,
        patch: TaskPatch,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Task> {
        let mut task = self.task_or_err(task_id)?.clone();

        if let Some(title) = patch.title.filter(|t| !t.trim().is_empty()) {
            task.title = title.trim().to_string();
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(status) = patch.status {
            apply_status(&mut task, status, now);
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(due_date) = patch.due_date {
            task.due_date = due_date.filter(|d| !d.trim().is_empty());
        }
        if let Some(scheduled_time) = patch.scheduled_time {
            task.scheduled_time = scheduled_time.filter(|t| !t.trim().is_empty());
        }
        if let Some(values) = patch.custom_field_values {
            task.custom_field_values = values;
        }
        if let Some(estimate) = patch.estimated_minutes {
            task.estimated_minutes = estimate;
        }
        if let Some(tags) = patch.tags {
            task.tags = tags;
        }
        if let Some(assignee) = patch.assignee {
            task.assignee = assignee;
        }
        if let Some(count) = patch.pomodoros_completed {
            task.pomodoros_completed = count;
        }
        task.normalize();
        task.updated_at = to_iso_string(now);

        let tasks = self
            .snapshot
            .tasks
            .iter()
            .map(|t| if t.id == task.id { task.clone() } else { t.clone() })
            .collect();
        self.persist(self.with_tasks(tasks), now, Some("Failed to update task"))?;

        debug!(task = %task.id, "updated task");
        Ok(self.task(&task.id).cloned().unwrap_or(task))
    }

    #[tracing::instrument(skip(self, now))]
    pub fn delete_task(&mut self, task_id: &str, now: DateTime<Utc>) -> anyhow::Result<Task> {
        let removed = self.task_or_err(task_id)?.clone();
        let tasks = self
            .snapshot
            .tasks
            .iter()
            .filter(|t| t.id != task_id)
            .cloned()
            .collect();
        self.persist(self.with_tasks(tasks), now, Some("Failed to delete task"))?;

        self.notifications.push(Notification::success("Task deleted"));
        info!(task = %removed.id, "deleted task");
        Ok(removed)
    }

    /// Moves a task to another column. Returns false, without saving, when
    /// the task is already there.
    #[tracing::instrument(skip(self, now))]
    pub fn move_task(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let task = self.task_or_err(task_id)?;
        if task.status == status {
            debug!(task = %task_id, %status, "task already in column");
            return Ok(false);
        }

        let mut moved = task.clone();
        apply_status(&mut moved, status, now);
        moved.position = self
            .snapshot
            .tasks
            .iter()
            .filter(|t| t.status == status && t.id != task_id)
            .count() as u32;
        moved.updated_at = to_iso_string(now);

        let tasks = self
            .snapshot
            .tasks
            .iter()
            .map(|t| if t.id == task_id { moved.clone() } else { t.clone() })
            .collect();
        self.persist(self.with_tasks(tasks), now, Some("Failed to move task"))?;

        info!(task = %task_id, %status, "moved task");
        Ok(true)
    }

    /// Replaces tasks by id with the given versions; unknown ids are ignored.
    #[tracing::instrument(skip(self, reordered, now), fields(count = reordered.len()))]
    pub fn reorder_tasks(&mut self, reordered: &[Task], now: DateTime<Utc>) -> anyhow::Result<()> {
        let tasks = self
            .snapshot
            .tasks
            .iter()
            .map(|task| {
                reordered
                    .iter()
                    .find(|r| r.id == task.id)
                    .unwrap_or(task)
                    .clone()
            })
            .collect();
        self.persist(self.with_tasks(tasks), now, None)
    }

    pub fn append_note(&mut self, task_id: &str, note: &str, now: DateTime<Utc>) -> anyhow::Result<Task> {
        let task = self.task_or_err(task_id)?;
        if note.trim().is_empty() {
            return Ok(task.clone());
        }
        let description = append_note_bullet(&task.description, note);
        let patch = TaskPatch {
            description: Some(description),
            ..TaskPatch::default()
        };
        self.update_task(task_id, patch, now)
    }

    #[tracing::instrument(skip(self, draft, now), fields(name = %draft.name))]
    pub fn create_custom_field(
        &mut self,
        draft: CustomFieldDraft,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CustomFieldDefinition> {
        let name = draft.name.trim();
        if name.is_empty() {
            bail!("custom field name cannot be empty");
        }

        let field = CustomFieldDefinition {
            id: Uuid::new_v4().to_string(),
            board_id: self.snapshot.board.id.clone(),
            name: name.to_string(),
            field_type: draft.field_type,
            options: draft.options,
            position: draft
                .position
                .unwrap_or(self.snapshot.custom_fields.len() as u32),
            created_at: to_iso_string(now),
        };

        let mut next = self.snapshot.clone();
        next.custom_fields.push(field.clone());
        self.persist(next, now, Some("Failed to create custom field"))?;

        self.notifications
            .push(Notification::success("Custom field created"));
        info!(field = %field.id, "created custom field");
        Ok(self
            .snapshot
            .custom_fields
            .iter()
            .find(|f| f.id == field.id)
            .cloned()
            .unwrap_or(field))
    }

    /// Drops the definition and every task's value for it.
    #[tracing::instrument(skip(self, now))]
    pub fn delete_custom_field(&mut self, field_id: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        if !self.snapshot.custom_fields.iter().any(|f| f.id == field_id) {
            bail!("custom field not found: {field_id}");
        }

        let mut next = self.snapshot.clone();
        next.custom_fields.retain(|f| f.id != field_id);
        for task in &mut next.tasks {
            task.custom_field_values.remove(field_id);
        }
        self.persist(next, now, Some("Failed to delete custom field"))?;

        self.notifications.push(Notification::success("Field deleted"));
        info!(field = %field_id, "deleted custom field");
        Ok(())
    }

    /// A timer started on a task; a task still in `todo` moves to
    /// `in_progress`.
    pub fn timer_started(&mut self, task_id: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let Some(status) = self.task(task_id).map(|task| task.status) else {
            warn!(task = %task_id, "timer started for unknown task");
            return Ok(false);
        };
        if status != TaskStatus::Todo {
            return Ok(false);
        }
        self.move_task(task_id, TaskStatus::InProgress, now)
    }

    /// Applies the answer to a timer's completion prompt.
    pub fn timer_decision(
        &mut self,
        task_id: &str,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let target = match resolution {
            Resolution::Completed => TaskStatus::Completed,
            Resolution::NotYet => TaskStatus::InProgress,
        };
        if self.task(task_id).is_none() {
            warn!(task = %task_id, "timer decision for unknown task");
            return Ok(false);
        }
        self.move_task(task_id, target, now)
    }

    /// Tasks completed on the current project-local day, in board order.
    pub fn completed_today(&self, now: DateTime<Utc>) -> Vec<Task> {
        completed_tasks_for_day(&self.snapshot.tasks, &day_key(now))
    }

    fn column_bases(&self, now: DateTime<Utc>) -> Vec<(TaskStatus, Vec<Task>)> {
        TaskStatus::ALL
            .into_iter()
            .map(|status| {
                let tasks = match status {
                    TaskStatus::Completed => self.completed_today(now),
                    _ => self
                        .snapshot
                        .tasks
                        .iter()
                        .filter(|t| t.status == status)
                        .cloned()
                        .collect(),
                };
                (status, tasks)
            })
            .collect()
    }

    /// Distinct tags across the visible columns.
    pub fn available_tags(&self, now: DateTime<Utc>) -> Vec<String> {
        let visible: Vec<Task> = self
            .column_bases(now)
            .into_iter()
            .flat_map(|(_, tasks)| tasks)
            .collect();
        distinct_tags(&visible)
    }

    /// The three columns, each filtered, sorted and optionally grouped.
    /// Selected tags that no visible task carries are ignored.
    pub fn columns(&self, options: &OrganizeOptions, now: DateTime<Utc>) -> Vec<Column> {
        let available = self.available_tags(now);
        let mut options = options.clone();
        options
            .filter
            .selected_tags
            .retain(|tag| available.iter().any(|a| a.eq_ignore_ascii_case(tag.trim())));

        self.column_bases(now)
            .into_iter()
            .map(|(status, tasks)| Column {
                status,
                total: tasks.len(),
                organized: organize(&tasks, &options),
            })
            .collect()
    }
}
