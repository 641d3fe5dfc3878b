use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::board::BoardState;
use crate::calendar::{build_day_keys, group_completed_by_day};
use crate::cli::{
    AddArgs, BoardArgs, Command, EditArgs, FieldCommand, FocusCommand, KeyVal, TaskFieldArgs,
    TaskTimerCommand, TimerCommand, WorkspaceCommand,
};
use crate::config::Config;
use crate::datastore::{JsonFileStore, SnapshotStore};
use crate::focus::{COMPLETION_DETAIL, COMPLETION_MESSAGE, FocusTimer};
use crate::organize::{OrganizeOptions, TaskFilter};
use crate::render::{Renderer, TimerRow, short_id};
use crate::storage::{FileKeyValueStore, KeyValueStore, LOCAL_STORAGE_FILE_NAME};
use crate::task::{
    CustomFieldDraft, CustomFieldType, CustomValue, Task, TaskDraft, TaskPatch, TaskStatus,
};
use crate::timer::{
    Resolution, StartOutcome, TimerPhase, TimerScheduler, ToggleOutcome, format_clock,
};

/// The board and its timers, opened from one data directory.
pub struct Workspace {
    pub board: BoardState<JsonFileStore>,
    pub timers: TimerScheduler<FileKeyValueStore>,
}

impl Workspace {
    #[instrument(skip(cfg, data_dir, now))]
    pub fn open(cfg: &Config, data_dir: &Path, now: DateTime<Utc>) -> anyhow::Result<Self> {
        let store = JsonFileStore::open(data_dir)
            .with_context(|| format!("failed to open datastore at {}", data_dir.display()))?;
        let board = BoardState::open(store, now);

        let kv = open_local_storage(data_dir)?;
        let timers = TimerScheduler::open(kv, cfg.timer.default_minutes, now);

        Ok(Self { board, timers })
    }

    fn task(&self, task_id: &str) -> anyhow::Result<Task> {
        self.board
            .task(task_id)
            .cloned()
            .ok_or_else(|| anyhow!("task not found: {task_id}"))
    }
}

fn open_local_storage(data_dir: &Path) -> anyhow::Result<FileKeyValueStore> {
    let path = data_dir.join(LOCAL_STORAGE_FILE_NAME);
    FileKeyValueStore::open(&path)
        .with_context(|| format!("failed to open {}", path.display()))
}

#[instrument(skip(command, cfg, data_dir, renderer, now))]
pub fn dispatch(
    command: Command,
    cfg: &Config,
    data_dir: &Path,
    renderer: &mut Renderer,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    match command {
        Command::Focus { action } => cmd_focus(cfg, data_dir, renderer, action, now),
        Command::Workspace(command) => dispatch_workspace(command, cfg, data_dir, renderer, now),
    }
}

fn dispatch_workspace(
    command: WorkspaceCommand,
    cfg: &Config,
    data_dir: &Path,
    renderer: &mut Renderer,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let mut ws = Workspace::open(cfg, data_dir, now)?;
    report_elapsed_timers(&mut ws, renderer, now)?;

    debug!(?command, "dispatching command");
    let result = match command {
        WorkspaceCommand::Board(args) => cmd_board(&ws, renderer, &args, now),
        WorkspaceCommand::Add(args) => cmd_add(&mut ws, args, now),
        WorkspaceCommand::Edit(args) => cmd_edit(&mut ws, args, now),
        WorkspaceCommand::Move { id, status } => cmd_move(&mut ws, &id, status, now),
        WorkspaceCommand::Show { id } => cmd_show(&ws, renderer, &id),
        WorkspaceCommand::Delete { id } => cmd_delete(&mut ws, &id, now),
        WorkspaceCommand::Note { id, text } => cmd_note(&mut ws, &id, &text.join(" "), now),
        WorkspaceCommand::Tags => renderer.print_lines(ws.board.available_tags(now)),
        WorkspaceCommand::Calendar { days } => cmd_calendar(&ws, cfg, renderer, days, now),
        WorkspaceCommand::Field { action } => cmd_field(&mut ws, renderer, action, now),
        WorkspaceCommand::Timer {
            action: TimerCommand::Status { id },
        } => timer_status(&ws, renderer, id.as_deref()),
        WorkspaceCommand::Timer {
            action: TimerCommand::Task(action),
        } => cmd_timer(&mut ws, action, now),
    };

    renderer.notify(&ws.board.take_notifications())?;
    result
}

/// Timers are only ticked when the CLI runs, so report anything that ran out
/// since the last invocation.
fn report_elapsed_timers(
    ws: &mut Workspace,
    renderer: &mut Renderer,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let mut finished = ws.timers.tick(now);
    for id in ws.timers.awaiting_decision() {
        if !finished.contains(&id) {
            finished.push(id);
        }
    }

    for id in finished {
        if let Some(task) = ws.board.task(&id) {
            renderer.print_finished_timer(task)?;
        }
    }
    Ok(())
}

#[instrument(skip(ws, renderer, args, now))]
fn cmd_board(
    ws: &Workspace,
    renderer: &mut Renderer,
    args: &BoardArgs,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let options = OrganizeOptions {
        filter: TaskFilter {
            query: args.search.clone().unwrap_or_default(),
            selected_tags: args.tags.clone(),
        },
        sort_by: args.sort.unwrap_or_default(),
        group_by: args.group.unwrap_or_default(),
    };
    let columns = ws.board.columns(&options, now);
    renderer.print_board(&columns, &ws.timers.active_timers(), now)
}

/// Resolves `FIELD=VALUE` pairs against the board's custom fields. An empty
/// value means "clear".
fn resolve_custom_values(
    ws: &Workspace,
    pairs: &[KeyVal],
) -> anyhow::Result<Vec<(String, Option<CustomValue>)>> {
    pairs
        .iter()
        .map(|pair| {
            let field_id = ws.board.resolve_field_id(&pair.key)?;
            let field = ws
                .board
                .custom_fields()
                .iter()
                .find(|f| f.id == field_id)
                .ok_or_else(|| anyhow!("custom field not found: {}", pair.key))?;

            if pair.value.is_empty() {
                return Ok((field_id, None));
            }

            let value = match field.field_type {
                CustomFieldType::Number => {
                    let number: f64 = pair
                        .value
                        .parse()
                        .ok()
                        .filter(|n: &f64| n.is_finite())
                        .ok_or_else(|| anyhow!("field '{}' expects a number", field.name))?;
                    CustomValue::Number(number)
                }
                CustomFieldType::Dropdown => {
                    let option = field
                        .options
                        .iter()
                        .find(|opt| opt.eq_ignore_ascii_case(&pair.value))
                        .ok_or_else(|| {
                            anyhow!(
                                "'{}' is not an option of '{}' (choose from: {})",
                                pair.value,
                                field.name,
                                field.options.join(", ")
                            )
                        })?;
                    CustomValue::Text(option.clone())
                }
                CustomFieldType::Text => CustomValue::Text(pair.value.clone()),
            };
            Ok((field_id, Some(value)))
        })
        .collect()
}

fn merge_custom_values(
    base: &BTreeMap<String, CustomValue>,
    updates: Vec<(String, Option<CustomValue>)>,
) -> BTreeMap<String, CustomValue> {
    let mut merged = base.clone();
    for (key, value) in updates {
        match value {
            Some(value) => {
                merged.insert(key, value);
            }
            None => {
                merged.remove(&key);
            }
        }
    }
    merged
}

fn positive_estimate(minutes: Option<f64>) -> anyhow::Result<Option<f64>> {
    match minutes {
        Some(m) if !m.is_finite() || m <= 0.0 => bail!("estimate must be a positive number of minutes"),
        other => Ok(other),
    }
}

#[instrument(skip(ws, args, now))]
fn cmd_add(ws: &mut Workspace, args: AddArgs, now: DateTime<Utc>) -> anyhow::Result<()> {
    let AddArgs { title, fields } = args;
    let custom = resolve_custom_values(ws, &fields.custom_values)?;
    let TaskFieldArgs {
        description,
        status,
        priority,
        due,
        scheduled_time,
        estimated_minutes,
        tags,
        assignee,
        ..
    } = fields;

    let title = title.join(" ");
    let draft = TaskDraft {
        title: (!title.trim().is_empty()).then_some(title),
        description,
        status,
        priority,
        due_date: due,
        scheduled_time,
        estimated_minutes: positive_estimate(estimated_minutes)?,
        tags,
        assignee,
        custom_field_values: merge_custom_values(&BTreeMap::new(), custom),
    };

    let task = ws.board.create_task(draft, now)?;
    ws.timers.sync_duration(&task.id, task.estimate());
    println!("Created task {} {}", short_id(&task.id), task.title);
    Ok(())
}

#[instrument(skip(ws, args, now))]
fn cmd_edit(ws: &mut Workspace, args: EditArgs, now: DateTime<Utc>) -> anyhow::Result<()> {
    let id = ws.board.resolve_task_id(&args.id)?;
    let existing = ws.task(&id)?;
    let custom = resolve_custom_values(ws, &args.fields.custom_values)?;
    let fields = args.fields;

    let mut patch = TaskPatch {
        title: args.title,
        description: fields.description,
        status: fields.status,
        priority: fields.priority,
        assignee: fields.assignee,
        ..TaskPatch::default()
    };

    if args.clear_due {
        patch.due_date = Some(None);
    } else if let Some(due) = fields.due {
        patch.due_date = Some(Some(due));
    }
    if args.clear_time {
        patch.scheduled_time = Some(None);
    } else if let Some(at) = fields.scheduled_time {
        patch.scheduled_time = Some(Some(at));
    }
    if args.clear_estimate {
        patch.estimated_minutes = Some(None);
    } else if let Some(minutes) = positive_estimate(fields.estimated_minutes)? {
        patch.estimated_minutes = Some(Some(minutes));
    }
    if args.clear_tags || !fields.tags.is_empty() {
        let mut tags = if args.clear_tags {
            vec![]
        } else {
            existing.tags.clone()
        };
        tags.extend(fields.tags);
        patch.tags = Some(tags);
    }
    if !custom.is_empty() {
        patch.custom_field_values = Some(merge_custom_values(&existing.custom_field_values, custom));
    }

    let task = ws.board.update_task(&id, patch, now)?;
    if ws.timers.timer(&id).is_some() {
        ws.timers.sync_duration(&id, task.estimate());
    }
    println!("Updated task {} {}", short_id(&task.id), task.title);
    Ok(())
}

#[instrument(skip(ws, now))]
fn cmd_move(
    ws: &mut Workspace,
    raw_id: &str,
    status: TaskStatus,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let id = ws.board.resolve_task_id(raw_id)?;
    let title = ws.task(&id)?.title;
    if ws.board.move_task(&id, status, now)? {
        println!("Moved '{title}' to {}", status.title());
    } else {
        println!("'{title}' is already in {}", status.title());
    }
    Ok(())
}

fn cmd_show(ws: &Workspace, renderer: &mut Renderer, raw_id: &str) -> anyhow::Result<()> {
    let id = ws.board.resolve_task_id(raw_id)?;
    let task = ws.task(&id)?;
    renderer.print_task_info(&task, ws.board.custom_fields(), ws.timers.timer(&id))
}

#[instrument(skip(ws, now))]
fn cmd_delete(ws: &mut Workspace, raw_id: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
    let id = ws.board.resolve_task_id(raw_id)?;
    let removed = ws.board.delete_task(&id, now)?;
    ws.timers.remove(&id);
    info!(task = %id, "deleted task and its timer");
    println!("Deleted '{}'", removed.title);
    Ok(())
}

fn cmd_note(ws: &mut Workspace, raw_id: &str, note: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
    let id = ws.board.resolve_task_id(raw_id)?;
    if note.trim().is_empty() {
        bail!("note text cannot be empty");
    }
    let task = ws.board.append_note(&id, note, now)?;
    println!("Added note to '{}'", task.title);
    Ok(())
}

fn cmd_calendar(
    ws: &Workspace,
    cfg: &Config,
    renderer: &mut Renderer,
    days: Option<usize>,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let days = days.unwrap_or(cfg.calendar.days);
    if days == 0 {
        bail!("--days must be at least 1");
    }
    let day_keys = build_day_keys(now, days);
    let grouped = group_completed_by_day(ws.board.tasks(), &day_keys);
    renderer.print_calendar(&day_keys, &grouped)
}

#[instrument(skip(ws, renderer, action, now))]
fn cmd_field(
    ws: &mut Workspace,
    renderer: &mut Renderer,
    action: FieldCommand,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    match action {
        FieldCommand::List => renderer.print_fields(ws.board.custom_fields()),
        FieldCommand::Add {
            name,
            field_type,
            options,
        } => {
            if field_type == CustomFieldType::Dropdown && options.is_empty() {
                bail!("dropdown fields need at least one --option");
            }
            let field = ws.board.create_custom_field(
                CustomFieldDraft {
                    name,
                    field_type,
                    options,
                    position: None,
                },
                now,
            )?;
            println!("Created field {} {}", short_id(&field.id), field.name);
            Ok(())
        }
        FieldCommand::Delete { field } => {
            let id = ws.board.resolve_field_id(&field)?;
            ws.board.delete_custom_field(&id, now)
        }
    }
}

#[instrument(skip(ws, action, now))]
fn cmd_timer(ws: &mut Workspace, action: TaskTimerCommand, now: DateTime<Utc>) -> anyhow::Result<()> {
    let id = ws.board.resolve_task_id(action.task_id())?;
    let task = ws.task(&id)?;
    ws.timers.sync_duration(&id, task.estimate());

    match action {
        TaskTimerCommand::Start { .. } => {
            let outcome = ws.timers.start(&id, now);
            report_start(ws, &task, outcome, now)?;
        }
        TaskTimerCommand::Pause { .. } => {
            if ws.timers.pause(&id, now) {
                println!("Paused '{}' at {}", task.title, timer_display(ws, &id));
            } else {
                println!("Timer for '{}' is not running", task.title);
            }
        }
        TaskTimerCommand::Toggle { .. } => match ws.timers.toggle(&id, now) {
            ToggleOutcome::Paused => {
                println!("Paused '{}' at {}", task.title, timer_display(ws, &id));
            }
            ToggleOutcome::Started(outcome) => report_start(ws, &task, outcome, now)?,
        },
        TaskTimerCommand::Reset { .. } => {
            ws.timers.reset(&id);
            println!("Reset timer for '{}' to {}", task.title, timer_display(ws, &id));
        }
        TaskTimerCommand::Done { .. } => {
            apply_timer_decision(&mut ws.board, &mut ws.timers, &id, true, now)?;
            println!("Marked '{}' completed", task.title);
        }
        TaskTimerCommand::NotYet { .. } => {
            apply_timer_decision(&mut ws.board, &mut ws.timers, &id, false, now)?;
            println!("Keeping '{}' in progress", task.title);
        }
        TaskTimerCommand::Dismiss { .. } => {
            ws.timers.dismiss_prompt(&id);
            println!("Dismissed prompt for '{}'", task.title);
        }
    }
    Ok(())
}

/// Moves the task first; the timer only goes back to idle once the board has
/// saved, so a failed save keeps the completion prompt open.
fn apply_timer_decision<S: SnapshotStore, K: KeyValueStore>(
    board: &mut BoardState<S>,
    timers: &mut TimerScheduler<K>,
    task_id: &str,
    completed: bool,
    now: DateTime<Utc>,
) -> anyhow::Result<Resolution> {
    let resolution = Resolution::from_completed(completed);
    board.timer_decision(task_id, resolution, now)?;
    Ok(timers.resolve(task_id, completed))
}

fn timer_display(ws: &Workspace, task_id: &str) -> String {
    ws.timers.display(task_id).unwrap_or_default()
}

fn report_start(
    ws: &mut Workspace,
    task: &Task,
    outcome: StartOutcome,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let clock = timer_display(ws, &task.id);
    match outcome {
        StartOutcome::FirstStart => {
            if ws.board.timer_started(&task.id, now)? {
                println!("Moved '{}' to {}", task.title, TaskStatus::InProgress.title());
            }
            println!("Started '{}' ({clock})", task.title);
        }
        StartOutcome::Resumed => println!("Resumed '{}' ({clock} left)", task.title),
        StartOutcome::AlreadyRunning => println!("'{}' is already running ({clock} left)", task.title),
        StartOutcome::AwaitingDecision => {
            let short = short_id(&task.id);
            println!(
                "Timer for '{}' has finished; answer with `kanflow timer done {short}` or `kanflow timer not-yet {short}`",
                task.title
            );
        }
    }
    Ok(())
}

fn timer_status(ws: &Workspace, renderer: &mut Renderer, raw_id: Option<&str>) -> anyhow::Result<()> {
    let ids: Vec<String> = match raw_id {
        Some(raw) => vec![ws.board.resolve_task_id(raw)?],
        None => ws
            .timers
            .timers()
            .filter(|(_, timer)| timer.phase() != TimerPhase::Idle)
            .map(|(id, _)| id.clone())
            .collect(),
    };

    let rows: Vec<TimerRow> = ids
        .into_iter()
        .filter_map(|id| {
            let task = ws.board.task(&id)?;
            let timer = ws.timers.timer(&id)?.clone();
            Some(TimerRow {
                title: task.title.clone(),
                task_id: id,
                timer,
            })
        })
        .collect();
    renderer.print_timers(&rows)
}

#[instrument(skip(cfg, data_dir, renderer, action, now))]
fn cmd_focus(
    cfg: &Config,
    data_dir: &Path,
    renderer: &mut Renderer,
    action: FocusCommand,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let kv = open_local_storage(data_dir)?;
    let mut focus = FocusTimer::load(kv, cfg.focus.default_seconds, now);
    if focus.finished_while_away() || focus.tick(now) {
        println!("{COMPLETION_MESSAGE} {COMPLETION_DETAIL}");
    }

    match action {
        FocusCommand::Start => {
            if focus.start(now) {
                println!("Focus timer running ({})", focus.display());
            } else if focus.is_active() {
                println!("Focus timer already running ({} left)", focus.display());
            } else {
                println!("Focus timer is spent; run `kanflow focus reset` first");
            }
        }
        FocusCommand::Pause => {
            if focus.pause(now) {
                println!("Focus timer paused at {}", focus.display());
            } else {
                println!("Focus timer is not running");
            }
        }
        FocusCommand::Reset => {
            focus.reset();
            println!("Focus timer reset to {}", focus.display());
        }
        FocusCommand::Duration { minutes } => {
            let seconds = focus.set_duration(minutes * 60.0);
            println!("Focus duration set to {}", format_clock(seconds, seconds > 3600));
        }
        FocusCommand::Status => {
            let state = if focus.is_active() { "running" } else { "stopped" };
            renderer.print_lines([format!("{} ({state})", focus.display())])?;
        }
    }
    Ok(())
}
