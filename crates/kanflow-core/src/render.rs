use std::collections::BTreeMap;
use std::io::{self, IsTerminal, Write};

use chrono::{DateTime, Utc};
use unicode_width::UnicodeWidthStr;

use crate::board::{Column, Notification, NotificationLevel};
use crate::config::Config;
use crate::datetime::{parse_timestamp, to_project_date};
use crate::task::{CustomFieldDefinition, Task, TaskPriority, TaskStatus};
use crate::timer::{ActiveTimers, TaskTimer, TimerPhase, format_clock};

const SHORT_ID_LEN: usize = 8;

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// A timer line for `timer status`.
#[derive(Debug, Clone)]
pub struct TimerRow {
    pub task_id: String,
    pub title: String,
    pub timer: TaskTimer,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> Self {
        Self { color: cfg.color }
    }

    #[tracing::instrument(skip(self, columns, timers, now))]
    pub fn print_board(
        &mut self,
        columns: &[Column],
        timers: &ActiveTimers,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        for (idx, column) in columns.iter().enumerate() {
            if idx > 0 {
                writeln!(out)?;
            }
            let shown = column.organized.tasks.len();
            let heading = if shown == column.total {
                format!("{} ({})", column_title(column.status), shown)
            } else {
                format!("{} ({} of {})", column_title(column.status), shown, column.total)
            };
            writeln!(out, "{}", self.paint(&heading, "1"))?;

            if column.organized.tasks.is_empty() {
                writeln!(out, "  (empty)")?;
                continue;
            }

            match &column.organized.groups {
                Some(groups) => {
                    for group in groups {
                        writeln!(out, "-- {} ({})", group.label, group.tasks.len())?;
                        let rows = group
                            .tasks
                            .iter()
                            .map(|task| self.task_row(task, timers, now))
                            .collect();
                        write_table(&mut out, task_headers(), rows)?;
                    }
                }
                None => {
                    let rows = column
                        .organized
                        .tasks
                        .iter()
                        .map(|task| self.task_row(task, timers, now))
                        .collect();
                    write_table(&mut out, task_headers(), rows)?;
                }
            }
        }

        Ok(())
    }

    fn task_row(&self, task: &Task, timers: &ActiveTimers, now: DateTime<Utc>) -> Vec<String> {
        let id = self.paint(short_id(&task.id), "33");

        let priority = match task.priority {
            TaskPriority::Urgent => self.paint(task.priority.label(), "31"),
            TaskPriority::High => self.paint(task.priority.label(), "33"),
            _ => task.priority.label().to_string(),
        };

        let due = match task.due_date.as_deref().and_then(parse_timestamp) {
            Some(due_at) => {
                let text = to_project_date(due_at).format("%Y-%m-%d").to_string();
                if due_at < now && task.status != TaskStatus::Completed {
                    self.paint(&text, "31")
                } else {
                    text
                }
            }
            None => String::new(),
        };

        let estimate = task
            .estimate()
            .map(|minutes| format!("{minutes}m"))
            .unwrap_or_default();

        let tags = task
            .tags
            .iter()
            .map(|tag| format!("+{tag}"))
            .collect::<Vec<_>>()
            .join(" ");

        let timer = timers
            .get(&task.id)
            .map(|secs| self.paint(&format_clock(*secs, *secs > 3600), "32"))
            .unwrap_or_default();

        vec![
            id,
            priority,
            task.scheduled_time.clone().unwrap_or_default(),
            due,
            estimate,
            task.title.clone(),
            tags,
            timer,
        ]
    }

    #[tracing::instrument(skip(self, task, fields, timer))]
    pub fn print_task_info(
        &mut self,
        task: &Task,
        fields: &[CustomFieldDefinition],
        timer: Option<&TaskTimer>,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        writeln!(out, "id          {}", task.id)?;
        writeln!(out, "title       {}", task.title)?;
        writeln!(out, "status      {}", task.status.title())?;
        writeln!(out, "priority    {}", task.priority.label())?;
        writeln!(out, "position    {}", task.position)?;
        if let Some(due) = &task.due_date {
            writeln!(out, "due         {due}")?;
        }
        if let Some(at) = &task.scheduled_time {
            writeln!(out, "at          {at}")?;
        }
        if let Some(minutes) = task.estimate() {
            writeln!(out, "estimate    {minutes}m")?;
        }
        if !task.tags.is_empty() {
            writeln!(out, "tags        {}", task.tags.join(", "))?;
        }
        if !task.assignee.is_empty() {
            writeln!(out, "assignee    {}", task.assignee)?;
        }
        writeln!(out, "pomodoros   {}", task.pomodoros_completed)?;
        writeln!(out, "created     {}", task.created_at)?;
        writeln!(out, "modified    {}", task.updated_at)?;
        if let Some(completed) = &task.completed_at {
            writeln!(out, "completed   {completed}")?;
        }

        for (key, value) in &task.custom_field_values {
            let name = fields
                .iter()
                .find(|field| &field.id == key)
                .map(|field| field.name.as_str())
                .unwrap_or(key.as_str());
            writeln!(out, "{name:<11} {value}")?;
        }

        if let Some(timer) = timer {
            writeln!(out, "timer       {} ({})", timer.display(), phase_label(timer.phase()))?;
        }

        if !task.description.trim().is_empty() {
            writeln!(out)?;
            for line in task.description.lines() {
                writeln!(out, "  {line}")?;
            }
        }

        Ok(())
    }

    #[tracing::instrument(skip(self, day_keys, grouped))]
    pub fn print_calendar(
        &mut self,
        day_keys: &[String],
        grouped: &BTreeMap<String, Vec<Task>>,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        for day in day_keys {
            let tasks = grouped.get(day).map(Vec::as_slice).unwrap_or_default();
            writeln!(out, "{} ({})", self.paint(day, "1"), tasks.len())?;
            for task in tasks {
                writeln!(out, "  {} {}", self.paint(short_id(&task.id), "33"), task.title)?;
            }
        }

        Ok(())
    }

    pub fn print_fields(&mut self, fields: &[CustomFieldDefinition]) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let headers = ["ID", "Name", "Type", "Options"]
            .map(str::to_string)
            .to_vec();
        let mut sorted: Vec<&CustomFieldDefinition> = fields.iter().collect();
        sorted.sort_by_key(|field| field.position);

        let rows = sorted
            .into_iter()
            .map(|field| {
                vec![
                    self.paint(short_id(&field.id), "33"),
                    field.name.clone(),
                    field.field_type.to_string(),
                    field.options.join(", "),
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)
    }

    pub fn print_timers(&mut self, rows: &[TimerRow]) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        if rows.is_empty() {
            writeln!(out, "no timers")?;
            return Ok(());
        }

        let headers = ["ID", "Task", "State", "Left"].map(str::to_string).to_vec();
        let rows = rows
            .iter()
            .map(|row| {
                let phase = row.timer.phase();
                let state = match phase {
                    TimerPhase::Running => self.paint(phase_label(phase), "32"),
                    TimerPhase::AwaitingDecision => self.paint(phase_label(phase), "31"),
                    _ => phase_label(phase).to_string(),
                };
                vec![
                    self.paint(short_id(&row.task_id), "33"),
                    row.title.clone(),
                    state,
                    row.timer.display(),
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)
    }

    pub fn print_lines<I, T>(&mut self, lines: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut out = io::stdout().lock();
        for line in lines {
            writeln!(out, "{}", line.as_ref())?;
        }
        Ok(())
    }

    /// Points at a task whose timer ran out and is waiting for an answer.
    pub fn print_finished_timer(&mut self, task: &Task) -> anyhow::Result<()> {
        let short = short_id(&task.id);
        writeln!(
            io::stdout().lock(),
            "{} '{}'. Mark it with `kanflow timer done {short}` or `kanflow timer not-yet {short}`.",
            self.paint("Timer finished for", "33"),
            task.title
        )?;
        Ok(())
    }

    /// Success notices go to stdout, errors to stderr.
    pub fn notify(&mut self, notifications: &[Notification]) -> anyhow::Result<()> {
        for note in notifications {
            match note.level {
                NotificationLevel::Success => {
                    writeln!(io::stdout().lock(), "{}", self.paint(&note.message, "32"))?;
                }
                NotificationLevel::Error => {
                    writeln!(io::stderr().lock(), "{}", note.message)?;
                }
            }
        }
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn column_title(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Completed => "Completed Today",
        other => other.title(),
    }
}

pub fn phase_label(phase: TimerPhase) -> &'static str {
    match phase {
        TimerPhase::Idle => "idle",
        TimerPhase::Running => "running",
        TimerPhase::Paused => "paused",
        TimerPhase::AwaitingDecision => "finished",
    }
}

fn task_headers() -> Vec<String> {
    ["ID", "Pri", "At", "Due", "Est", "Title", "Tags", "Timer"]
        .map(str::to_string)
        .to_vec()
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths: Vec<usize> = headers
        .iter()
        .map(|header| UnicodeWidthStr::width(header.as_str()))
        .collect();

    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    let header_line: Vec<String> = headers
        .iter()
        .zip(&widths)
        .map(|(header, &width)| format!("{header:width$}"))
        .collect();
    writeln!(writer, "{}", header_line.join(" ").trim_end())?;

    let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
    writeln!(writer, "{}", rule.join(" "))?;

    for row in rows {
        let mut line = String::new();
        for (idx, width) in widths.iter().enumerate() {
            let cell = row.get(idx).map(String::as_str).unwrap_or("");
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            if idx > 0 {
                line.push(' ');
            }
            line.push_str(cell);
            line.push_str(&" ".repeat(width.saturating_sub(visible_width)));
        }
        writeln!(writer, "{}", line.trim_end())?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_aligns_on_visible_width() {
        let mut buf = Vec::new();
        let headers = vec!["ID".to_string(), "Title".to_string(), "Tags".to_string()];
        let rows = vec![
            vec!["\x1b[33mab\x1b[0m".to_string(), "日本語".to_string(), "+x".to_string()],
            vec!["abcd".to_string(), "x".to_string(), String::new()],
        ];
        write_table(&mut buf, headers, rows).expect("write");

        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ID   Title  Tags");
        assert_eq!(lines[1], "---- ------ ----");
        assert_eq!(strip_ansi(lines[2]), "ab   日本語 +x");
        assert_eq!(lines[3], "abcd x");
    }

    #[test]
    fn short_ids_cut_on_char_boundaries() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("ééééééééé"), "éééééééé");
    }
}
