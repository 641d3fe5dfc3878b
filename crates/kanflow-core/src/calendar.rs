//! Completed-task calendar: trailing windows of day keys and the tasks
//! completed on each of them.
//!
//! Calendar columns list a day's tasks by completion time, most recent
//! first. The board's "completed today" query orders them with the regular
//! board comparator instead.

use std::collections::BTreeMap;

use chrono::{DateTime, Days, Utc};
use tracing::debug;

use crate::datetime::{day_key, format_day_key, to_project_date};
use crate::sorting::compare_tasks;
use crate::task::{Task, TaskStatus};

pub const DEFAULT_WINDOW_DAYS: usize = 7;

/// `days` day keys ending today and walking backwards, one per calendar
/// date in the project timezone.
pub fn build_day_keys(now: DateTime<Utc>, days: usize) -> Vec<String> {
    let today = to_project_date(now);
    (0..days as u64)
        .filter_map(|offset| today.checked_sub_days(Days::new(offset)))
        .map(format_day_key)
        .collect()
}

/// The day a completed task belongs to, or `None` for tasks that are not
/// completed or carry no usable timestamp.
pub fn completion_day_key(task: &Task) -> Option<String> {
    if task.status != TaskStatus::Completed {
        return None;
    }
    task.completion_timestamp().map(day_key)
}

/// Buckets completed tasks under each of `day_keys`; every key is present,
/// possibly empty. Tasks completed outside the window are dropped.
pub fn group_completed_by_day(tasks: &[Task], day_keys: &[String]) -> BTreeMap<String, Vec<Task>> {
    let mut grouped: BTreeMap<String, Vec<Task>> = day_keys
        .iter()
        .map(|key| (key.clone(), Vec::new()))
        .collect();

    let mut skipped = 0usize;
    for task in tasks {
        let Some(key) = completion_day_key(task) else {
            continue;
        };
        match grouped.get_mut(&key) {
            Some(bucket) => bucket.push(task.clone()),
            None => skipped += 1,
        }
    }

    for bucket in grouped.values_mut() {
        bucket.sort_by(|a, b| b.completion_timestamp().cmp(&a.completion_timestamp()));
    }

    debug!(days = day_keys.len(), skipped, "grouped completed tasks by day");
    grouped
}

/// Tasks completed on `day_key`, in board order.
pub fn completed_tasks_for_day(tasks: &[Task], day_key: &str) -> Vec<Task> {
    let mut matching: Vec<Task> = tasks
        .iter()
        .filter(|task| completion_day_key(task).as_deref() == Some(day_key))
        .cloned()
        .collect();
    matching.sort_by(compare_tasks);
    matching
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::datetime::{project_timezone, to_iso_string};
    use crate::task::TaskPriority;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        project_timezone()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("unambiguous local time")
            .with_timezone(&Utc)
    }

    fn completed(id: &str, updated: DateTime<Utc>) -> Task {
        let mut task = Task::new("board-1", id, local(2026, 2, 17, 6, 0));
        task.id = id.to_string();
        task.status = TaskStatus::Completed;
        task.updated_at = to_iso_string(updated);
        task
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn builds_exactly_the_requested_window() {
        for hour in [1, 12, 23] {
            let keys = build_day_keys(local(2026, 2, 18, hour, 30), 7);
            assert_eq!(keys.len(), 7);
            assert_eq!(keys[0], "2026-02-18");
            assert_eq!(keys[6], "2026-02-12");
        }

        let across_year = build_day_keys(local(2026, 1, 2, 8, 0), 3);
        assert_eq!(across_year, vec!["2026-01-02", "2026-01-01", "2025-12-31"]);
    }

    #[test]
    fn window_keys_are_distinct_consecutive_dates() {
        let keys = build_day_keys(local(2026, 3, 29, 12, 0), 30);
        let dates: Vec<NaiveDate> = keys
            .iter()
            .map(|k| NaiveDate::parse_from_str(k, "%Y-%m-%d").expect("valid key"))
            .collect();
        for pair in dates.windows(2) {
            assert_eq!(pair[0].pred_opt(), Some(pair[1]));
        }
    }

    #[test]
    fn groups_only_completed_tasks_newest_first() {
        let day_keys = build_day_keys(local(2026, 2, 18, 12, 0), 7);

        let older = completed("completed-today-older", local(2026, 2, 18, 10, 0));
        let newer = completed("completed-today-newer", local(2026, 2, 18, 16, 0));
        let yesterday = completed("completed-yesterday", local(2026, 2, 17, 14, 0));
        let mut todo = completed("todo-task", local(2026, 2, 18, 9, 0));
        todo.status = TaskStatus::Todo;
        let mut invalid = completed("invalid-updated-at", local(2026, 2, 18, 9, 0));
        invalid.updated_at = "not-a-date".to_string();
        let ancient = completed("ancient", local(2025, 12, 1, 9, 0));

        let grouped = group_completed_by_day(
            &[older, newer, yesterday, todo, invalid, ancient],
            &day_keys,
        );

        assert_eq!(grouped.len(), 7);
        assert_eq!(
            ids(&grouped["2026-02-18"]),
            vec!["completed-today-newer", "completed-today-older"]
        );
        assert_eq!(ids(&grouped["2026-02-17"]), vec!["completed-yesterday"]);
        assert!(grouped["2026-02-16"].is_empty());
        let total: usize = grouped.values().map(Vec::len).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn completion_marker_overrides_last_modified() {
        let day_keys = build_day_keys(local(2026, 2, 18, 12, 0), 7);
        let mut edited = completed("edited-today", local(2026, 2, 18, 10, 0));
        edited.completed_at = Some(to_iso_string(local(2026, 2, 17, 9, 0)));

        let grouped = group_completed_by_day(&[edited], &day_keys);
        assert_eq!(ids(&grouped["2026-02-17"]), vec!["edited-today"]);
        assert!(grouped["2026-02-18"].is_empty());
    }

    #[test]
    fn sorts_within_day_by_completion_not_modification() {
        let day_keys = build_day_keys(local(2026, 2, 18, 12, 0), 7);
        let mut later = completed("completed-later", local(2026, 2, 17, 21, 0));
        later.completed_at = Some(to_iso_string(local(2026, 2, 17, 20, 0)));
        let mut earlier = completed("completed-earlier", local(2026, 2, 18, 8, 0));
        earlier.completed_at = Some(to_iso_string(local(2026, 2, 17, 9, 0)));

        let grouped = group_completed_by_day(&[earlier, later], &day_keys);
        assert_eq!(
            ids(&grouped["2026-02-17"]),
            vec!["completed-later", "completed-earlier"]
        );
    }

    #[test]
    fn day_query_uses_board_order() {
        let mut urgent_older = completed("urgent-older", local(2026, 2, 18, 16, 0));
        urgent_older.priority = TaskPriority::Urgent;
        urgent_older.created_at = to_iso_string(local(2026, 2, 18, 9, 0));

        let mut urgent_newer = completed("urgent-newer", local(2026, 2, 18, 12, 0));
        urgent_newer.priority = TaskPriority::Urgent;
        urgent_newer.created_at = to_iso_string(local(2026, 2, 18, 10, 0));

        let mut high = completed("high", local(2026, 2, 18, 11, 30));
        high.priority = TaskPriority::High;
        high.created_at = to_iso_string(local(2026, 2, 18, 11, 0));

        let mut yesterday = completed("yesterday", local(2026, 2, 17, 12, 0));
        yesterday.priority = TaskPriority::Urgent;

        let result =
            completed_tasks_for_day(&[urgent_older, high, yesterday, urgent_newer], "2026-02-18");
        assert_eq!(ids(&result), vec!["urgent-newer", "urgent-older", "high"]);
    }
}
