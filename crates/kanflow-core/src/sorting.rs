use std::cmp::Ordering;

use crate::datetime::{parse_scheduled_minutes, timestamp_millis};
use crate::task::Task;

/// Places present values first; two present values are left to `cmp`.
pub(crate) fn present_first<T, F>(a: Option<T>, b: Option<T>, cmp: F) -> Ordering
where
    F: FnOnce(T, T) -> Ordering,
{
    match (a, b) {
        (Some(a), Some(b)) => cmp(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub(crate) fn scheduled_minutes(task: &Task) -> Option<u32> {
    parse_scheduled_minutes(task.scheduled_time.as_deref())
}

/// Default board ordering: later scheduled time first (timed before untimed),
/// then higher priority, then newest created, then newest modified.
pub fn compare_tasks(a: &Task, b: &Task) -> Ordering {
    present_first(scheduled_minutes(a), scheduled_minutes(b), |a, b| b.cmp(&a))
        .then_with(|| compare_priority_desc(a, b))
        .then_with(|| compare_recency_desc(a, b))
}

pub(crate) fn compare_priority_desc(a: &Task, b: &Task) -> Ordering {
    b.priority.rank().cmp(&a.priority.rank())
}

fn compare_recency_desc(a: &Task, b: &Task) -> Ordering {
    timestamp_millis(&b.created_at)
        .cmp(&timestamp_millis(&a.created_at))
        .then_with(|| timestamp_millis(&b.updated_at).cmp(&timestamp_millis(&a.updated_at)))
}

pub fn sort_default(tasks: &[Task]) -> Vec<Task> {
    let mut sorted = tasks.to_vec();
    sorted.sort_by(compare_tasks);
    sorted
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::task::TaskPriority;

    fn task(id: &str, priority: TaskPriority, created: &str, updated: &str) -> Task {
        let now = Utc
            .with_ymd_and_hms(2026, 2, 20, 10, 0, 0)
            .single()
            .expect("valid now");
        let mut task = Task::new("board-1", id, now);
        task.id = id.to_string();
        task.priority = priority;
        task.created_at = created.to_string();
        task.updated_at = updated.to_string();
        task
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn equal_priority_orders_by_creation_then_modification() {
        let tasks = vec![
            task("old", TaskPriority::Medium, "2026-02-18T09:00:00Z", "2026-02-18T09:00:00Z"),
            task("new", TaskPriority::Medium, "2026-02-19T09:00:00Z", "2026-02-19T09:00:00Z"),
            task("tie-stale", TaskPriority::Medium, "2026-02-18T12:00:00Z", "2026-02-18T12:00:00Z"),
            task("tie-fresh", TaskPriority::Medium, "2026-02-18T12:00:00Z", "2026-02-20T08:00:00Z"),
        ];

        assert_eq!(
            ids(&sort_default(&tasks)),
            vec!["new", "tie-fresh", "tie-stale", "old"]
        );
    }

    #[test]
    fn priority_beats_recency() {
        let tasks = vec![
            task("low-new", TaskPriority::Low, "2026-02-20T09:00:00Z", "2026-02-20T09:00:00Z"),
            task("urgent-old", TaskPriority::Urgent, "2026-01-01T09:00:00Z", "2026-01-01T09:00:00Z"),
            task("high", TaskPriority::High, "2026-02-01T09:00:00Z", "2026-02-01T09:00:00Z"),
        ];

        assert_eq!(
            ids(&sort_default(&tasks)),
            vec!["urgent-old", "high", "low-new"]
        );
    }

    #[test]
    fn timed_tasks_come_first_latest_time_leading() {
        let mut morning = task("morning", TaskPriority::Low, "2026-02-18T09:00:00Z", "2026-02-18T09:00:00Z");
        morning.scheduled_time = Some("08:30".to_string());
        let mut evening = task("evening", TaskPriority::Low, "2026-02-18T09:00:00Z", "2026-02-18T09:00:00Z");
        evening.scheduled_time = Some("19:00".to_string());
        let mut bogus = task("bogus", TaskPriority::Urgent, "2026-02-19T09:00:00Z", "2026-02-19T09:00:00Z");
        bogus.scheduled_time = Some("late".to_string());
        let untimed = task("untimed", TaskPriority::Urgent, "2026-02-19T09:00:00Z", "2026-02-19T09:00:00Z");

        let sorted = sort_default(&[untimed, morning, bogus, evening]);
        assert_eq!(ids(&sorted)[..2], ["evening", "morning"]);
        assert!(ids(&sorted)[2..].contains(&"bogus"));
        assert!(ids(&sorted)[2..].contains(&"untimed"));
    }

    #[test]
    fn unparsable_timestamps_sort_as_epoch() {
        let broken = task("broken", TaskPriority::Medium, "not-a-date", "nope");
        let dated = task("dated", TaskPriority::Medium, "1970-01-02T00:00:00Z", "1970-01-02T00:00:00Z");

        assert_eq!(compare_tasks(&broken, &dated), Ordering::Greater);
        assert_eq!(compare_tasks(&broken, &broken.clone()), Ordering::Equal);
    }
}
