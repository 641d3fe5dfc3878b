use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use deunicode::deunicode;
use tracing::trace;

use crate::datetime::parse_timestamp;
use crate::sorting::{compare_priority_desc, compare_tasks, present_first, scheduled_minutes};
use crate::task::{Task, TaskPriority};

const NO_TAG_ID: &str = "no-tag";
const NO_TAG_LABEL: &str = "No Tag";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    Default,
    Time,
    Duration,
    Priority,
    DueDate,
    Title,
    Tag,
}

impl SortBy {
    pub const ALL: [SortBy; 7] = [
        SortBy::Default,
        SortBy::Time,
        SortBy::Duration,
        SortBy::Priority,
        SortBy::DueDate,
        SortBy::Title,
        SortBy::Tag,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SortBy::Default => "default",
            SortBy::Time => "time",
            SortBy::Duration => "duration",
            SortBy::Priority => "priority",
            SortBy::DueDate => "due_date",
            SortBy::Title => "title",
            SortBy::Tag => "tag",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SortBy::Default => "Smart (Time + Priority)",
            SortBy::Time => "Time (Latest First)",
            SortBy::Duration => "Duration (Longest First)",
            SortBy::Priority => "Priority (Highest First)",
            SortBy::DueDate => "Due Date (Soonest First)",
            SortBy::Title => "Title (A-Z)",
            SortBy::Tag => "Tag (A-Z)",
        }
    }

    fn comparator(self) -> fn(&Task, &Task) -> Ordering {
        match self {
            SortBy::Default => compare_tasks,
            SortBy::Time => compare_by_time_desc,
            SortBy::Duration => compare_by_duration_desc,
            SortBy::Priority => compare_by_priority_desc,
            SortBy::DueDate => compare_by_due_date_asc,
            SortBy::Title => compare_by_title_asc,
            SortBy::Tag => compare_by_tag_asc,
        }
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortBy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        SortBy::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == wanted)
            .ok_or_else(|| anyhow!("unknown sort strategy: {s}"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GroupBy {
    #[default]
    None,
    Time,
    Duration,
    Priority,
    Tag,
}

impl GroupBy {
    pub const ALL: [GroupBy; 5] = [
        GroupBy::None,
        GroupBy::Time,
        GroupBy::Duration,
        GroupBy::Priority,
        GroupBy::Tag,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GroupBy::None => "none",
            GroupBy::Time => "time",
            GroupBy::Duration => "duration",
            GroupBy::Priority => "priority",
            GroupBy::Tag => "tag",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GroupBy::None => "No Grouping",
            GroupBy::Time => "Time",
            GroupBy::Duration => "Duration",
            GroupBy::Priority => "Priority",
            GroupBy::Tag => "Tag",
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupBy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        GroupBy::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == wanted)
            .ok_or_else(|| anyhow!("unknown grouping: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskGroup {
    pub id: String,
    pub label: String,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub query: String,
    pub selected_tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OrganizeOptions {
    pub filter: TaskFilter,
    pub sort_by: SortBy,
    pub group_by: GroupBy,
}

/// One organize pass over a column.
#[derive(Debug, Clone, PartialEq)]
pub struct OrganizedTasks {
    pub tasks: Vec<Task>,
    /// Present unless grouping is `none`.
    pub groups: Option<Vec<TaskGroup>>,
}

pub fn organize(tasks: &[Task], options: &OrganizeOptions) -> OrganizedTasks {
    let filtered = filter_tasks(tasks, &options.filter);
    let sorted = sort_tasks(&filtered, options.sort_by);
    let groups = match options.group_by {
        GroupBy::None => None,
        group_by => Some(group_tasks(&filtered, group_by, options.sort_by)),
    };
    trace!(
        input = tasks.len(),
        kept = sorted.len(),
        sort = %options.sort_by,
        group = %options.group_by,
        "organized tasks"
    );
    OrganizedTasks {
        tasks: sorted,
        groups,
    }
}

fn normalize_text(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Accent- and case-insensitive collation used for titles and tag labels.
fn collate(a: &str, b: &str) -> Ordering {
    collation_key(a).cmp(&collation_key(b))
}

fn collation_key(text: &str) -> String {
    deunicode(text).to_lowercase()
}

fn duration_minutes(task: &Task) -> Option<f64> {
    task.estimate()
}

fn compare_by_time_desc(a: &Task, b: &Task) -> Ordering {
    present_first(scheduled_minutes(a), scheduled_minutes(b), |a, b| b.cmp(&a))
        .then_with(|| compare_tasks(a, b))
}

fn compare_by_duration_desc(a: &Task, b: &Task) -> Ordering {
    present_first(duration_minutes(a), duration_minutes(b), |a, b| b.total_cmp(&a))
        .then_with(|| compare_tasks(a, b))
}

fn compare_by_priority_desc(a: &Task, b: &Task) -> Ordering {
    compare_priority_desc(a, b).then_with(|| compare_tasks(a, b))
}

fn compare_by_due_date_asc(a: &Task, b: &Task) -> Ordering {
    let due = |task: &Task| task.due_date.as_deref().and_then(parse_timestamp);
    present_first(due(a), due(b), |a, b| a.cmp(&b)).then_with(|| compare_tasks(a, b))
}

fn compare_by_title_asc(a: &Task, b: &Task) -> Ordering {
    collate(&a.title, &b.title).then_with(|| compare_tasks(a, b))
}

fn compare_by_tag_asc(a: &Task, b: &Task) -> Ordering {
    let first_tag = |task: &Task| {
        task.tags
            .first()
            .map(|tag| normalize_text(tag))
            .filter(|tag| !tag.is_empty())
    };
    present_first(first_tag(a), first_tag(b), |a, b| collate(&a, &b))
        .then_with(|| compare_tasks(a, b))
}

/// Distinct tags, case-insensitively, keeping the casing first seen.
pub fn distinct_tags(tasks: &[Task]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();

    for tag in tasks.iter().flat_map(|task| task.tags.iter()) {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(normalize_text(trimmed)) {
            unique.push(trimmed.to_string());
        }
    }

    unique.sort_by(|a, b| collate(a, b));
    unique
}

pub fn filter_tasks(tasks: &[Task], filter: &TaskFilter) -> Vec<Task> {
    let query = normalize_text(&filter.query);
    let selected: HashSet<String> = filter
        .selected_tags
        .iter()
        .map(|tag| normalize_text(tag))
        .filter(|tag| !tag.is_empty())
        .collect();

    tasks
        .iter()
        .filter(|task| {
            if !query.is_empty() {
                let matched = std::iter::once(&task.title)
                    .chain(std::iter::once(&task.description))
                    .chain(task.tags.iter())
                    .any(|value| value.to_lowercase().contains(&query));
                if !matched {
                    return false;
                }
            }

            selected.is_empty()
                || task
                    .tags
                    .iter()
                    .any(|tag| selected.contains(&normalize_text(tag)))
        })
        .cloned()
        .collect()
}

pub fn sort_tasks(tasks: &[Task], sort_by: SortBy) -> Vec<Task> {
    let mut sorted = tasks.to_vec();
    sorted.sort_by(sort_by.comparator());
    sorted
}

fn time_group_id(task: &Task) -> &'static str {
    match scheduled_minutes(task) {
        None => "no-time",
        Some(minutes) if minutes < 12 * 60 => "morning",
        Some(minutes) if minutes < 17 * 60 => "afternoon",
        Some(_) => "evening",
    }
}

fn duration_group_id(task: &Task) -> &'static str {
    match duration_minutes(task) {
        None => "no-duration",
        Some(minutes) if minutes < 30.0 => "short",
        Some(minutes) if minutes <= 60.0 => "medium",
        Some(_) => "long",
    }
}

const TIME_GROUPS: [(&str, &str); 4] = [
    ("morning", "Morning"),
    ("afternoon", "Afternoon"),
    ("evening", "Evening"),
    ("no-time", "No Time"),
];

const DURATION_GROUPS: [(&str, &str); 4] = [
    ("short", "Short (<30m)"),
    ("medium", "Medium (30-60m)"),
    ("long", "Long (60m+)"),
    ("no-duration", "No Duration"),
];

fn group_by_fixed_order(
    tasks: &[Task],
    order: &[(&str, &str)],
    group_id: fn(&Task) -> &'static str,
    sort_by: SortBy,
) -> Vec<TaskGroup> {
    let mut buckets: HashMap<&str, Vec<Task>> = HashMap::new();
    for task in tasks {
        buckets.entry(group_id(task)).or_default().push(task.clone());
    }

    order
        .iter()
        .filter_map(|(id, label)| {
            let members = buckets.remove(id).filter(|members| !members.is_empty())?;
            Some(TaskGroup {
                id: (*id).to_string(),
                label: (*label).to_string(),
                tasks: sort_tasks(&members, sort_by),
            })
        })
        .collect()
}

fn group_by_priority(tasks: &[Task], sort_by: SortBy) -> Vec<TaskGroup> {
    TaskPriority::DESCENDING
        .into_iter()
        .filter_map(|priority| {
            let members: Vec<Task> = tasks
                .iter()
                .filter(|task| task.priority == priority)
                .cloned()
                .collect();
            if members.is_empty() {
                return None;
            }
            Some(TaskGroup {
                id: priority.as_str().to_string(),
                label: priority.label().to_string(),
                tasks: sort_tasks(&members, sort_by),
            })
        })
        .collect()
}

fn tag_group_id(tag: &str) -> String {
    normalize_text(tag)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// View buckets, not a partition: a task lands in every tag bucket it
/// carries.
fn group_by_tag(tasks: &[Task], sort_by: SortBy) -> Vec<TaskGroup> {
    let mut groups: Vec<TaskGroup> = Vec::new();
    let mut index_by_id: HashMap<String, usize> = HashMap::new();

    let mut push = |id: String, label: &str, task: &Task| {
        let idx = *index_by_id.entry(id.clone()).or_insert_with(|| {
            groups.push(TaskGroup {
                id,
                label: label.to_string(),
                tasks: vec![],
            });
            groups.len() - 1
        });
        let bucket = &mut groups[idx].tasks;
        if !bucket.iter().any(|existing| existing.id == task.id) {
            bucket.push(task.clone());
        }
    };

    for task in tasks {
        if task.tags.is_empty() {
            push(NO_TAG_ID.to_string(), NO_TAG_LABEL, task);
            continue;
        }
        for tag in &task.tags {
            let trimmed = tag.trim();
            if trimmed.is_empty() {
                continue;
            }
            push(tag_group_id(trimmed), trimmed, task);
        }
    }

    groups.sort_by(|a, b| match (a.id == NO_TAG_ID, b.id == NO_TAG_ID) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => collate(&a.label, &b.label),
    });

    for group in &mut groups {
        group.tasks = sort_tasks(&group.tasks, sort_by);
    }
    groups
}

/// Buckets an already-filtered set for display.
pub fn group_tasks(tasks: &[Task], group_by: GroupBy, sort_by: SortBy) -> Vec<TaskGroup> {
    match group_by {
        GroupBy::None => vec![TaskGroup {
            id: "all".to_string(),
            label: "All Tasks".to_string(),
            tasks: sort_tasks(tasks, sort_by),
        }],
        GroupBy::Time => group_by_fixed_order(tasks, &TIME_GROUPS, time_group_id, sort_by),
        GroupBy::Duration => {
            group_by_fixed_order(tasks, &DURATION_GROUPS, duration_group_id, sort_by)
        }
        GroupBy::Priority => group_by_priority(tasks, sort_by),
        GroupBy::Tag => group_by_tag(tasks, sort_by),
    }
}
