use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::datetime::{parse_timestamp, to_iso_string};

pub const DEFAULT_BOARD_NAME: &str = "Tasks to Complete";
pub const DEFAULT_TASK_TITLE: &str = "New Task";

/// Marker keys older documents kept inside `custom_field_values`.
pub const ESTIMATED_MINUTES_KEY: &str = "__estimated_minutes";
pub const COMPLETED_AT_KEY: &str = "__completed_at";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 3] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            TaskStatus::Todo => "To Do",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "todo" | "to_do" | "to-do" => Ok(TaskStatus::Todo),
            "in_progress" | "in-progress" | "doing" => Ok(TaskStatus::InProgress),
            "completed" | "done" => Ok(TaskStatus::Completed),
            other => Err(anyhow!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    /// Display order, most pressing first.
    pub const DESCENDING: [TaskPriority; 4] = [
        TaskPriority::Urgent,
        TaskPriority::High,
        TaskPriority::Medium,
        TaskPriority::Low,
    ];

    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::Urgent => 4,
            TaskPriority::High => 3,
            TaskPriority::Medium => 2,
            TaskPriority::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskPriority::Low => "Low",
            TaskPriority::Medium => "Medium",
            TaskPriority::High => "High",
            TaskPriority::Urgent => "Urgent",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "l" => Ok(TaskPriority::Low),
            "medium" | "m" => Ok(TaskPriority::Medium),
            "high" | "h" => Ok(TaskPriority::High),
            "urgent" | "u" => Ok(TaskPriority::Urgent),
            other => Err(anyhow!("unknown task priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CustomValue {
    Number(f64),
    Text(String),
}

impl CustomValue {
    fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(CustomValue::Text(text)),
            Value::Number(num) => num
                .as_f64()
                .filter(|n| n.is_finite())
                .map(CustomValue::Number),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CustomValue::Number(n) => Some(*n),
            CustomValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CustomValue::Text(text) => Some(text.as_str()),
            CustomValue::Number(_) => None,
        }
    }
}

impl fmt::Display for CustomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomValue::Number(n) => write!(f, "{n}"),
            CustomValue::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CustomFieldType {
    #[default]
    Text,
    Number,
    Dropdown,
}

impl FromStr for CustomFieldType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(CustomFieldType::Text),
            "number" => Ok(CustomFieldType::Number),
            "dropdown" => Ok(CustomFieldType::Dropdown),
            other => Err(anyhow!("unknown custom field type: {other}")),
        }
    }
}

impl fmt::Display for CustomFieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CustomFieldType::Text => "text",
            CustomFieldType::Number => "number",
            CustomFieldType::Dropdown => "dropdown",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomFieldDefinition {
    pub id: String,

    #[serde(default)]
    pub board_id: String,

    pub name: String,

    #[serde(default, deserialize_with = "lenient")]
    pub field_type: CustomFieldType,

    #[serde(default, deserialize_with = "lenient_string_list")]
    pub options: Vec<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub position: u32,

    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Board {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub created_at: String,

    #[serde(default)]
    pub updated_at: String,
}

impl Board {
    pub fn new_default(now: DateTime<Utc>) -> Self {
        let timestamp = to_iso_string(now);
        Self {
            id: Uuid::new_v4().to_string(),
            name: DEFAULT_BOARD_NAME.to_string(),
            created_at: timestamp.clone(),
            updated_at: timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,

    #[serde(default)]
    pub board_id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,

    #[serde(default, deserialize_with = "lenient")]
    pub status: TaskStatus,

    #[serde(default, deserialize_with = "lenient")]
    pub priority: TaskPriority,

    #[serde(default, deserialize_with = "lenient")]
    pub due_date: Option<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub scheduled_time: Option<String>,

    #[serde(default, deserialize_with = "lenient_minutes")]
    pub estimated_minutes: Option<f64>,

    #[serde(default, deserialize_with = "lenient_string_list")]
    pub tags: Vec<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub assignee: String,

    #[serde(default, deserialize_with = "lenient")]
    pub position: u32,

    #[serde(default, deserialize_with = "lenient_custom_values")]
    pub custom_field_values: BTreeMap<String, CustomValue>,

    #[serde(default, deserialize_with = "lenient")]
    pub pomodoros_completed: u32,

    #[serde(default)]
    pub created_at: String,

    #[serde(default)]
    pub updated_at: String,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub completed_at: Option<String>,
}

impl Task {
    pub fn new(board_id: &str, title: &str, now: DateTime<Utc>) -> Self {
        let timestamp = to_iso_string(now);
        Self {
            id: Uuid::new_v4().to_string(),
            board_id: board_id.to_string(),
            title: title.to_string(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            due_date: None,
            scheduled_time: None,
            estimated_minutes: None,
            tags: vec![],
            assignee: String::new(),
            position: 0,
            custom_field_values: BTreeMap::new(),
            pomodoros_completed: 0,
            created_at: timestamp.clone(),
            updated_at: timestamp,
            completed_at: None,
        }
    }

    /// The estimate, if it is a usable positive number of minutes.
    pub fn estimate(&self) -> Option<f64> {
        self.estimated_minutes.filter(|m| m.is_finite() && *m > 0.0)
    }

    /// When the task was marked completed. Falls back to the last-modified
    /// time for tasks completed before the marker existed.
    pub fn completion_timestamp(&self) -> Option<DateTime<Utc>> {
        self.completed_at
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| parse_timestamp(&self.updated_at))
    }

    /// Trims tags, drops empty ones and lifts legacy marker keys out of the
    /// custom values into their own fields.
    pub fn normalize(&mut self) {
        self.tags = normalize_tags(self.tags.iter().map(String::as_str));
        self.estimated_minutes = self.estimate();

        if let Some(marker) = self.custom_field_values.remove(ESTIMATED_MINUTES_KEY)
            && self.estimated_minutes.is_none()
        {
            self.estimated_minutes = marker.as_number().filter(|m| *m > 0.0);
        }

        if let Some(marker) = self.custom_field_values.remove(COMPLETED_AT_KEY)
            && self.completed_at.is_none()
        {
            self.completed_at = marker
                .as_text()
                .filter(|raw| parse_timestamp(raw).is_some())
                .map(str::to_string);
        }
    }
}

pub fn normalize_tags<'a, I>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    tags.into_iter()
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardSnapshot {
    pub board: Board,
    pub tasks: Vec<Task>,
    #[serde(rename = "customFields")]
    pub custom_fields: Vec<CustomFieldDefinition>,
}

impl BoardSnapshot {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            board: Board::new_default(now),
            tasks: vec![],
            custom_fields: vec![],
        }
    }
}

/// Fields for a new task. Anything left unset takes the board defaults.
#[derive(Debug, Clone, Default)]
pub struct TaskDraft {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub due_date: Option<String>,
    pub scheduled_time: Option<String>,
    pub estimated_minutes: Option<f64>,
    pub tags: Vec<String>,
    pub assignee: Option<String>,
    pub custom_field_values: BTreeMap<String, CustomValue>,
}

/// Partial update. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub due_date: Option<Option<String>>,
    pub scheduled_time: Option<Option<String>>,
    pub estimated_minutes: Option<Option<f64>>,
    pub tags: Option<Vec<String>>,
    pub assignee: Option<String>,
    pub custom_field_values: Option<BTreeMap<String, CustomValue>>,
    pub pomodoros_completed: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct CustomFieldDraft {
    pub name: String,
    pub field_type: CustomFieldType,
    pub options: Vec<String>,
    pub position: Option<u32>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        _ => Ok(String::new()),
    }
}

fn lenient_minutes<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(raw.as_f64().filter(|m| m.is_finite() && *m > 0.0))
}

fn lenient_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let list = match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>(),
        Value::String(joined) => joined.split(',').map(str::to_string).collect(),
        _ => vec![],
    };
    Ok(normalize_tags(list.iter().map(String::as_str)))
}

fn lenient_custom_values<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, CustomValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Object(map) = Value::deserialize(deserializer)? else {
        return Ok(BTreeMap::new());
    };
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| CustomValue::from_json(value).map(|v| (key, v)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_markers_become_fields() {
        let raw = r#"{
            "id": "t1",
            "title": "Legacy",
            "status": "completed",
            "tags": "ops, , docs ",
            "custom_field_values": {
                "__estimated_minutes": 45,
                "__completed_at": "2026-02-17T09:00:00.000Z",
                "owner": "me",
                "flag": true
            },
            "created_at": "2026-02-16T09:00:00.000Z",
            "updated_at": "2026-02-18T09:00:00.000Z"
        }"#;

        let mut task: Task = serde_json::from_str(raw).expect("task parses");
        task.normalize();

        assert_eq!(task.tags, vec!["ops".to_string(), "docs".to_string()]);
        assert_eq!(task.estimated_minutes, Some(45.0));
        assert_eq!(task.completed_at.as_deref(), Some("2026-02-17T09:00:00.000Z"));
        assert_eq!(task.custom_field_values.len(), 1);
        assert_eq!(
            task.custom_field_values.get("owner"),
            Some(&CustomValue::Text("me".to_string()))
        );
    }

    #[test]
    fn malformed_fields_degrade_to_defaults() {
        let raw = r#"{
            "id": "t2",
            "priority": "critical",
            "estimated_minutes": -5,
            "position": -1,
            "custom_field_values": null
        }"#;

        let task: Task = serde_json::from_str(raw).expect("task parses");
        assert_eq!(task.priority, TaskPriority::Medium);
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.estimated_minutes, None);
        assert_eq!(task.position, 0);
        assert!(task.custom_field_values.is_empty());
    }

    #[test]
    fn completion_timestamp_prefers_marker() {
        let now = Utc::now();
        let mut task = Task::new("b", "t", now);
        task.updated_at = "2026-02-18T10:00:00.000Z".to_string();
        task.completed_at = Some("garbage".to_string());
        assert_eq!(
            task.completion_timestamp(),
            parse_timestamp("2026-02-18T10:00:00.000Z")
        );

        task.completed_at = Some("2026-02-17T10:00:00.000Z".to_string());
        assert_eq!(
            task.completion_timestamp(),
            parse_timestamp("2026-02-17T10:00:00.000Z")
        );
    }
}
