use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::datetime::to_iso_string;
use crate::task::{
    Board, BoardSnapshot, CustomFieldDefinition, CustomFieldType, DEFAULT_BOARD_NAME, Task,
};

pub const STATE_FILE_NAME: &str = "kanban-state.json";
pub const SCHEMA_VERSION: u32 = 1;

/// Whole-board persistence. A save hands back the snapshot as stored, which
/// is what callers should adopt.
pub trait SnapshotStore {
    fn load(&mut self, now: DateTime<Utc>) -> anyhow::Result<BoardSnapshot>;
    fn save(&mut self, snapshot: &BoardSnapshot, now: DateTime<Utc>) -> anyhow::Result<BoardSnapshot>;
}

/// On-disk layout of the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredState {
    pub schema_version: u32,
    pub updated_at: String,
    pub board: Board,
    pub tasks: Vec<Task>,
    pub custom_fields: Vec<CustomFieldDefinition>,
}

impl StoredState {
    pub fn new_default(now: DateTime<Utc>) -> Self {
        Self::from_snapshot(BoardSnapshot::empty(now), now)
    }

    fn from_snapshot(snapshot: BoardSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            updated_at: to_iso_string(now),
            board: snapshot.board,
            tasks: snapshot.tasks,
            custom_fields: snapshot.custom_fields,
        }
    }

    pub fn into_snapshot(self) -> BoardSnapshot {
        BoardSnapshot {
            board: self.board,
            tasks: self.tasks,
            custom_fields: self.custom_fields,
        }
    }
}

/// Coerces an arbitrary JSON payload into a valid state. Anything without a
/// board carrying a string id is replaced by a fresh default board; tasks and
/// field definitions that cannot be read at all are dropped one by one.
pub fn normalize_state(candidate: &Value, now: DateTime<Utc>) -> StoredState {
    let Some(object) = candidate.as_object() else {
        return StoredState::new_default(now);
    };
    let Some(board) = object.get("board").and_then(Value::as_object) else {
        return StoredState::new_default(now);
    };
    let Some(board_id) = board.get("id").and_then(Value::as_str) else {
        return StoredState::new_default(now);
    };

    let stamp = to_iso_string(now);
    let board = Board {
        id: board_id.to_string(),
        name: board
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(DEFAULT_BOARD_NAME)
            .to_string(),
        created_at: board
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| stamp.clone()),
        updated_at: stamp.clone(),
    };

    let tasks: Vec<Task> = read_list(object.get("tasks"), "task")
        .into_iter()
        .map(|mut task: Task| {
            task.normalize();
            task
        })
        .collect();

    let custom_fields: Vec<CustomFieldDefinition> = read_list(object.get("customFields"), "custom field")
        .into_iter()
        .map(normalize_field)
        .collect();

    StoredState {
        schema_version: SCHEMA_VERSION,
        updated_at: object
            .get("updatedAt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(stamp),
        board,
        tasks,
        custom_fields,
    }
}

pub fn normalize_snapshot(snapshot: &BoardSnapshot, now: DateTime<Utc>) -> anyhow::Result<StoredState> {
    let value = serde_json::to_value(snapshot).context("failed to serialize board snapshot")?;
    Ok(normalize_state(&value, now))
}

fn read_list<T: for<'de> Deserialize<'de>>(value: Option<&Value>, what: &str) -> Vec<T> {
    let Some(items) = value.and_then(Value::as_array) else {
        return vec![];
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| match T::deserialize(item) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(index = idx, error = %err, "dropping unreadable {what}");
                None
            }
        })
        .collect()
}

fn normalize_field(mut field: CustomFieldDefinition) -> CustomFieldDefinition {
    if field.field_type == CustomFieldType::Dropdown {
        field.options = field
            .options
            .iter()
            .map(|opt| opt.trim())
            .filter(|opt| !opt.is_empty())
            .map(str::to_string)
            .collect();
    } else {
        field.options.clear();
    }
    field
}

/// The board lives in one pretty-printed JSON file that is recreated with a
/// default board when missing or unreadable.
#[derive(Debug)]
pub struct JsonFileStore {
    pub data_dir: PathBuf,
    pub state_path: PathBuf,
}

impl JsonFileStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let state_path = data_dir.join(STATE_FILE_NAME);

        info!(
            data_dir = %data_dir.display(),
            state = %state_path.display(),
            "opened datastore"
        );
        Ok(Self {
            data_dir,
            state_path,
        })
    }

    fn read_state(&self, now: DateTime<Utc>) -> anyhow::Result<Option<StoredState>> {
        let raw = match fs::read_to_string(&self.state_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading {}", self.state_path.display()));
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => Ok(Some(normalize_state(&value, now))),
            Err(err) => {
                warn!(
                    file = %self.state_path.display(),
                    error = %err,
                    "failed to parse board state; recreating file"
                );
                Ok(None)
            }
        }
    }
}

impl SnapshotStore for JsonFileStore {
    #[tracing::instrument(skip(self, now), fields(file = %self.state_path.display()))]
    fn load(&mut self, now: DateTime<Utc>) -> anyhow::Result<BoardSnapshot> {
        if let Some(state) = self.read_state(now)? {
            debug!(tasks = state.tasks.len(), fields = state.custom_fields.len(), "loaded board state");
            return Ok(state.into_snapshot());
        }

        let fallback = StoredState::new_default(now);
        write_state_atomic(&self.state_path, &fallback)?;
        info!(board = %fallback.board.id, "created default board state");
        Ok(fallback.into_snapshot())
    }

    #[tracing::instrument(skip(self, snapshot, now), fields(file = %self.state_path.display()))]
    fn save(&mut self, snapshot: &BoardSnapshot, now: DateTime<Utc>) -> anyhow::Result<BoardSnapshot> {
        let mut state = normalize_snapshot(snapshot, now)?;
        state.updated_at = to_iso_string(now);
        write_state_atomic(&self.state_path, &state)
            .with_context(|| format!("failed to save {STATE_FILE_NAME}"))?;
        debug!(tasks = state.tasks.len(), "saved board state");
        Ok(state.into_snapshot())
    }
}

#[tracing::instrument(skip(path, state))]
fn write_state_atomic(path: &Path, state: &StoredState) -> anyhow::Result<()> {
    debug!(file = %path.display(), "writing board state atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut temp = NamedTempFile::new_in(dir)?;
    let serialized = serde_json::to_string_pretty(state)?;
    temp.write_all(serialized.as_bytes())?;
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}

/// Keeps the board in memory. Saves normalize exactly like the file store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Option<StoredState>,
    pub saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: BoardSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            state: Some(StoredState::from_snapshot(snapshot, now)),
            saves: 0,
        }
    }

    pub fn snapshot(&self) -> Option<BoardSnapshot> {
        self.state.clone().map(StoredState::into_snapshot)
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&mut self, now: DateTime<Utc>) -> anyhow::Result<BoardSnapshot> {
        let state = self
            .state
            .get_or_insert_with(|| StoredState::new_default(now));
        Ok(state.clone().into_snapshot())
    }

    fn save(&mut self, snapshot: &BoardSnapshot, now: DateTime<Utc>) -> anyhow::Result<BoardSnapshot> {
        let mut state = normalize_snapshot(snapshot, now)?;
        state.updated_at = to_iso_string(now);
        self.state = Some(state.clone());
        self.saves += 1;
        Ok(state.into_snapshot())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::task::TaskStatus;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 18, 9, 0, 0)
            .single()
            .expect("valid now")
    }

    #[test]
    fn missing_file_is_created_with_default_board() {
        let temp = tempdir().expect("tempdir");
        let mut store = JsonFileStore::open(&temp.path().join("data")).expect("open");

        let snapshot = store.load(now()).expect("load");
        assert_eq!(snapshot.board.name, DEFAULT_BOARD_NAME);
        assert!(snapshot.tasks.is_empty());

        let raw = fs::read_to_string(&store.state_path).expect("state file written");
        let on_disk: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(on_disk["schemaVersion"], 1);
        assert_eq!(on_disk["board"]["id"], snapshot.board.id.as_str());
        assert!(raw.contains("\n  \"board\""), "pretty printed");
    }

    #[test]
    fn corrupt_file_is_replaced() {
        let temp = tempdir().expect("tempdir");
        let mut store = JsonFileStore::open(temp.path()).expect("open");
        fs::write(&store.state_path, "{ definitely not json").expect("seed");

        let snapshot = store.load(now()).expect("load");
        assert!(snapshot.tasks.is_empty());
        let reloaded = store.load(now()).expect("reload");
        assert_eq!(reloaded.board.id, snapshot.board.id);
    }

    #[test]
    fn saves_survive_reopen() {
        let temp = tempdir().expect("tempdir");
        let mut store = JsonFileStore::open(temp.path()).expect("open");
        let mut snapshot = store.load(now()).expect("load");
        snapshot
            .tasks
            .push(Task::new(&snapshot.board.id, "Write report", now()));

        let saved = store.save(&snapshot, now()).expect("save");
        assert_eq!(saved.tasks.len(), 1);

        let mut reopened = JsonFileStore::open(temp.path()).expect("reopen");
        let loaded = reopened.load(now()).expect("load again");
        assert_eq!(loaded.tasks[0].title, "Write report");
        assert_eq!(loaded.board.id, snapshot.board.id);
    }

    #[test]
    fn payload_without_board_id_falls_back_to_default() {
        let state = normalize_state(&json!({"board": {"id": 7}, "tasks": [{"id": "x"}]}), now());
        assert!(state.tasks.is_empty());
        assert_eq!(state.board.name, DEFAULT_BOARD_NAME);

        let state = normalize_state(&json!("nope"), now());
        assert_eq!(state.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn normalization_is_lenient_per_entry() {
        let payload = json!({
            "board": {"id": "b1", "name": "   ", "created_at": "2026-01-01T00:00:00.000Z"},
            "tasks": [
                {"id": "t1", "title": "Ok", "status": "completed", "tags": "a, b,,",
                 "custom_field_values": {
                    "__estimated_minutes": 45,
                    "__completed_at": "2026-02-17T10:00:00.000Z",
                    "f1": "x"
                 }},
                {"title": "missing id"},
                {"id": "t2", "status": "archived", "priority": 9}
            ],
            "customFields": [
                {"id": "f1", "name": "Stage", "field_type": "text", "options": ["a"]},
                {"id": "f2", "name": "Size", "field_type": "dropdown", "options": [" S ", "", "M"]},
                42
            ]
        });

        let state = normalize_state(&payload, now());
        assert_eq!(state.board.name, DEFAULT_BOARD_NAME);
        assert_eq!(state.board.created_at, "2026-01-01T00:00:00.000Z");
        assert_eq!(state.tasks.len(), 2);

        let first = &state.tasks[0];
        assert_eq!(first.status, TaskStatus::Completed);
        assert_eq!(first.tags, vec!["a", "b"]);
        assert_eq!(first.estimated_minutes, Some(45.0));
        assert_eq!(first.completed_at.as_deref(), Some("2026-02-17T10:00:00.000Z"));
        assert_eq!(first.custom_field_values.len(), 1);

        assert_eq!(state.tasks[1].status, TaskStatus::Todo);
        assert_eq!(state.custom_fields.len(), 2);
        assert!(state.custom_fields[0].options.is_empty());
        assert_eq!(state.custom_fields[1].options, vec!["S", "M"]);
    }

    #[test]
    fn memory_store_round_trips_through_normalization() {
        let mut store = MemoryStore::new();
        let mut snapshot = store.load(now()).expect("load");
        let mut task = Task::new(&snapshot.board.id, "  padded tags ", now());
        task.tags = vec![" x ".to_string(), String::new()];
        snapshot.tasks.push(task);

        let saved = store.save(&snapshot, now()).expect("save");
        assert_eq!(saved.tasks[0].tags, vec!["x"]);
        assert_eq!(store.saves, 1);
        assert_eq!(store.snapshot(), Some(saved));
    }
}
