use chrono::{DateTime, Duration, TimeZone, Utc};
use kanflow_core::board::BoardState;
use kanflow_core::calendar::{build_day_keys, group_completed_by_day};
use kanflow_core::datastore::{JsonFileStore, STATE_FILE_NAME};
use kanflow_core::storage::{FileKeyValueStore, LOCAL_STORAGE_FILE_NAME};
use kanflow_core::task::{TaskDraft, TaskStatus};
use kanflow_core::timer::{Resolution, StartOutcome, TimerPhase, TimerScheduler};
use tempfile::tempdir;

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

fn open_timers(dir: &std::path::Path, now: DateTime<Utc>) -> TimerScheduler<FileKeyValueStore> {
    let kv = FileKeyValueStore::open(&dir.join(LOCAL_STORAGE_FILE_NAME)).expect("open kv");
    TimerScheduler::open(kv, 25.0, now)
}

#[test]
fn timer_runs_out_between_sessions_and_completes_the_task() {
    let temp = tempdir().expect("tempdir");
    let start = at(12, 0);

    let task_id = {
        let store = JsonFileStore::open(temp.path()).expect("open datastore");
        let mut board = BoardState::open(store, start);
        let task = board
            .create_task(
                TaskDraft {
                    title: Some("Review pull request".to_string()),
                    estimated_minutes: Some(5.0),
                    tags: vec!["work".to_string()],
                    ..TaskDraft::default()
                },
                start,
            )
            .expect("create task");

        let mut timers = open_timers(temp.path(), start);
        timers.sync_duration(&task.id, task.estimate());
        assert_eq!(timers.start(&task.id, start), StartOutcome::FirstStart);
        assert!(board.timer_started(&task.id, start).expect("auto move"));
        assert_eq!(
            board.task(&task.id).map(|t| t.status),
            Some(TaskStatus::InProgress)
        );
        task.id
    };

    assert!(temp.path().join(STATE_FILE_NAME).is_file());

    let later = start + Duration::minutes(7);
    let store = JsonFileStore::open(temp.path()).expect("reopen datastore");
    let mut board = BoardState::open(store, later);
    let mut timers = open_timers(temp.path(), later);

    assert_eq!(timers.phase(&task_id), TimerPhase::AwaitingDecision);
    assert_eq!(timers.awaiting_decision(), vec![task_id.clone()]);
    assert!(timers.tick(later).is_empty());

    let resolution = timers.resolve(&task_id, true);
    assert_eq!(resolution, Resolution::Completed);
    assert!(board.timer_decision(&task_id, resolution, later).expect("complete"));
    assert_eq!(timers.phase(&task_id), TimerPhase::Idle);

    let done = board.completed_today(later);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].title, "Review pull request");

    let days = build_day_keys(later, 3);
    let grouped = group_completed_by_day(board.tasks(), &days);
    assert_eq!(grouped.get(&days[0]).map(Vec::len), Some(1));
}

#[test]
fn deleting_a_task_survives_a_reload() {
    let temp = tempdir().expect("tempdir");
    let now = at(9, 30);

    let store = JsonFileStore::open(temp.path()).expect("open datastore");
    let mut board = BoardState::open(store, now);
    let keep = board
        .create_task(TaskDraft::default(), now)
        .expect("first task");
    let gone = board
        .create_task(
            TaskDraft {
                title: Some("Throwaway".to_string()),
                ..TaskDraft::default()
            },
            now,
        )
        .expect("second task");
    board.delete_task(&gone.id, now).expect("delete");

    let reopened = BoardState::open(JsonFileStore::open(temp.path()).expect("reopen"), now);
    let ids: Vec<&str> = reopened.tasks().iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec![keep.id.as_str()]);
    assert_eq!(reopened.tasks()[0].title, "New Task");
}
