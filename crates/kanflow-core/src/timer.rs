//! Per-task countdown timers.
//!
//! Timers are anchored to an absolute expected-end instant while running and
//! re-derived from the wall clock on every tick, so a suspended process or a
//! restart never drifts the countdown. One scheduler owns every timer; each
//! state change rewrites the whole map under [`TIMER_STORAGE_KEY`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::storage::KeyValueStore;

pub const TIMER_STORAGE_KEY: &str = "task_pomodoro_timers";
pub const DEFAULT_TIMER_MINUTES: f64 = 25.0;

/// Timers longer than this render with an hour component.
const HOUR_DISPLAY_THRESHOLD_SECS: u64 = 3600;

/// Running timers keyed by task id, with their remaining seconds.
pub type ActiveTimers = BTreeMap<String, u64>;

type ActiveTimersListener = Box<dyn FnMut(&ActiveTimers)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Idle,
    Running,
    Paused,
    /// Ran out; waiting for the user to say whether the task is done.
    AwaitingDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    FirstStart,
    Resumed,
    AlreadyRunning,
    AwaitingDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Started(StartOutcome),
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    NotYet,
}

impl Resolution {
    pub fn from_completed(completed: bool) -> Self {
        if completed {
            Resolution::Completed
        } else {
            Resolution::NotYet
        }
    }

    /// Whether the focus view should close after this decision.
    pub fn closes_view(self) -> bool {
        self == Resolution::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTimer {
    pub initial_seconds: u64,
    pub time_left: u64,
    pub is_running: bool,
    pub has_started: bool,
    /// Epoch milliseconds; only set while running.
    pub expected_end_time: Option<i64>,
    pub is_completion_prompt_open: bool,
}

impl TaskTimer {
    pub fn new(initial_seconds: u64) -> Self {
        Self {
            initial_seconds,
            time_left: initial_seconds,
            is_running: false,
            has_started: false,
            expected_end_time: None,
            is_completion_prompt_open: false,
        }
    }

    pub fn phase(&self) -> TimerPhase {
        if self.is_running {
            TimerPhase::Running
        } else if self.is_completion_prompt_open && self.time_left == 0 {
            TimerPhase::AwaitingDecision
        } else if self.has_started {
            TimerPhase::Paused
        } else {
            TimerPhase::Idle
        }
    }

    /// Seconds left as of `now`, read from the wall clock while running.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> u64 {
        match (self.is_running, self.expected_end_time) {
            (true, Some(end)) => seconds_until(end, now),
            _ => self.time_left,
        }
    }

    pub fn shows_hours(&self) -> bool {
        self.initial_seconds > HOUR_DISPLAY_THRESHOLD_SECS
    }

    pub fn display(&self) -> String {
        format_clock(self.time_left, self.shows_hours())
    }

    fn start_at(&mut self, now: DateTime<Utc>) {
        self.is_running = true;
        self.expected_end_time = Some(end_after(now, self.time_left));
    }
}

impl fmt::Display for TaskTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// `MM:SS`, or `H:MM:SS` with an unpadded hour when `show_hours` is set.
pub fn format_clock(seconds: u64, show_hours: bool) -> String {
    if show_hours {
        let hours = seconds / 3600;
        let mins = (seconds % 3600) / 60;
        let secs = seconds % 60;
        return format!("{hours}:{mins:02}:{secs:02}");
    }
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Countdown length for a task estimate; non-positive or missing estimates
/// use `default_minutes`.
pub fn initial_seconds_for(estimated_minutes: Option<f64>, default_minutes: f64) -> u64 {
    let minutes = estimated_minutes
        .filter(|m| m.is_finite() && *m > 0.0)
        .unwrap_or(default_minutes);
    (minutes * 60.0).round().max(0.0) as u64
}

fn seconds_until(end_ms: i64, now: DateTime<Utc>) -> u64 {
    let delta = end_ms.saturating_sub(now.timestamp_millis());
    u64::try_from(delta.max(0) / 1000).unwrap_or(0)
}

fn end_after(now: DateTime<Utc>, seconds: u64) -> i64 {
    let millis = i64::try_from(seconds).unwrap_or(i64::MAX / 1000).saturating_mul(1000);
    now.timestamp_millis().saturating_add(millis)
}

/// Shape tolerated when reading persisted timers; every field may be missing
/// or of the wrong type.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoredTimer {
    initial_seconds: Value,
    time_left: Value,
    is_running: Value,
    has_started: Value,
    expected_end_time: Value,
    is_completion_prompt_open: Value,
}

fn finite(value: &Value) -> Option<f64> {
    value.as_f64().filter(|n| n.is_finite())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
        Value::Null => false,
    }
}

impl StoredTimer {
    fn restore(self, default_seconds: u64, now: DateTime<Utc>) -> TaskTimer {
        let initial_seconds = finite(&self.initial_seconds)
            .filter(|s| *s > 0.0)
            .map(|s| s as u64)
            .unwrap_or(default_seconds);
        let time_left = finite(&self.time_left)
            .filter(|s| *s >= 0.0)
            .map(|s| s as u64)
            .unwrap_or(initial_seconds);
        let is_running = truthy(&self.is_running);
        let has_started = truthy(&self.has_started);
        let prompt_open = truthy(&self.is_completion_prompt_open);
        let expected_end_time = finite(&self.expected_end_time)
            .filter(|ms| *ms != 0.0)
            .map(|ms| ms as i64);

        if let (true, Some(end)) = (is_running, expected_end_time) {
            let remaining = seconds_until(end, now);
            return TaskTimer {
                initial_seconds,
                time_left: remaining,
                is_running: remaining > 0,
                has_started: has_started || remaining > 0,
                expected_end_time: (remaining > 0).then_some(end),
                is_completion_prompt_open: remaining == 0 || prompt_open,
            };
        }

        TaskTimer {
            initial_seconds,
            time_left,
            is_running: false,
            has_started,
            expected_end_time: None,
            is_completion_prompt_open: prompt_open,
        }
    }
}

fn restore_timers(raw: &str, default_seconds: u64, now: DateTime<Utc>) -> BTreeMap<String, TaskTimer> {
    let parsed: BTreeMap<String, Value> = match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "stored timers are not a JSON object; starting empty");
            return BTreeMap::new();
        }
    };

    parsed
        .into_iter()
        .filter_map(|(task_id, entry)| {
            if !entry.is_object() {
                debug!(task_id = %task_id, "skipping malformed stored timer");
                return None;
            }
            let stored: StoredTimer = serde_json::from_value(entry).ok()?;
            Some((task_id, stored.restore(default_seconds, now)))
        })
        .collect()
}

/// Owns every task timer, the single tick and the persistence side effect.
pub struct TimerScheduler<S: KeyValueStore> {
    timers: BTreeMap<String, TaskTimer>,
    store: S,
    default_minutes: f64,
    listener: Option<ActiveTimersListener>,
}

impl<S: KeyValueStore> fmt::Debug for TimerScheduler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("timers", &self.timers)
            .field("default_minutes", &self.default_minutes)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

impl<S: KeyValueStore> TimerScheduler<S> {
    /// Restores persisted timers, re-deriving remaining time from each
    /// expected-end instant. Unreadable storage starts an empty map.
    #[tracing::instrument(skip(store, now))]
    pub fn open(store: S, default_minutes: f64, now: DateTime<Utc>) -> Self {
        let default_minutes = if default_minutes.is_finite() && default_minutes > 0.0 {
            default_minutes
        } else {
            DEFAULT_TIMER_MINUTES
        };
        let default_seconds = initial_seconds_for(None, default_minutes);

        let timers = match store.get_item(TIMER_STORAGE_KEY) {
            Ok(Some(raw)) => restore_timers(&raw, default_seconds, now),
            Ok(None) => BTreeMap::new(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "timer storage unavailable; starting empty");
                BTreeMap::new()
            }
        };

        let awaiting = timers
            .values()
            .filter(|t| t.phase() == TimerPhase::AwaitingDecision)
            .count();
        info!(count = timers.len(), awaiting, "restored task timers");

        let mut scheduler = Self {
            timers,
            store,
            default_minutes,
            listener: None,
        };
        scheduler.persist();
        scheduler
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Registers the receiver of the active-timers projection. It is called
    /// right away and then after every state change.
    pub fn set_active_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&ActiveTimers) + 'static,
    {
        let mut listener: ActiveTimersListener = Box::new(listener);
        listener(&self.active_timers());
        self.listener = Some(listener);
    }

    pub fn timer(&self, task_id: &str) -> Option<&TaskTimer> {
        self.timers.get(task_id)
    }

    pub fn timers(&self) -> impl Iterator<Item = (&String, &TaskTimer)> {
        self.timers.iter()
    }

    pub fn phase(&self, task_id: &str) -> TimerPhase {
        self.timers
            .get(task_id)
            .map(TaskTimer::phase)
            .unwrap_or(TimerPhase::Idle)
    }

    pub fn display(&self, task_id: &str) -> Option<String> {
        self.timers.get(task_id).map(TaskTimer::display)
    }

    /// Task ids whose countdown ran out and still wait for a decision.
    pub fn awaiting_decision(&self) -> Vec<String> {
        self.timers
            .iter()
            .filter(|(_, timer)| timer.phase() == TimerPhase::AwaitingDecision)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn active_timers(&self) -> ActiveTimers {
        self.timers
            .iter()
            .filter(|(_, timer)| timer.is_running && timer.time_left > 0)
            .map(|(id, timer)| (id.clone(), timer.time_left))
            .collect()
    }

    fn default_timer(&self) -> TaskTimer {
        TaskTimer::new(initial_seconds_for(None, self.default_minutes))
    }

    /// Creates the timer on first reference and keeps its reference duration
    /// in line with the task estimate. An idle timer is retargeted outright;
    /// a started one keeps its countdown and only updates the reference.
    pub fn sync_duration(&mut self, task_id: &str, estimated_minutes: Option<f64>) -> &TaskTimer {
        let initial_seconds = initial_seconds_for(estimated_minutes, self.default_minutes);
        let current = self.timers.get(task_id).cloned();

        let next = match current {
            None => Some(TaskTimer::new(initial_seconds)),
            Some(existing) if existing.initial_seconds == initial_seconds => None,
            Some(existing) if !existing.has_started => Some(TaskTimer {
                initial_seconds,
                time_left: initial_seconds,
                ..existing
            }),
            Some(existing) => Some(TaskTimer {
                initial_seconds,
                ..existing
            }),
        };

        if let Some(timer) = next {
            debug!(task_id, initial_seconds, "synced timer duration");
            self.update(task_id, timer);
        }
        &self.timers[task_id]
    }

    pub fn start(&mut self, task_id: &str, now: DateTime<Utc>) -> StartOutcome {
        let mut timer = self
            .timers
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| self.default_timer());

        let outcome = match timer.phase() {
            TimerPhase::Running => return StartOutcome::AlreadyRunning,
            TimerPhase::AwaitingDecision => return StartOutcome::AwaitingDecision,
            TimerPhase::Idle => {
                timer.has_started = true;
                timer.is_completion_prompt_open = false;
                StartOutcome::FirstStart
            }
            TimerPhase::Paused => StartOutcome::Resumed,
        };
        timer.start_at(now);

        info!(task_id, ?outcome, time_left = timer.time_left, "timer started");
        self.update(task_id, timer);
        outcome
    }

    /// Freezes the countdown at its wall-clock value. Returns whether the
    /// timer was running.
    pub fn pause(&mut self, task_id: &str, now: DateTime<Utc>) -> bool {
        let Some(existing) = self.timers.get(task_id) else {
            return false;
        };
        if !existing.is_running {
            return false;
        }

        let timer = TaskTimer {
            time_left: existing.remaining_at(now),
            is_running: false,
            expected_end_time: None,
            ..existing.clone()
        };
        info!(task_id, time_left = timer.time_left, "timer paused");
        self.update(task_id, timer);
        true
    }

    /// Start, pause or resume, the way a single play/pause control does.
    pub fn toggle(&mut self, task_id: &str, now: DateTime<Utc>) -> ToggleOutcome {
        if self.pause(task_id, now) {
            ToggleOutcome::Paused
        } else {
            ToggleOutcome::Started(self.start(task_id, now))
        }
    }

    pub fn reset(&mut self, task_id: &str) {
        let initial_seconds = self
            .timers
            .get(task_id)
            .map(|t| t.initial_seconds)
            .unwrap_or_else(|| self.default_timer().initial_seconds);
        info!(task_id, initial_seconds, "timer reset");
        self.update(task_id, TaskTimer::new(initial_seconds));
    }

    /// Records the user's answer to the completion prompt. The timer goes
    /// back to idle either way.
    pub fn resolve(&mut self, task_id: &str, completed: bool) -> Resolution {
        let resolution = Resolution::from_completed(completed);
        let initial_seconds = self
            .timers
            .get(task_id)
            .map(|t| t.initial_seconds)
            .unwrap_or_else(|| self.default_timer().initial_seconds);
        info!(task_id, ?resolution, "timer resolved");
        self.update(task_id, TaskTimer::new(initial_seconds));
        resolution
    }

    /// Closes the completion prompt without answering it.
    pub fn dismiss_prompt(&mut self, task_id: &str) {
        let Some(existing) = self.timers.get(task_id) else {
            return;
        };
        if !existing.is_completion_prompt_open {
            return;
        }
        let timer = TaskTimer {
            is_completion_prompt_open: false,
            ..existing.clone()
        };
        self.update(task_id, timer);
    }

    pub fn remove(&mut self, task_id: &str) -> Option<TaskTimer> {
        let removed = self.timers.remove(task_id)?;
        self.changed();
        Some(removed)
    }

    /// Re-evaluates every running timer against `now` and commits the result
    /// as one update. Returns the ids that ran out on this tick.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut next = self.timers.clone();
        let mut changed = false;
        let mut elapsed = Vec::new();

        for (task_id, timer) in &self.timers {
            if !timer.is_running {
                continue;
            }

            let end = timer
                .expected_end_time
                .unwrap_or_else(|| end_after(now, timer.time_left));
            let remaining = seconds_until(end, now);

            if remaining == 0 {
                next.insert(
                    task_id.clone(),
                    TaskTimer {
                        time_left: 0,
                        is_running: false,
                        has_started: true,
                        expected_end_time: None,
                        is_completion_prompt_open: true,
                        ..timer.clone()
                    },
                );
                if !timer.is_completion_prompt_open {
                    elapsed.push(task_id.clone());
                }
                changed = true;
                continue;
            }

            if remaining != timer.time_left || timer.expected_end_time != Some(end) {
                next.insert(
                    task_id.clone(),
                    TaskTimer {
                        time_left: remaining,
                        expected_end_time: Some(end),
                        ..timer.clone()
                    },
                );
                changed = true;
            }
        }

        if changed {
            self.timers = next;
            self.changed();
        }
        if !elapsed.is_empty() {
            info!(?elapsed, "task timers elapsed");
        }
        elapsed
    }

    fn update(&mut self, task_id: &str, timer: TaskTimer) {
        self.timers.insert(task_id.to_string(), timer);
        self.changed();
    }

    fn changed(&mut self) {
        self.persist();
        if let Some(listener) = self.listener.as_mut() {
            let active = self
                .timers
                .iter()
                .filter(|(_, timer)| timer.is_running && timer.time_left > 0)
                .map(|(id, timer)| (id.clone(), timer.time_left))
                .collect();
            listener(&active);
        }
    }

    fn persist(&mut self) {
        let serialized = match serde_json::to_string(&self.timers) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(error = %err, "failed to serialize task timers");
                return;
            }
        };
        if let Err(err) = self.store.set_item(TIMER_STORAGE_KEY, &serialized) {
            warn!(error = %format!("{err:#}"), "failed to persist task timers");
        }
    }
}
