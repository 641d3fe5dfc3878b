//! The single global focus countdown, independent of any task.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::storage::KeyValueStore;
use crate::timer::format_clock;

pub const SETTINGS_KEY: &str = "pomodoro_settings";
pub const TIME_LEFT_KEY: &str = "pomodoro_timeLeft";
pub const IS_ACTIVE_KEY: &str = "pomodoro_isActive";
pub const EXPECTED_END_KEY: &str = "pomodoro_expectedEndTime";

pub const DEFAULT_DURATION_SECONDS: u64 = 10 * 60;
pub const MIN_DURATION_SECONDS: u64 = 60;
pub const MAX_DURATION_SECONDS: u64 = 24 * 60 * 60;

pub const COMPLETION_MESSAGE: &str = "Break complete!";
pub const COMPLETION_DETAIL: &str = "Reset when you are ready for the next break.";

/// Clamps a requested duration into the supported range, or returns
/// `fallback` for values that are not finite numbers.
pub fn clamp_duration(value: f64, fallback: u64) -> u64 {
    if !value.is_finite() {
        return fallback;
    }
    (value.floor().max(0.0) as u64).clamp(MIN_DURATION_SECONDS, MAX_DURATION_SECONDS)
}

fn duration_from_settings(raw: Option<&str>, fallback: u64) -> u64 {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return fallback;
    };
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(_) => return fallback,
    };

    let value = match &parsed {
        Value::Number(_) => Some(&parsed),
        Value::Object(map) => map
            .get("break")
            .filter(|v| !v.is_null())
            .or_else(|| map.get("work")),
        _ => None,
    };
    value
        .and_then(Value::as_f64)
        .map(|secs| clamp_duration(secs, fallback))
        .unwrap_or(fallback)
}

#[derive(Debug)]
pub struct FocusTimer<S: KeyValueStore> {
    duration_seconds: u64,
    time_left: u64,
    is_active: bool,
    expected_end_time: Option<i64>,
    finished_while_away: bool,
    store: S,
}

impl<S: KeyValueStore> FocusTimer<S> {
    /// Restores the countdown. A countdown that ran out while nothing was
    /// watching is reported by [`FocusTimer::finished_while_away`].
    #[tracing::instrument(skip(store, now))]
    pub fn load(store: S, default_seconds: u64, now: DateTime<Utc>) -> Self {
        let default_seconds = default_seconds.clamp(MIN_DURATION_SECONDS, MAX_DURATION_SECONDS);
        let read = |key: &str| match store.get_item(key) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %format!("{err:#}"), "focus timer storage unavailable");
                None
            }
        };

        let duration_seconds = duration_from_settings(read(SETTINGS_KEY).as_deref(), default_seconds);
        let saved_active = read(IS_ACTIVE_KEY).as_deref() == Some("true");
        let saved_end = read(EXPECTED_END_KEY).and_then(|raw| raw.trim().parse::<i64>().ok());
        let saved_left = read(TIME_LEFT_KEY);

        let mut timer = Self {
            duration_seconds,
            time_left: duration_seconds,
            is_active: false,
            expected_end_time: None,
            finished_while_away: false,
            store,
        };

        match (saved_active, saved_end) {
            (true, Some(end)) if seconds_until(end, now) > MAX_DURATION_SECONDS => {
                warn!(end, "focus timer end is out of range; resetting");
            }
            (true, Some(end)) => {
                let remaining = seconds_until(end, now);
                timer.time_left = remaining;
                if remaining == 0 {
                    timer.finished_while_away = true;
                    info!("{COMPLETION_MESSAGE} (finished while closed)");
                } else {
                    timer.is_active = true;
                    timer.expected_end_time = Some(end);
                }
            }
            _ => {
                if let Some(raw) = saved_left {
                    timer.time_left = raw
                        .trim()
                        .parse::<i64>()
                        .ok()
                        .and_then(|secs| u64::try_from(secs.max(0)).ok())
                        .filter(|&secs| secs <= MAX_DURATION_SECONDS)
                        .unwrap_or(duration_seconds);
                }
            }
        }

        debug!(
            duration = timer.duration_seconds,
            time_left = timer.time_left,
            active = timer.is_active,
            "loaded focus timer"
        );
        timer.persist();
        timer
    }

    pub fn duration_seconds(&self) -> u64 {
        self.duration_seconds
    }

    pub fn time_left(&self) -> u64 {
        self.time_left
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn finished_while_away(&self) -> bool {
        self.finished_while_away
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn display(&self) -> String {
        format_clock(self.time_left, self.duration_seconds > 3600)
    }

    /// Starts or resumes from the current remaining time. A spent countdown
    /// stays put until it is reset.
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_active || self.time_left == 0 {
            return false;
        }
        self.is_active = true;
        let millis = i64::try_from(self.time_left)
            .unwrap_or(i64::MAX / 1000)
            .saturating_mul(1000);
        self.expected_end_time = Some(now.timestamp_millis().saturating_add(millis));
        info!(time_left = self.time_left, "focus timer started");
        self.persist();
        true
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        if let Some(end) = self.expected_end_time {
            self.time_left = seconds_until(end, now);
        }
        self.is_active = false;
        self.expected_end_time = None;
        info!(time_left = self.time_left, "focus timer paused");
        self.persist();
        true
    }

    /// Returns whether the timer is running afterwards.
    pub fn toggle(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_active {
            self.pause(now);
        } else {
            self.start(now);
        }
        self.is_active
    }

    pub fn reset(&mut self) {
        self.is_active = false;
        self.expected_end_time = None;
        self.time_left = self.duration_seconds;
        self.finished_while_away = false;
        self.persist();
    }

    /// Stops the countdown and restarts it at the new (clamped) duration.
    pub fn set_duration(&mut self, seconds: f64) -> u64 {
        self.duration_seconds = clamp_duration(seconds, self.duration_seconds);
        info!(duration = self.duration_seconds, "focus duration changed");
        self.reset();
        self.duration_seconds
    }

    /// Re-reads the wall clock; returns true exactly once, when the
    /// countdown reaches zero.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        let remaining = match self.expected_end_time {
            Some(end) => seconds_until(end, now),
            None => self.time_left.saturating_sub(1),
        };
        if remaining == self.time_left && remaining > 0 {
            return false;
        }

        self.time_left = remaining;
        let finished = remaining == 0;
        if finished {
            self.is_active = false;
            self.expected_end_time = None;
            info!("{COMPLETION_MESSAGE}");
        }
        self.persist();
        finished
    }

    fn persist(&mut self) {
        let settings = json!({ "break": self.duration_seconds }).to_string();
        let mut writes = vec![
            self.store.set_item(SETTINGS_KEY, &settings),
            self.store.set_item(TIME_LEFT_KEY, &self.time_left.to_string()),
            self.store.set_item(IS_ACTIVE_KEY, &self.is_active.to_string()),
        ];
        writes.push(match (self.is_active, self.expected_end_time) {
            (true, Some(end)) => self.store.set_item(EXPECTED_END_KEY, &end.to_string()),
            _ => self.store.remove_item(EXPECTED_END_KEY),
        });

        if let Some(err) = writes.into_iter().find_map(Result::err) {
            warn!(error = %format!("{err:#}"), "failed to persist focus timer");
        }
    }
}

fn seconds_until(end_ms: i64, now: DateTime<Utc>) -> u64 {
    let delta = end_ms.saturating_sub(now.timestamp_millis());
    u64::try_from(delta.max(0) / 1000).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::storage::MemoryKeyValueStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 18, 9, 0, 0)
            .single()
            .expect("valid instant")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn seeded(pairs: &[(&str, &str)]) -> MemoryKeyValueStore {
        let mut store = MemoryKeyValueStore::new();
        for (key, value) in pairs {
            store.set_item(key, value).expect("seed");
        }
        store
    }

    #[test]
    fn fresh_timer_uses_default_duration() {
        let timer = FocusTimer::load(MemoryKeyValueStore::new(), DEFAULT_DURATION_SECONDS, t0());
        assert_eq!(timer.duration_seconds(), 600);
        assert_eq!(timer.display(), "10:00");
        assert!(!timer.is_active());

        let stored = timer.store().get_item(SETTINGS_KEY).expect("get");
        assert_eq!(stored.as_deref(), Some(r#"{"break":600}"#));
    }

    #[test]
    fn accepts_legacy_settings_shapes() {
        for (raw, expected) in [
            ("900", 900),
            (r#"{"break":1200}"#, 1200),
            (r#"{"work":1500}"#, 1500),
            (r#"{"break":5}"#, 60),
            (r#"{"break":999999}"#, 86400),
            (r#"{"break":"soon"}"#, 600),
            ("nonsense", 600),
        ] {
            let timer = FocusTimer::load(seeded(&[(SETTINGS_KEY, raw)]), 600, t0());
            assert_eq!(timer.duration_seconds(), expected, "settings {raw}");
        }
    }

    #[test]
    fn countdown_is_wall_clock_anchored_and_completes_once() {
        let mut timer = FocusTimer::load(MemoryKeyValueStore::new(), 600, t0());
        assert!(timer.toggle(t0()));
        assert!(!timer.tick(at(1)));
        assert!(!timer.tick(at(400)));
        assert_eq!(timer.time_left(), 200);

        assert!(timer.tick(at(600)));
        assert!(!timer.is_active());
        assert!(!timer.tick(at(601)));
        assert!(!timer.start(at(602)));

        timer.reset();
        assert_eq!(timer.time_left(), 600);
    }

    #[test]
    fn pause_and_restore_keep_remaining_time() {
        let mut timer = FocusTimer::load(MemoryKeyValueStore::new(), 600, t0());
        timer.start(t0());
        assert!(!timer.toggle(at(100)));
        assert_eq!(timer.time_left(), 500);

        let reopened = FocusTimer::load(timer.into_store(), 600, at(5000));
        assert_eq!(reopened.time_left(), 500);
        assert!(!reopened.is_active());
        assert_eq!(reopened.store().get_item(EXPECTED_END_KEY).expect("get"), None);
    }

    #[test]
    fn running_timer_restores_from_expected_end() {
        let mut timer = FocusTimer::load(MemoryKeyValueStore::new(), 600, t0());
        timer.start(t0());
        let store = timer.into_store();

        let running = FocusTimer::load(store.clone(), 600, at(250));
        assert!(running.is_active());
        assert_eq!(running.time_left(), 350);

        let finished = FocusTimer::load(store, 600, at(900));
        assert!(finished.finished_while_away());
        assert!(!finished.is_active());
        assert_eq!(finished.time_left(), 0);
    }

    #[test]
    fn set_duration_clamps_and_stops() {
        let mut timer = FocusTimer::load(MemoryKeyValueStore::new(), 600, t0());
        timer.start(t0());
        assert_eq!(timer.set_duration(30.0), 60);
        assert!(!timer.is_active());
        assert_eq!(timer.time_left(), 60);
        assert_eq!(timer.set_duration(f64::NAN), 60);
        assert_eq!(timer.set_duration(7200.9), 7200);
        assert_eq!(timer.display(), "2:00:00");
    }

    #[test]
    fn oversized_saved_values_fall_back_to_the_duration() {
        let store = seeded(&[(TIME_LEFT_KEY, "9000000000000000000")]);
        let mut timer = FocusTimer::load(store, DEFAULT_DURATION_SECONDS, t0());
        assert_eq!(timer.time_left(), 600);
        assert!(timer.start(t0()));
        assert_eq!(timer.display(), "10:00");

        let far_end = i64::MAX.to_string();
        let store = seeded(&[(IS_ACTIVE_KEY, "true"), (EXPECTED_END_KEY, &far_end)]);
        let mut timer = FocusTimer::load(store, DEFAULT_DURATION_SECONDS, t0());
        assert!(!timer.is_active());
        assert_eq!(timer.time_left(), 600);
        assert!(!timer.tick(at(30)));
    }
}
