use std::sync::OnceLock;

use chrono::{
  DateTime,
  LocalResult,
  NaiveDate,
  NaiveDateTime,
  SecondsFormat,
  TimeZone,
  Timelike,
  Utc
};
use chrono_tz::Tz;
use regex::Regex;

const TIMEZONE_ENV_VAR: &str =
  "KANFLOW_TIMEZONE";
const DEFAULT_PROJECT_TIMEZONE: &str =
  "UTC";

const NAIVE_DATETIME_FORMATS: &[&str] = &[
  "%Y-%m-%dT%H:%M:%S%.f",
  "%Y-%m-%dT%H:%M:%S",
  "%Y-%m-%dT%H:%M",
  "%Y-%m-%d %H:%M:%S%.f",
  "%Y-%m-%d %H:%M:%S",
  "%Y-%m-%d %H:%M"
];

static PROJECT_TZ: OnceLock<Tz> =
  OnceLock::new();

/// Pins the project timezone from the
/// config file. The `KANFLOW_TIMEZONE`
/// environment variable still wins.
/// Later calls are ignored once a zone
/// has been resolved.
pub fn init_project_timezone(
  configured: Option<&str>
) -> &'static Tz {
  PROJECT_TZ.get_or_init(|| {
    if let Some(tz) = env_timezone() {
      return tz;
    }
    configured
      .and_then(|raw| {
        parse_timezone(raw, "config")
      })
      .unwrap_or_else(fallback_timezone)
  })
}

pub fn project_timezone() -> &'static Tz
{
  PROJECT_TZ.get_or_init(|| {
    env_timezone()
      .unwrap_or_else(fallback_timezone)
  })
}

fn env_timezone() -> Option<Tz> {
  let raw =
    std::env::var(TIMEZONE_ENV_VAR)
      .ok()?;
  parse_timezone(&raw, TIMEZONE_ENV_VAR)
}

fn fallback_timezone() -> Tz {
  parse_timezone(
    DEFAULT_PROJECT_TIMEZONE,
    "DEFAULT_PROJECT_TIMEZONE"
  )
  .unwrap_or_else(|| {
    tracing::error!(
      "failed to parse fallback \
       timezone; using UTC"
    );
    chrono_tz::UTC
  })
}

pub fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::info!(
        source,
        timezone = %trimmed,
        "configured project timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

#[must_use]
pub fn to_project_date(
  dt: DateTime<Utc>
) -> NaiveDate {
  dt.with_timezone(project_timezone())
    .date_naive()
}

/// `YYYY-MM-DD` in the project
/// timezone.
#[must_use]
pub fn day_key(
  dt: DateTime<Utc>
) -> String {
  format_day_key(to_project_date(dt))
}

#[must_use]
pub fn format_day_key(
  date: NaiveDate
) -> String {
  date.format("%Y-%m-%d").to_string()
}

/// Renders an instant the way the
/// stored documents carry timestamps:
/// RFC 3339, UTC, millisecond
/// precision.
#[must_use]
pub fn to_iso_string(
  dt: DateTime<Utc>
) -> String {
  dt.to_rfc3339_opts(
    SecondsFormat::Millis,
    true
  )
}

/// Lenient timestamp parsing. Accepts
/// RFC 3339, a bare `YYYY-MM-DD` (UTC
/// midnight) and naive date-times,
/// which are read as project-local.
pub fn parse_timestamp(
  raw: &str
) -> Option<DateTime<Utc>> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return None;
  }

  if let Ok(dt) =
    DateTime::parse_from_rfc3339(
      trimmed
    )
  {
    return Some(dt.with_timezone(&Utc));
  }

  if let Ok(date) =
    NaiveDate::parse_from_str(
      trimmed, "%Y-%m-%d"
    )
  {
    return date
      .and_hms_opt(0, 0, 0)
      .map(|ndt| ndt.and_utc());
  }

  NAIVE_DATETIME_FORMATS
    .iter()
    .find_map(|fmt| {
      NaiveDateTime::parse_from_str(
        trimmed, fmt
      )
      .ok()
    })
    .and_then(|ndt| {
      from_project_local(ndt, trimmed)
    })
}

/// Epoch milliseconds, with anything
/// unparsable collapsing to zero.
#[must_use]
pub fn timestamp_millis(
  raw: &str
) -> i64 {
  parse_timestamp(raw)
    .map(|dt| dt.timestamp_millis())
    .unwrap_or(0)
}

fn scheduled_time_pattern()
-> Option<&'static Regex> {
  static PATTERN: OnceLock<
    Option<Regex>
  > = OnceLock::new();
  PATTERN
    .get_or_init(|| {
      Regex::new(
        r"^([01]\d|2[0-3]):([0-5]\d)(?::[0-5]\d)?$"
      )
      .map_err(|err| {
        tracing::error!(error = %err, "invalid scheduled time pattern");
      })
      .ok()
    })
    .as_ref()
}

/// Minutes after midnight for a
/// scheduled time-of-day. `HH:MM` and
/// `HH:MM:SS` are read directly; any
/// other parsable timestamp
/// contributes its project-local hour
/// and minute.
pub fn parse_scheduled_minutes(
  raw: Option<&str>
) -> Option<u32> {
  let trimmed = raw?.trim();
  if trimmed.is_empty() {
    return None;
  }

  if let Some(caps) =
    scheduled_time_pattern()
      .and_then(|re| re.captures(trimmed))
  {
    let hours: u32 =
      caps[1].parse().ok()?;
    let minutes: u32 =
      caps[2].parse().ok()?;
    return Some(hours * 60 + minutes);
  }

  let local = parse_timestamp(trimmed)?
    .with_timezone(project_timezone());
  Some(local.hour() * 60 + local.minute())
}

fn from_project_local(
  local_naive: NaiveDateTime,
  context: &str
) -> Option<DateTime<Utc>> {
  match project_timezone()
    .from_local_datetime(&local_naive)
  {
    | LocalResult::Single(local_dt) => {
      Some(local_dt.with_timezone(&Utc))
    }
    | LocalResult::Ambiguous(
      first,
      second
    ) => {
      tracing::debug!(
        context,
        "ambiguous local datetime; using earliest"
      );
      let chosen = if first <= second {
        first
      } else {
        second
      };
      Some(chosen.with_timezone(&Utc))
    }
    | LocalResult::None => {
      tracing::debug!(
        context,
        "local datetime does not exist in project timezone"
      );
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::{
    TimeZone,
    Utc
  };

  use super::{
    day_key,
    parse_scheduled_minutes,
    parse_timestamp,
    project_timezone,
    timestamp_millis,
    to_iso_string
  };

  #[test]
  fn parses_clock_times() {
    assert_eq!(
      parse_scheduled_minutes(Some(
        "16:45"
      )),
      Some(16 * 60 + 45)
    );
    assert_eq!(
      parse_scheduled_minutes(Some(
        " 09:15:30 "
      )),
      Some(9 * 60 + 15)
    );
    assert_eq!(
      parse_scheduled_minutes(Some(
        "24:00"
      )),
      None
    );
    assert_eq!(
      parse_scheduled_minutes(Some("")),
      None
    );
    assert_eq!(
      parse_scheduled_minutes(None),
      None
    );
  }

  #[test]
  fn scheduled_timestamp_uses_local_clock()
  {
    let local = project_timezone()
      .with_ymd_and_hms(
        2026, 2, 20, 18, 5, 0
      )
      .single()
      .expect("valid local time");
    let raw = to_iso_string(
      local.with_timezone(&Utc)
    );
    assert_eq!(
      parse_scheduled_minutes(Some(
        &raw
      )),
      Some(18 * 60 + 5)
    );
  }

  #[test]
  fn unparsable_timestamps_are_zero() {
    assert_eq!(
      timestamp_millis("not-a-date"),
      0
    );
    assert!(
      parse_timestamp("   ").is_none()
    );
  }

  #[test]
  fn date_only_is_utc_midnight() {
    let parsed =
      parse_timestamp("2026-02-18")
        .expect("date-only parses");
    assert_eq!(
      parsed,
      Utc
        .with_ymd_and_hms(
          2026, 2, 18, 0, 0, 0
        )
        .single()
        .expect("valid utc")
    );
  }

  #[test]
  fn day_key_is_zero_padded() {
    let local = project_timezone()
      .with_ymd_and_hms(
        2026, 3, 4, 23, 59, 0
      )
      .single()
      .expect("valid local time");
    assert_eq!(
      day_key(local.with_timezone(&Utc)),
      "2026-03-04"
    );
  }
}
