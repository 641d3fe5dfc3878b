use std::fs;
use std::path::{
  Path,
  PathBuf
};

use anyhow::{
  Context,
  anyhow
};
use serde::Deserialize;
use tracing::{
  debug,
  info,
  warn
};

use crate::calendar::DEFAULT_WINDOW_DAYS;
use crate::focus::{
  DEFAULT_DURATION_SECONDS,
  MAX_DURATION_SECONDS,
  MIN_DURATION_SECONDS
};
use crate::timer::DEFAULT_TIMER_MINUTES;

pub const CONFIG_ENV_VAR: &str =
  "KANFLOW_CONFIG";
const MAX_CALENDAR_DAYS: usize = 366;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
  pub days: usize
}

impl Default for CalendarConfig {
  fn default() -> Self {
    Self {
      days: DEFAULT_WINDOW_DAYS
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
  pub default_minutes: f64
}

impl Default for TimerConfig {
  fn default() -> Self {
    Self {
      default_minutes:
        DEFAULT_TIMER_MINUTES
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
  pub default_seconds: u64
}

impl Default for FocusConfig {
  fn default() -> Self {
    Self {
      default_seconds:
        DEFAULT_DURATION_SECONDS
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  pub data_dir: Option<PathBuf>,
  pub timezone: Option<String>,
  pub color:    bool,
  pub calendar: CalendarConfig,
  pub timer:    TimerConfig,
  pub focus:    FocusConfig,

  #[serde(skip)]
  pub loaded_files: Vec<PathBuf>
}

impl Default for Config {
  fn default() -> Self {
    Self {
      data_dir:     None,
      timezone:     None,
      color:        true,
      calendar:
        CalendarConfig::default(),
      timer:        TimerConfig::default(
      ),
      focus:        FocusConfig::default(
      ),
      loaded_files: vec![]
    }
  }
}

impl Config {
  #[tracing::instrument(skip(
    config_override
  ))]
  pub fn load(
    config_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let Some(path) =
      resolve_config_path(
        config_override
      )?
    else {
      debug!(
        "no config file found; using \
         defaults"
      );
      return Ok(Config::default());
    };

    info!(config = %path.display(), "loading config");
    let mut cfg =
      Config::from_file(&path)?;
    cfg.loaded_files.push(path);
    Ok(cfg)
  }

  pub fn from_file(
    path: &Path
  ) -> anyhow::Result<Self> {
    let text =
      fs::read_to_string(path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;
    Config::parse(&text).with_context(
      || {
        format!(
          "failed to parse {}",
          path.display()
        )
      }
    )
  }

  pub fn parse(
    text: &str
  ) -> anyhow::Result<Self> {
    let mut cfg: Config =
      toml::from_str(text)?;
    cfg.sanitize();
    Ok(cfg)
  }

  /// Replaces out-of-range values
  /// with their defaults or nearest
  /// bound.
  fn sanitize(&mut self) {
    let days = self.calendar.days;
    if days == 0 {
      warn!(
        days,
        "calendar.days must be \
         positive; using default"
      );
      self.calendar.days =
        DEFAULT_WINDOW_DAYS;
    } else if days > MAX_CALENDAR_DAYS
    {
      warn!(
        days,
        max = MAX_CALENDAR_DAYS,
        "calendar.days too large; \
         clamping"
      );
      self.calendar.days =
        MAX_CALENDAR_DAYS;
    }

    let minutes =
      self.timer.default_minutes;
    if !minutes.is_finite()
      || minutes <= 0.0
    {
      warn!(
        minutes,
        "timer.default_minutes must \
         be positive; using default"
      );
      self.timer.default_minutes =
        DEFAULT_TIMER_MINUTES;
    }

    let seconds =
      self.focus.default_seconds;
    let clamped = seconds.clamp(
      MIN_DURATION_SECONDS,
      MAX_DURATION_SECONDS
    );
    if clamped != seconds {
      warn!(
        seconds,
        clamped,
        "focus.default_seconds out \
         of range; clamping"
      );
      self.focus.default_seconds =
        clamped;
    }

    if let Some(tz) = &self.timezone
      && tz.trim().is_empty()
    {
      self.timezone = None;
    }
  }
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    expand_tilde(path)
  } else if let Some(cfg_value) =
    &cfg.data_dir
  {
    expand_tilde(cfg_value)
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_config_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(expand_tilde(path)));
  }

  if let Ok(config_env) =
    std::env::var(CONFIG_ENV_VAR)
  {
    if config_env.trim().is_empty()
      || config_env == "/dev/null"
    {
      return Ok(None);
    }
    return Ok(Some(expand_tilde(
      Path::new(&config_env)
    )));
  }

  let Some(config_dir) =
    dirs::config_dir()
  else {
    return Ok(None);
  };
  let candidate = config_dir
    .join("kanflow")
    .join("kanflow.toml");
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".kanflow"))
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use tempfile::tempdir;

  use super::*;

  #[test]
  fn empty_file_means_defaults() {
    let cfg = Config::parse("")
      .expect("parse empty");
    assert!(cfg.color);
    assert_eq!(cfg.calendar.days, 7);
    assert_eq!(
      cfg.timer.default_minutes,
      25.0
    );
    assert_eq!(
      cfg.focus.default_seconds,
      600
    );
    assert!(cfg.data_dir.is_none());
  }

  #[test]
  fn reads_every_section() {
    let cfg = Config::parse(
      r#"
data_dir = "/tmp/kanflow"
timezone = "America/New_York"
color = false

[calendar]
days = 14

[timer]
default_minutes = 50

[focus]
default_seconds = 300
"#
    )
    .expect("parse");

    assert_eq!(
      cfg.data_dir.as_deref(),
      Some(Path::new("/tmp/kanflow"))
    );
    assert_eq!(
      cfg.timezone.as_deref(),
      Some("America/New_York")
    );
    assert!(!cfg.color);
    assert_eq!(cfg.calendar.days, 14);
    assert_eq!(
      cfg.timer.default_minutes,
      50.0
    );
    assert_eq!(
      cfg.focus.default_seconds,
      300
    );
  }

  #[test]
  fn out_of_range_values_are_sanitized() {
    let cfg = Config::parse(
      r#"
timezone = "  "
[calendar]
days = 0
[timer]
default_minutes = -5.0
[focus]
default_seconds = 5
"#
    )
    .expect("parse");

    assert!(cfg.timezone.is_none());
    assert_eq!(cfg.calendar.days, 7);
    assert_eq!(
      cfg.timer.default_minutes,
      25.0
    );
    assert_eq!(
      cfg.focus.default_seconds,
      60
    );
  }

  #[test]
  fn explicit_file_must_exist_and_parse() {
    let temp =
      tempdir().expect("tempdir");
    let missing =
      temp.path().join("nope.toml");
    assert!(
      Config::load(Some(&missing))
        .is_err()
    );

    let broken =
      temp.path().join("broken.toml");
    fs::write(&broken, "color = ")
      .expect("write");
    assert!(
      Config::load(Some(&broken))
        .is_err()
    );

    let good =
      temp.path().join("good.toml");
    fs::write(&good, "color = false")
      .expect("write");
    let cfg = Config::load(Some(&good))
      .expect("load");
    assert!(!cfg.color);
    assert_eq!(cfg.loaded_files, vec![
      good
    ]);
  }

  #[test]
  fn data_dir_override_wins_and_is_created()
  {
    let temp =
      tempdir().expect("tempdir");
    let cfg = Config {
      data_dir: Some(
        temp.path().join("from-config")
      ),
      ..Config::default()
    };
    let cli_dir =
      temp.path().join("from-cli");

    let resolved = resolve_data_dir(
      &cfg,
      Some(&cli_dir)
    )
    .expect("resolve");
    assert_eq!(resolved, cli_dir);
    assert!(resolved.is_dir());

    let from_cfg =
      resolve_data_dir(&cfg, None)
        .expect("resolve");
    assert!(
      from_cfg.ends_with("from-config")
    );
  }
}
