use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::builder::ValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::organize::{GroupBy, SortBy};
use crate::task::{CustomFieldType, TaskPriority, TaskStatus};

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected FIELD=VALUE, got: {s}"))?;
        let key = k.trim();
        if key.is_empty() {
            return Err(anyhow!("field name missing in: {s}"));
        }
        Ok(Self {
            key: key.to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kanflow",
    version,
    about = "Kanban task board with per-task focus timers",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    /// Config file (defaults to $KANFLOW_CONFIG, then ~/.config/kanflow/kanflow.toml).
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding kanban-state.json and local-storage.json.
    #[arg(long = "data", global = true)]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    #[command(flatten)]
    Workspace(WorkspaceCommand),
    /// The global focus countdown.
    Focus {
        #[command(subcommand)]
        action: FocusCommand,
    },
}

/// Commands that open the board and its task timers.
#[derive(Subcommand, Debug, Clone)]
pub enum WorkspaceCommand {
    /// Show the three columns (the default).
    Board(BoardArgs),
    /// Create a task.
    Add(AddArgs),
    /// Change fields of a task.
    Edit(EditArgs),
    /// Move a task to another column.
    Move {
        id: String,
        #[arg(value_parser = ValueParser::new(|s: &str| s.parse::<TaskStatus>()))]
        status: TaskStatus,
    },
    /// Show every field of one task.
    Show { id: String },
    Delete { id: String },
    /// Append a bullet note to a task's description.
    Note {
        id: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// List the tags used on the board.
    Tags,
    /// Completed tasks per day.
    Calendar {
        #[arg(long)]
        days: Option<usize>,
    },
    Field {
        #[command(subcommand)]
        action: FieldCommand,
    },
    /// Per-task countdown timers.
    Timer {
        #[command(subcommand)]
        action: TimerCommand,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct BoardArgs {
    /// Case-insensitive match against title, description and tags.
    #[arg(long, short = 's')]
    pub search: Option<String>,

    /// Only tasks carrying any of these tags.
    #[arg(long = "tag", short = 't', action = ArgAction::Append)]
    pub tags: Vec<String>,

    #[arg(long, value_parser = ValueParser::new(|s: &str| s.parse::<SortBy>()))]
    pub sort: Option<SortBy>,

    #[arg(long, value_parser = ValueParser::new(|s: &str| s.parse::<GroupBy>()))]
    pub group: Option<GroupBy>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct TaskFieldArgs {
    #[arg(long, short = 'd')]
    pub description: Option<String>,

    #[arg(long, value_parser = ValueParser::new(|s: &str| s.parse::<TaskStatus>()))]
    pub status: Option<TaskStatus>,

    #[arg(long, short = 'p', value_parser = ValueParser::new(|s: &str| s.parse::<TaskPriority>()))]
    pub priority: Option<TaskPriority>,

    /// Due date, `YYYY-MM-DD` or a full timestamp.
    #[arg(long)]
    pub due: Option<String>,

    /// Scheduled time of day, `HH:MM`.
    #[arg(long = "at")]
    pub scheduled_time: Option<String>,

    /// Estimated minutes; also the task's timer length.
    #[arg(long = "estimate", short = 'e')]
    pub estimated_minutes: Option<f64>,

    #[arg(long = "tag", short = 't', action = ArgAction::Append)]
    pub tags: Vec<String>,

    #[arg(long)]
    pub assignee: Option<String>,

    /// Custom field value, by field name or id.
    #[arg(
        long = "set",
        value_parser = ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append
    )]
    pub custom_values: Vec<KeyVal>,
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    #[arg(num_args = 0..)]
    pub title: Vec<String>,

    #[command(flatten)]
    pub fields: TaskFieldArgs,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    pub id: String,

    #[arg(long)]
    pub title: Option<String>,

    #[command(flatten)]
    pub fields: TaskFieldArgs,

    #[arg(long)]
    pub clear_due: bool,

    #[arg(long)]
    pub clear_time: bool,

    #[arg(long)]
    pub clear_estimate: bool,

    /// Remove all tags (applied before any --tag).
    #[arg(long)]
    pub clear_tags: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum FieldCommand {
    List,
    Add {
        name: String,
        #[arg(
            long = "type",
            default_value = "text",
            value_parser = ValueParser::new(|s: &str| s.parse::<CustomFieldType>())
        )]
        field_type: CustomFieldType,
        /// Dropdown choice; repeatable.
        #[arg(long = "option", action = ArgAction::Append)]
        options: Vec<String>,
    },
    Delete {
        field: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum TimerCommand {
    #[command(flatten)]
    Task(TaskTimerCommand),
    Status { id: Option<String> },
}

/// Timer actions aimed at one task.
#[derive(Subcommand, Debug, Clone)]
pub enum TaskTimerCommand {
    Start { id: String },
    Pause { id: String },
    Toggle { id: String },
    Reset { id: String },
    /// Answer the completion prompt: the task is done.
    Done { id: String },
    /// Answer the completion prompt: keep working.
    NotYet { id: String },
    /// Close the completion prompt without answering.
    Dismiss { id: String },
}

impl TaskTimerCommand {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Start { id }
            | Self::Pause { id }
            | Self::Toggle { id }
            | Self::Reset { id }
            | Self::Done { id }
            | Self::NotYet { id }
            | Self::Dismiss { id } => id,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum FocusCommand {
    Start,
    Pause,
    Reset,
    /// Set the countdown length in minutes (stops the timer).
    Duration { minutes: f64 },
    Status,
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> GlobalCli {
        GlobalCli::try_parse_from(std::iter::once("kanflow").chain(args.iter().copied()))
            .expect("arguments parse")
    }

    #[test]
    fn no_subcommand_means_board() {
        let cli = parse(&["-vv"]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.command.is_none());
    }

    #[test]
    fn add_collects_title_words_and_fields() {
        let cli = parse(&[
            "add", "Write", "report", "-p", "high", "--at", "09:30", "-e", "45", "-t", "work",
            "--set", "Stage=draft",
        ]);
        let Some(Command::Workspace(WorkspaceCommand::Add(add))) = cli.command else {
            panic!("expected add");
        };
        assert_eq!(add.title.join(" "), "Write report");
        assert_eq!(add.fields.priority, Some(TaskPriority::High));
        assert_eq!(add.fields.scheduled_time.as_deref(), Some("09:30"));
        assert_eq!(add.fields.estimated_minutes, Some(45.0));
        assert_eq!(add.fields.tags, vec!["work"]);
        assert_eq!(add.fields.custom_values[0].key, "Stage");
        assert_eq!(add.fields.custom_values[0].value, "draft");
    }

    #[test]
    fn board_options_parse_wire_names() {
        let cli = parse(&["board", "--sort", "due-date", "--group", "tag", "--data", "/tmp/x"]);
        let Some(Command::Workspace(WorkspaceCommand::Board(board))) = cli.command else {
            panic!("expected board");
        };
        assert_eq!(board.sort, Some(SortBy::DueDate));
        assert_eq!(board.group, Some(GroupBy::Tag));
        assert_eq!(cli.data, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn rejects_unknown_status_and_bad_pairs() {
        let args = ["kanflow", "move", "abc", "archived"];
        assert!(GlobalCli::try_parse_from(args).is_err());
        assert!("novalue".parse::<KeyVal>().is_err());
        assert!("=x".parse::<KeyVal>().is_err());
    }

    #[test]
    fn timer_subcommands_take_ids() {
        let cli = parse(&["timer", "not-yet", "ab12"]);
        let Some(Command::Workspace(WorkspaceCommand::Timer {
            action: TimerCommand::Task(action),
        })) = cli.command
        else {
            panic!("expected a task timer action");
        };
        assert!(matches!(action, TaskTimerCommand::NotYet { .. }));
        assert_eq!(action.task_id(), "ab12");

        let cli = parse(&["timer", "status"]);
        assert!(matches!(
            cli.command,
            Some(Command::Workspace(WorkspaceCommand::Timer {
                action: TimerCommand::Status { id: None }
            }))
        ));
    }

    #[test]
    fn focus_is_its_own_command() {
        let cli = parse(&["focus", "duration", "15"]);
        assert!(matches!(
            cli.command,
            Some(Command::Focus { action: FocusCommand::Duration { minutes } }) if minutes == 15.0
        ));
    }
}
