pub mod board;
pub mod calendar;
pub mod cli;
pub mod commands;
pub mod config;
pub mod datastore;
pub mod datetime;
pub mod focus;
pub mod organize;
pub mod render;
pub mod sorting;
pub mod storage;
pub mod task;
pub mod timer;

use std::ffi::OsString;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{
  debug,
  info
};

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let cli =
    cli::GlobalCli::parse_from(raw_args);

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting kanflow"
  );

  let cfg = config::Config::load(
    cli.config.as_deref()
  )?;
  let tz =
    datetime::init_project_timezone(
      cfg.timezone.as_deref()
    );
  debug!(timezone = %tz, "project timezone");

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let mut renderer =
    render::Renderer::new(&cfg);
  let command = cli.command.unwrap_or(
    cli::Command::Workspace(
      cli::WorkspaceCommand::Board(
        cli::BoardArgs::default()
      )
    )
  );

  commands::dispatch(
    command,
    &cfg,
    &data_dir,
    &mut renderer,
    Utc::now()
  )?;

  info!("done");
  Ok(())
}
