//! Command-line arguments.

use crate::{Error, Scenario};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use tracing::Level;

/// Build the command-line interface.
pub fn command() -> Command {
    Command::new("retrystorm")
        .about("Simulate retry storms in a load-balanced cluster")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("scenario")
                .long("scenario")
                .value_parser(value_parser!(PathBuf))
                .help("Path to a JSON scenario (flags below override its fields)"),
        )
        .arg(
            Arg::new("ticks")
                .long("ticks")
                .value_parser(value_parser!(u64))
                .help("Number of ticks to run"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_parser(value_parser!(u64))
                .help("Seed for the random number generator"),
        )
        .arg(
            Arg::new("users")
                .long("users")
                .value_parser(value_parser!(u32))
                .help("Number of users"),
        )
        .arg(
            Arg::new("servers")
                .long("servers")
                .value_parser(value_parser!(usize))
                .help("Number of servers"),
        )
        .arg(
            Arg::new("cores")
                .long("cores")
                .value_parser(value_parser!(usize))
                .help("Number of cores on each server"),
        )
        .arg(
            Arg::new("break-at")
                .long("break-at")
                .value_delimiter(',')
                .value_parser(value_parser!(u64))
                .help("Ticks at which a random user breaks (e.g. 100,100,2500)"),
        )
        .arg(
            Arg::new("restart")
                .long("restart")
                .action(ArgAction::SetTrue)
                .help("Restart the victim of a migration instead of letting its queue drain"),
        )
        .arg(
            Arg::new("render-every")
                .long("render-every")
                .value_parser(value_parser!(u64))
                .help("Print the cluster state every N ticks"),
        )
        .arg(
            Arg::new("pace-us")
                .long("pace-us")
                .value_parser(value_parser!(u64))
                .help("Wall-clock microseconds to sleep after each tick"),
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print all metrics at the end of the run"),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .value_parser(value_parser!(PathBuf))
                .help("Write the end-of-run report to this path as JSON"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info")
                .help("Maximum level of log events"),
        )
}

/// Load the scenario file (if any) and apply every override.
pub fn scenario(matches: &ArgMatches) -> Result<Scenario, Error> {
    let mut scenario = match matches.get_one::<PathBuf>("scenario") {
        Some(path) => Scenario::load(path)?,
        None => Scenario::default(),
    };
    if let Some(ticks) = matches.get_one::<u64>("ticks") {
        scenario.ticks = *ticks;
    }
    if let Some(seed) = matches.get_one::<u64>("seed") {
        scenario.seed = *seed;
    }
    if let Some(users) = matches.get_one::<u32>("users") {
        scenario.users = *users;
    }
    if let Some(servers) = matches.get_one::<usize>("servers") {
        scenario.servers = *servers;
    }
    if let Some(cores) = matches.get_one::<usize>("cores") {
        scenario.cores = *cores;
    }
    if let Some(ticks) = matches.get_many::<u64>("break-at") {
        scenario.break_at = ticks.copied().collect();
    }
    if matches.get_flag("restart") {
        scenario.restart = true;
    }
    if let Some(every) = matches.get_one::<u64>("render-every") {
        scenario.render_every = Some(*every);
    }
    if let Some(pace) = matches.get_one::<u64>("pace-us") {
        scenario.pace_us = *pace;
    }
    scenario.validate()?;
    Ok(scenario)
}

/// Maximum level of log events (defaults to `info`).
pub fn log_level(matches: &ArgMatches) -> Level {
    matches
        .get_one::<String>("log-level")
        .and_then(|level| level.parse().ok())
        .unwrap_or(Level::INFO)
}
