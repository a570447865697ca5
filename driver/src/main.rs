//! Simulate retry storms in a load-balanced cluster.

use colored::Colorize;
use retrystorm_driver::{cli, Driver};
use std::{io, process};
use tracing::debug;

/// Exit status when the cluster runs out of capacity.
const EXIT_OVERLOADED: i32 = 2;

/// Exit status for any other failure.
const EXIT_FAILED: i32 = 1;

fn main() {
    // Parse command line arguments
    let matches = cli::command().get_matches();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(cli::log_level(&matches))
        .with_writer(io::stderr)
        .init();

    // Build the scenario
    let scenario = match cli::scenario(&matches) {
        Ok(scenario) => scenario,
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            process::exit(EXIT_FAILED);
        }
    };
    debug!(?scenario, "loaded scenario");
    let mut driver = match Driver::new(scenario) {
        Ok(driver) => driver,
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            process::exit(EXIT_FAILED);
        }
    };

    // Run
    let result = driver.run(|frame| println!("{frame}"));

    // Summarize
    let report = driver.report(&result);
    println!("{}", report.render());
    let mut written = true;
    if let Some(path) = matches.get_one::<std::path::PathBuf>("report") {
        if let Err(err) = report.write(path) {
            eprintln!("{} unable to write report: {err}", "error:".red().bold());
            written = false;
        }
    }
    if matches.get_flag("metrics") {
        match driver.metrics() {
            Ok(metrics) => println!("{metrics}"),
            Err(err) => eprintln!("{} {err}", "error:".red().bold()),
        }
    }

    if let Err(err) = result {
        eprintln!("{} {err}", "error:".red().bold());
        if err.is_overload() {
            process::exit(EXIT_OVERLOADED);
        }
        process::exit(EXIT_FAILED);
    }
    if !written {
        process::exit(EXIT_FAILED);
    }
}
