//! End-of-run summary.

use crate::Error;
use colored::Colorize;
use rand::Rng;
use retrystorm_cluster::{simulation::Simulation, Tick};
use serde::Serialize;
use std::{fs, path::Path};

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Every tick was evaluated.
    Completed,

    /// The cluster ran out of capacity.
    Overloaded { message: String },

    /// Some other error stopped the run.
    Failed { message: String },
}

/// Observed response latencies (in ticks).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Latency {
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub p99: Option<Tick>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    /// Number of ticks evaluated (including the one that failed, if any).
    pub ticks: u64,
    pub outcome: Outcome,

    pub sent: u64,
    pub duplicated: u64,
    pub routed: u64,
    pub completed: u64,
    pub observed: u64,
    pub dropped: u64,
    pub timeouts: u64,
    pub faults: u64,
    pub rebalances: u64,
    pub restarts: u64,
    pub latency: Latency,

    /// Queue length of each server at the end of the run.
    pub queues: Vec<usize>,

    /// Number of users assigned to each server at the end of the run.
    pub assignments: Vec<usize>,
}

impl Report {
    pub fn new<R: Rng>(simulation: &Simulation<R>, result: &Result<(), Error>) -> Self {
        let outcome = match result {
            Ok(()) => Outcome::Completed,
            Err(err) if err.is_overload() => Outcome::Overloaded {
                message: err.to_string(),
            },
            Err(err) => Outcome::Failed {
                message: err.to_string(),
            },
        };
        let stats = simulation.stats();
        let metrics = simulation.metrics();
        let router = simulation.router();
        Self {
            ticks: simulation.tick().map_or(0, |tick| tick + 1),
            outcome,
            sent: stats.sent,
            duplicated: stats.duplicated,
            routed: metrics.requests_routed.get(),
            completed: metrics.requests_completed.get(),
            observed: stats.completed,
            dropped: metrics.requests_dropped.get(),
            timeouts: stats.timeouts,
            faults: stats.faults,
            rebalances: metrics.rebalances.get(),
            restarts: metrics.restarts.get(),
            latency: Latency {
                mean: stats.mean(),
                median: stats.median(),
                p99: stats.percentile(99.0),
            },
            queues: router.servers().iter().map(|s| s.queue_len()).collect(),
            assignments: router.users_per_server(),
        }
    }

    /// Write the report as JSON.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Render the report as colored text.
    pub fn render(&self) -> String {
        let mut out = format!("{}\n", "-".repeat(80).yellow());
        let status = match &self.outcome {
            Outcome::Completed => "completed".green().bold(),
            Outcome::Overloaded { message } => format!("overloaded: {message}").red().bold(),
            Outcome::Failed { message } => format!("failed: {message}").red(),
        };
        out.push_str(&format!("{} after {} ticks\n", status, self.ticks));
        out.push_str(&format!(
            "{}\n",
            format!(
                "    [requests] sent: {} | duplicated: {} | routed: {} | completed: {} | dropped: {}",
                self.sent, self.duplicated, self.routed, self.completed, self.dropped
            )
            .cyan()
        ));
        out.push_str(&format!(
            "{}\n",
            format!(
                "    [events] timeouts: {} | faults: {} | rebalances: {} | restarts: {}",
                self.timeouts, self.faults, self.rebalances, self.restarts
            )
            .magenta()
        ));
        let latency = match (self.latency.mean, self.latency.median, self.latency.p99) {
            (Some(mean), Some(median), Some(p99)) => format!(
                "    [latency] mean: {mean:.2} | median: {median:.2} | p99: {p99} ({} responses)",
                self.observed
            ),
            _ => "    [latency] no responses".to_string(),
        };
        out.push_str(&format!("{}\n", latency.blue()));
        for (index, (queue, users)) in self.queues.iter().zip(&self.assignments).enumerate() {
            out.push_str(&format!("    s{index}: queue={queue} users={users}\n"));
        }
        out
    }
}
