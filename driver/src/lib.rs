//! Run a [retrystorm_cluster] simulation from a [Scenario].
//!
//! The [Driver] owns the clock: it advances the simulation one tick at a time, breaks a random
//! user at every scheduled fault tick, and hands rendered frames to the caller. A run stops at the
//! first error (most commonly cluster-wide overload).

use prometheus_client::{encoding::text::encode, registry::Registry};
use rand::{rngs::StdRng, SeedableRng};
use retrystorm_cluster::{
    router::{self, Policy},
    server,
    simulation::{self, Simulation},
    user, Tick,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, thread, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

pub mod cli;
pub mod render;
pub mod report;

/// Errors that can occur while driving a simulation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("cluster: {0}")]
    Cluster(#[from] retrystorm_cluster::Error),
    #[error("invalid scenario: {0}")]
    InvalidScenario(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unable to encode metrics")]
    Encode(#[from] std::fmt::Error),
}

impl Error {
    /// Returns true if the run ended because the cluster ran out of capacity.
    pub fn is_overload(&self) -> bool {
        matches!(self, Error::Cluster(err) if err.is_overload())
    }
}

/// Everything needed to reproduce a run.
///
/// Every field has a default, so a scenario file only needs to name what it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scenario {
    /// Number of ticks to run (starting at tick 0).
    pub ticks: u64,

    /// Seed for the simulation's random number generator.
    pub seed: u64,

    pub users: u32,
    pub servers: usize,
    pub cores: usize,
    pub handle_duration: u64,
    pub restart_duration: u64,
    pub check_period: u64,
    pub max_process_queue_len: usize,
    pub queue_len_limit: usize,

    /// Restart the victim of a migration instead of letting its queue drain.
    pub restart: bool,

    pub period: u64,
    pub timeout: u64,
    pub resends: u64,

    /// Ticks at which a random user is broken (a tick may appear more than once).
    pub break_at: Vec<Tick>,

    /// Render a frame every `n` ticks.
    pub render_every: Option<u64>,

    /// Wall-clock microseconds to sleep after each tick.
    pub pace_us: u64,
}

impl Default for Scenario {
    fn default() -> Self {
        let simulation = simulation::Config::default();
        let router = simulation.router;
        let server = router.server;
        let user = simulation.user;
        Self {
            ticks: 10_000,
            seed: 0,
            users: simulation.users,
            servers: router.servers,
            cores: server.cores,
            handle_duration: server.handle_duration,
            restart_duration: server.restart_duration,
            check_period: router.check_period,
            max_process_queue_len: router.max_process_queue_len,
            queue_len_limit: router.queue_len_limit,
            restart: router.policy == Policy::Restart,
            period: user.period,
            timeout: user.timeout,
            resends: user.resends,
            break_at: Vec::new(),
            render_every: None,
            pace_us: 0,
        }
    }
}

impl Scenario {
    /// Read a scenario from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The cluster configuration described by this scenario.
    pub fn config(&self) -> simulation::Config {
        simulation::Config {
            users: self.users,
            router: router::Config {
                servers: self.servers,
                server: server::Config {
                    cores: self.cores,
                    handle_duration: self.handle_duration,
                    restart_duration: self.restart_duration,
                },
                check_period: self.check_period,
                max_process_queue_len: self.max_process_queue_len,
                queue_len_limit: self.queue_len_limit,
                policy: if self.restart {
                    Policy::Restart
                } else {
                    Policy::Redirect
                },
            },
            user: user::Config {
                period: self.period,
                timeout: self.timeout,
                resends: self.resends,
            },
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.ticks == 0 {
            return Err(Error::InvalidScenario("ticks must be at least 1"));
        }
        if self.render_every == Some(0) {
            return Err(Error::InvalidScenario("render_every must be at least 1"));
        }
        self.config().validate()?;
        Ok(())
    }
}

/// Runs a single [Scenario].
pub struct Driver {
    scenario: Scenario,
    registry: Registry,
    simulation: Simulation<StdRng>,
}

impl Driver {
    pub fn new(scenario: Scenario) -> Result<Self, Error> {
        scenario.validate()?;
        for tick in scenario.break_at.iter().filter(|tick| **tick >= scenario.ticks) {
            warn!(tick, ticks = scenario.ticks, "fault scheduled after the last tick");
        }
        let mut registry = Registry::default();
        let rng = StdRng::seed_from_u64(scenario.seed);
        let simulation = Simulation::new(scenario.config(), rng, &mut registry)?;
        Ok(Self {
            scenario,
            registry,
            simulation,
        })
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn simulation(&self) -> &Simulation<StdRng> {
        &self.simulation
    }

    /// Run every tick of the scenario, passing each rendered frame to `frame`.
    ///
    /// Stops at the first error.
    pub fn run<F: FnMut(&str)>(&mut self, mut frame: F) -> Result<(), Error> {
        let pace = Duration::from_micros(self.scenario.pace_us);
        for tick in 0..self.scenario.ticks {
            self.simulation.step(tick)?;

            // Break users after the tick has been evaluated
            let faults = self
                .scenario
                .break_at
                .iter()
                .filter(|at| **at == tick)
                .count();
            for _ in 0..faults {
                let user = self.simulation.pick_user();
                let batch = self.simulation.fault(tick, user)?;
                info!(tick, %user, batch, "injected fault");
            }

            if let Some(every) = self.scenario.render_every {
                if tick % every == 0 {
                    frame(&render::frame(tick, &self.simulation));
                }
            }
            if !pace.is_zero() {
                thread::sleep(pace);
            }
        }
        info!(ticks = self.scenario.ticks, "completed run");
        Ok(())
    }

    /// Summarize the run so far.
    pub fn report(&self, result: &Result<(), Error>) -> report::Report {
        report::Report::new(&self.simulation, result)
    }

    /// Text encoding of every registered metric.
    pub fn metrics(&self) -> Result<String, Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}
