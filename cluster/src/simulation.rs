//! Evaluate the router and every user, tick by tick, in a fixed order.
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use rand::{rngs::StdRng, SeedableRng};
//! use retrystorm_cluster::simulation::{Config, Simulation};
//!
//! let mut registry = Registry::default();
//! let rng = StdRng::seed_from_u64(0);
//! let mut simulation = Simulation::new(Config::default(), rng, &mut registry).unwrap();
//! for tick in 0..1_000 {
//!     simulation.step(tick).unwrap();
//! }
//! assert!(simulation.stats().completed > 0);
//! ```

use crate::{
    metrics::Metrics,
    router::{self, Router},
    user::{self, Outcome, User},
    Error, Tick, UserId,
};
use prometheus_client::registry::Registry;
use rand::Rng;
use tracing::info;

/// Configuration for a [Simulation].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of users.
    pub users: u32,

    /// Router (and server) configuration.
    pub router: router::Config,

    /// Configuration shared by every user.
    pub user: user::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            users: 100,
            router: router::Config::default(),
            user: user::Config::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.users == 0 {
            return Err(Error::InvalidConfig("users must be at least 1"));
        }
        self.router.validate()?;
        self.user.validate()
    }
}

/// Tallies of what users observed during a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    /// Requests sent after thinking.
    pub sent: u64,

    /// Requests sent as part of a retry storm (after a timeout or a fault).
    pub duplicated: u64,

    /// Outstanding requests that timed out.
    pub timeouts: u64,

    /// Faults injected.
    pub faults: u64,

    /// Responses observed by users.
    pub completed: u64,

    /// Ticks between sending and observing each response (in observation order).
    pub latencies: Vec<Tick>,
}

impl Stats {
    pub fn mean(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        let sum: Tick = self.latencies.iter().sum();
        Some(sum as f64 / self.latencies.len() as f64)
    }

    pub fn median(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) as f64 / 2.0)
        } else {
            Some(sorted[mid] as f64)
        }
    }

    /// Nearest-rank percentile (`p` in `[0, 100]`): the smallest latency with at least `p`% of
    /// latencies at or below it.
    pub fn percentile(&self, p: f64) -> Option<Tick> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let rank = (p.clamp(0.0, 100.0) * sorted.len() as f64 / 100.0).ceil() as usize;
        Some(sorted[rank.clamp(1, sorted.len()) - 1])
    }
}

/// A single run of the cluster.
pub struct Simulation<R: Rng> {
    cfg: Config,
    rng: R,
    router: Router,
    users: Vec<User>,
    previous: Option<Tick>,
    stats: Stats,
    metrics: Metrics,
}

impl<R: Rng> Simulation<R> {
    /// Build the cluster and register every user with the router (round robin).
    pub fn new(cfg: Config, rng: R, registry: &mut Registry) -> Result<Self, Error> {
        cfg.validate()?;
        let metrics = Metrics::init(registry);
        let mut router = Router::new(cfg.router.clone(), metrics.clone())?;
        let users: Vec<User> = (0..cfg.users)
            .map(|id| User::new(UserId(id), cfg.user.clone()))
            .collect();
        router.register(users.iter().map(User::id))?;
        info!(
            users = cfg.users,
            servers = cfg.router.servers,
            cores = cfg.router.server.cores,
            "initialized simulation"
        );
        Ok(Self {
            cfg,
            rng,
            router,
            users,
            previous: None,
            stats: Stats::default(),
            metrics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The last tick evaluated, if any.
    pub fn tick(&self) -> Option<Tick> {
        self.previous
    }

    /// Evaluate a single tick.
    ///
    /// The router (and every server and core) is advanced before any user, so a response that
    /// completes at `tick` is observed by its user at `tick`.
    pub fn step(&mut self, tick: Tick) -> Result<(), Error> {
        if let Some(previous) = self.previous {
            if previous.checked_add(1) != Some(tick) {
                return Err(Error::TickSkipped { tick, previous });
            }
        }
        self.previous = Some(tick);

        // Resolve in-flight work
        let completed = self.router.advance(&mut self.rng, tick)?;
        for response in completed {
            if let Some(user) = self.users.get_mut(response.user.0 as usize) {
                user.respond(response);
            }
        }

        // Observe responses and timeouts, then send
        for user in self.users.iter_mut() {
            let Some(outcome) = user.calculate(&mut self.rng, &mut self.router, tick)? else {
                continue;
            };
            match outcome {
                Outcome::Sent => {
                    self.stats.sent += 1;
                    self.metrics.requests_sent.inc();
                }
                Outcome::Storm { batch } => {
                    self.stats.timeouts += 1;
                    self.stats.duplicated += batch;
                    self.metrics.timeouts.inc();
                    self.metrics.requests_duplicated.inc_by(batch);
                }
                Outcome::Responded { latency } => {
                    self.stats.completed += 1;
                    self.stats.latencies.push(latency);
                }
            }
        }
        Ok(())
    }

    /// Break `user` at `tick`, making it start a retry storm immediately.
    ///
    /// `tick` must be the tick most recently passed to [Simulation::step]. Returns the number of
    /// duplicates sent.
    pub fn fault(&mut self, tick: Tick, user: UserId) -> Result<u64, Error> {
        if self.previous != Some(tick) {
            return Err(Error::FaultOutOfStep {
                tick,
                user,
                current: self.previous,
            });
        }
        let Some(target) = self.users.get_mut(user.0 as usize) else {
            return Err(Error::UnregisteredUser { tick, user });
        };
        let batch = target.fault(&mut self.rng, &mut self.router, tick)?;
        self.stats.faults += 1;
        self.stats.duplicated += batch;
        self.metrics.faults.inc();
        self.metrics.requests_duplicated.inc_by(batch);
        Ok(batch)
    }

    /// Pick a uniformly random user.
    pub fn pick_user(&mut self) -> UserId {
        UserId(self.rng.gen_range(0..self.cfg.users))
    }
}
