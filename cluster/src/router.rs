//! Route user requests to servers and migrate users away from overloaded servers.
//!
//! # Rebalancing
//!
//! Every `check_period` ticks (after all servers have advanced), the router runs a rebalancing
//! pass:
//!
//! 1. The server with the longest queue is the victim (ties go to the lowest index).
//! 2. If the victim's queue is no longer than `max_process_queue_len`, nothing happens.
//! 3. The server with the shortest queue is the target (ties go to the lowest index).
//! 4. If the target's queue is longer than `queue_len_limit`, there is no spare capacity anywhere
//!    and the pass fails with [Error::Overloaded].
//! 5. Otherwise every user assigned to the victim is assigned to the target. Under
//!    [Policy::Restart], the victim is also restarted (dropping its queue).
//!
//! A pass with no lighter target (or no users left on the victim) changes nothing, so running it
//! again without intervening traffic is a no-op.

use crate::{
    metrics::{self, Metrics},
    server::{self, Server},
    Error, Ingress, Request, Tick, UserId,
};
use rand::Rng;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet},
};
use tracing::{debug, info, trace};

/// What happens to the victim of a migration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Policy {
    /// Redirect future traffic and let the victim's queue drain.
    #[default]
    Redirect,

    /// Redirect future traffic and restart the victim (dropping its queue).
    ///
    /// Servers that are restarting are neither victims nor targets.
    Restart,
}

/// Configuration for a [Router].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of servers.
    pub servers: usize,

    /// Configuration shared by every server.
    pub server: server::Config,

    /// Number of ticks between rebalancing passes.
    pub check_period: Tick,

    /// Queue length above which the most loaded server's users are migrated (soft threshold).
    pub max_process_queue_len: usize,

    /// Queue length above which no server can accept migrated users (hard ceiling).
    pub queue_len_limit: usize,

    /// What happens to the victim of a migration.
    pub policy: Policy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: 4,
            server: server::Config::default(),
            check_period: 10,
            max_process_queue_len: 20,
            queue_len_limit: 50,
            policy: Policy::Redirect,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.servers == 0 {
            return Err(Error::InvalidConfig("servers must be at least 1"));
        }
        if self.check_period == 0 {
            return Err(Error::InvalidConfig("check_period must be at least 1"));
        }
        if self.max_process_queue_len > self.queue_len_limit {
            return Err(Error::InvalidConfig(
                "max_process_queue_len must not exceed queue_len_limit",
            ));
        }
        self.server.validate()
    }
}

/// A cohort of users moved from one server to another.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Migration {
    pub victim: usize,
    pub target: usize,
    pub users: Vec<UserId>,
}

/// A load balancer in front of a fixed set of servers.
pub struct Router {
    cfg: Config,
    servers: Vec<Server>,
    assignments: BTreeMap<UserId, usize>,
    cursor: usize,
    labels: Vec<metrics::Server>,
    metrics: Metrics,
}

impl Router {
    /// Create a router with `cfg.servers` idle servers and no registered users.
    pub fn new(cfg: Config, metrics: Metrics) -> Result<Self, Error> {
        cfg.validate()?;
        let servers = (0..cfg.servers)
            .map(|index| Server::new(index, &cfg.server))
            .collect();
        let labels = (0..cfg.servers).map(metrics::Server::new).collect();
        Ok(Self {
            cfg,
            servers,
            assignments: BTreeMap::new(),
            cursor: 0,
            labels,
            metrics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// Returns the server assigned to `user`.
    pub fn assignment(&self, user: UserId) -> Option<usize> {
        self.assignments.get(&user).copied()
    }

    /// Iterate over all `(user, server)` assignments in user order.
    pub fn assignments(&self) -> impl Iterator<Item = (UserId, usize)> + '_ {
        self.assignments
            .iter()
            .map(|(user, server)| (*user, *server))
    }

    /// Number of users assigned to each server.
    pub fn users_per_server(&self) -> Vec<usize> {
        let mut counts = vec![0; self.servers.len()];
        for server in self.assignments.values() {
            counts[*server] += 1;
        }
        counts
    }

    /// Assign each user to a server, round robin in the order given.
    ///
    /// Registration is all-or-nothing: if any user is already registered (or appears twice),
    /// no user is assigned.
    pub fn register(&mut self, users: impl IntoIterator<Item = UserId>) -> Result<(), Error> {
        let users: Vec<UserId> = users.into_iter().collect();
        let mut seen = BTreeSet::new();
        for user in &users {
            if self.assignments.contains_key(user) || !seen.insert(*user) {
                return Err(Error::DuplicateUser { user: *user });
            }
        }
        for user in users {
            let server = self.cursor % self.servers.len();
            self.cursor += 1;
            self.assignments.insert(user, server);
            trace!(%user, server, "registered user");
        }
        Ok(())
    }

    /// Advance every server to `tick` and, on check ticks, rebalance.
    ///
    /// Returns the requests whose jobs finished at `tick`.
    pub fn advance<R: Rng>(&mut self, rng: &mut R, tick: Tick) -> Result<Vec<Request>, Error> {
        let mut completed = Vec::new();
        for server in self.servers.iter_mut() {
            completed.extend(server.advance(rng, tick)?);
        }
        self.metrics.requests_completed.inc_by(completed.len() as u64);

        if tick % self.cfg.check_period == 0 {
            self.rebalance(tick)?;
        }

        for (server, label) in self.servers.iter().zip(self.labels.iter()) {
            self.metrics
                .queue_length
                .get_or_create(label)
                .set(server.queue_len() as i64);
            self.metrics
                .busy_cores
                .get_or_create(label)
                .set(server.busy_cores() as i64);
        }
        Ok(completed)
    }

    /// Run a single rebalancing pass.
    ///
    /// Returns the migration performed, if any.
    pub fn rebalance(&mut self, tick: Tick) -> Result<Option<Migration>, Error> {
        let policy = self.cfg.policy;
        let eligible = |server: &&Server| policy == Policy::Redirect || !server.is_restarting();

        // Find the most loaded server
        let Some((victim, victim_len)) = self
            .servers
            .iter()
            .filter(eligible)
            .min_by_key(|server| (Reverse(server.queue_len()), server.index()))
            .map(|server| (server.index(), server.queue_len()))
        else {
            debug!(tick, "all servers restarting");
            return Ok(None);
        };
        if victim_len <= self.cfg.max_process_queue_len {
            return Ok(None);
        }

        // Find the least loaded server
        let Some((target, target_len)) = self
            .servers
            .iter()
            .filter(eligible)
            .min_by_key(|server| (server.queue_len(), server.index()))
            .map(|server| (server.index(), server.queue_len()))
        else {
            return Ok(None);
        };
        if target_len > self.cfg.queue_len_limit {
            return Err(Error::Overloaded {
                tick,
                victim,
                victim_len,
                target,
                target_len,
                limit: self.cfg.queue_len_limit,
            });
        }
        if target_len >= victim_len {
            debug!(tick, victim, victim_len, target_len, "no lighter server");
            return Ok(None);
        }

        // Move the victim's users
        let users: Vec<UserId> = self
            .assignments
            .iter()
            .filter(|(_, server)| **server == victim)
            .map(|(user, _)| *user)
            .collect();
        if users.is_empty() {
            debug!(tick, victim, victim_len, "victim has no users left");
            return Ok(None);
        }
        for user in &users {
            self.assignments.insert(*user, target);
        }
        self.metrics.rebalances.inc();
        info!(
            tick,
            victim,
            victim_len,
            target,
            target_len,
            users = users.len(),
            "migrated users"
        );

        if policy == Policy::Restart {
            let dropped = self.servers[victim].restart(tick);
            self.metrics.requests_dropped.inc_by(dropped as u64);
            self.metrics.restarts.inc();
        }
        Ok(Some(Migration {
            victim,
            target,
            users,
        }))
    }
}

impl Ingress for Router {
    fn route(&mut self, tick: Tick, request: Request) -> Result<(), Error> {
        let Some(server) = self.assignment(request.user) else {
            return Err(Error::UnregisteredUser {
                tick,
                user: request.user,
            });
        };
        trace!(tick, user = %request.user, sequence = request.sequence, server, "routing request");
        self.servers[server].enqueue(request);
        self.metrics.requests_routed.inc();
        Ok(())
    }
}
