//! A bank of cores in front of a FIFO admission queue.
//!
//! The queue is never bounded by the server itself: requests that cannot be assigned to an idle
//! core stay queued until a later tick (this is the only form of backpressure in the cluster).
//! Watching queue lengths is the job of the [crate::router::Router].

use crate::{
    cpu::{Core, State},
    CoreId, Error, Request, Tick,
};
use rand::Rng;
use std::collections::VecDeque;
use tracing::{info, trace};

/// Configuration for a [Server].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of cores on each server.
    pub cores: usize,

    /// Mean number of ticks a core spends on a request.
    ///
    /// Each job takes a uniformly random duration in `[handle_duration/2, handle_duration*1.5)`.
    pub handle_duration: Tick,

    /// Number of ticks a server's cores stay unavailable after a restart.
    pub restart_duration: Tick,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cores: 4,
            handle_duration: 10,
            restart_duration: 50,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.cores == 0 {
            return Err(Error::InvalidConfig("cores must be at least 1"));
        }
        if self.handle_duration < 2 {
            return Err(Error::InvalidConfig("handle_duration must be at least 2"));
        }
        Ok(())
    }
}

/// A simulated multi-core server.
#[derive(Clone, Debug)]
pub struct Server {
    index: usize,
    restart_duration: Tick,
    cores: Vec<Core>,
    queue: VecDeque<Request>,
}

impl Server {
    /// Create a server with all cores idle and an empty queue.
    pub fn new(index: usize, cfg: &Config) -> Self {
        let cores = (0..cfg.cores)
            .map(|core| {
                Core::new(
                    CoreId {
                        server: index,
                        core,
                    },
                    cfg.handle_duration,
                )
            })
            .collect();
        Self {
            index,
            restart_duration: cfg.restart_duration,
            cores,
            queue: VecDeque::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    /// Requests waiting for a core, oldest first.
    pub fn queue(&self) -> impl Iterator<Item = &Request> {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of cores running a job.
    pub fn busy_cores(&self) -> usize {
        self.cores.iter().filter(|core| core.window().is_some()).count()
    }

    /// Returns true if any core is still recovering from a restart.
    pub fn is_restarting(&self) -> bool {
        self.cores
            .iter()
            .any(|core| matches!(core.state(), State::Restarting { .. }))
    }

    /// Append a request to the tail of the queue.
    pub fn enqueue(&mut self, request: Request) {
        self.queue.push_back(request);
    }

    /// Advance all cores to `tick` and hand queued requests to idle cores.
    ///
    /// Returns the requests whose jobs finished at `tick`.
    pub fn advance<R: Rng>(&mut self, rng: &mut R, tick: Tick) -> Result<Vec<Request>, Error> {
        // Finish jobs
        let mut completed = Vec::new();
        for core in self.cores.iter_mut() {
            if let Some(request) = core.advance(tick)? {
                completed.push(request);
            }
        }

        // Drain the queue into idle cores (lowest index first)
        while !self.queue.is_empty() {
            let Some(core) = self.cores.iter_mut().find(|core| core.is_idle()) else {
                break;
            };
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            core.assign(rng, tick, request)?;
        }
        if !self.queue.is_empty() {
            trace!(tick, server = self.index, queue_len = self.queue.len(), "all cores busy");
        }
        Ok(completed)
    }

    /// Drop every queued request, abort every running job, and keep all cores unavailable until
    /// `tick + restart_duration`.
    ///
    /// Returns the number of requests dropped.
    pub fn restart(&mut self, tick: Tick) -> usize {
        let until = tick + self.restart_duration;
        let queued = self.queue.len();
        self.queue.clear();
        let aborted = self
            .cores
            .iter_mut()
            .filter_map(|core| core.restart(until))
            .count();
        info!(
            tick,
            server = self.index,
            queued,
            aborted,
            until,
            "restarting server"
        );
        queued + aborted
    }
}
