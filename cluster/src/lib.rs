//! Simulate retry storms and queue-length rebalancing in a load-balanced cluster.
//!
//! # Overview
//!
//! A [simulation::Simulation] advances a fixed set of [user::User]s and a [router::Router] over a
//! single discrete clock. The router owns every [server::Server] (each a FIFO queue in front of a
//! bank of [cpu::Core]s) and the table that maps each user to exactly one server.
//!
//! Each tick is evaluated in a fixed order:
//!
//! 1. The router advances every server. Cores finish jobs whose end tick has been reached and
//!    idle cores pull requests from the head of their server's queue.
//! 2. Completed requests are handed back to the users that sent them.
//! 3. Every user, in id order, observes its response (or timeout) and may send new requests,
//!    which the router appends to the queue of the user's assigned server.
//!
//! Every `check_period` ticks the router inspects queue lengths and migrates the users of the most
//! loaded server to the least loaded one. If no server has spare capacity, the run fails with
//! [Error::Overloaded].
//!
//! # Randomness
//!
//! All randomness is injected: operations that draw take a `&mut impl Rng` and only ever sample
//! [spread].

use rand::Rng;
use std::fmt;
use thiserror::Error;

pub mod cpu;
pub mod metrics;
pub mod router;
pub mod server;
pub mod simulation;
pub mod user;

/// A discrete simulation timestamp.
pub type Tick = u64;

/// Identifier of a simulated user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(pub u32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Identifier of a core within a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId {
    pub server: usize,
    pub core: usize,
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}/c{}", self.server, self.core)
    }
}

/// The closed set of entities advanced by the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Entity {
    User(UserId),
    Server(usize),
    Core(CoreId),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::User(user) => write!(f, "user {user}"),
            Entity::Server(server) => write!(f, "server s{server}"),
            Entity::Core(core) => write!(f, "core {core}"),
        }
    }
}

/// A single request sent by a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// The user that sent the request.
    pub user: UserId,

    /// Per-user sequence number (duplicates sent in the same retry storm each get their own).
    pub sequence: u64,

    /// Tick at which the request was sent.
    pub submitted: Tick,

    /// Tick at which the request completes, stamped when a core picks it up.
    pub completion: Option<Tick>,
}

impl Request {
    /// Create an unassigned request.
    pub fn new(user: UserId, sequence: u64, submitted: Tick) -> Self {
        Self {
            user,
            sequence,
            submitted,
            completion: None,
        }
    }
}

/// Accepts requests sent by users.
pub trait Ingress {
    /// Forward a request to the server responsible for its user.
    fn route(&mut self, tick: Tick, request: Request) -> Result<(), Error>;
}

/// Errors that can occur while running a simulation.
///
/// Every variant except [Error::InvalidConfig] and [Error::Overloaded] indicates a bug in the
/// simulation itself (an invariant was violated) and carries enough context to locate it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("tick {tick}: {user} is not registered")]
    UnregisteredUser { tick: Tick, user: UserId },
    #[error("{user} is already registered")]
    DuplicateUser { user: UserId },
    #[error("tick {tick}: core {core} is busy with a job from {user} until tick {end}")]
    CoreBusy {
        tick: Tick,
        core: CoreId,
        user: UserId,
        end: Tick,
    },
    #[error("tick {tick}: core {core} is restarting until tick {until}")]
    CoreUnavailable {
        tick: Tick,
        core: CoreId,
        until: Tick,
    },
    #[error("tick {tick}: core {core} observed a tick before its job started at {start}")]
    TimeTravel {
        tick: Tick,
        core: CoreId,
        start: Tick,
    },
    #[error("tick {tick}: {user} missed its request scheduled for tick {scheduled}")]
    MissedSchedule {
        tick: Tick,
        user: UserId,
        scheduled: Tick,
    },
    #[error("tick {tick}: {user} is waiting on a request submitted at later tick {submitted}")]
    PrematureTick {
        tick: Tick,
        user: UserId,
        submitted: Tick,
    },
    #[error("tick {tick}: cannot break {user} outside the current tick ({current:?})")]
    FaultOutOfStep {
        tick: Tick,
        user: UserId,
        current: Option<Tick>,
    },
    #[error("tick {tick} does not follow tick {previous}")]
    TickSkipped { tick: Tick, previous: Tick },
    #[error("cluster overloaded at tick {tick}: server s{victim} has {victim_len} queued and the least loaded server s{target} has {target_len} (limit {limit})")]
    Overloaded {
        tick: Tick,
        victim: usize,
        victim_len: usize,
        target: usize,
        target_len: usize,
        limit: usize,
    },
}

impl Error {
    /// Returns true if the error is the modeled "no spare capacity" condition rather than a bug.
    pub fn is_overload(&self) -> bool {
        matches!(self, Error::Overloaded { .. })
    }

    /// Returns the entity the error is attributed to, if any.
    pub fn entity(&self) -> Option<Entity> {
        match self {
            Error::UnregisteredUser { user, .. }
            | Error::DuplicateUser { user }
            | Error::MissedSchedule { user, .. }
            | Error::PrematureTick { user, .. }
            | Error::FaultOutOfStep { user, .. } => Some(Entity::User(*user)),
            Error::CoreBusy { core, .. }
            | Error::CoreUnavailable { core, .. }
            | Error::TimeTravel { core, .. } => Some(Entity::Core(*core)),
            Error::Overloaded { victim, .. } => Some(Entity::Server(*victim)),
            Error::InvalidConfig(_) | Error::TickSkipped { .. } => None,
        }
    }
}

/// Draw uniformly from `[mean/2, mean + mean/2)`.
///
/// `mean` must be non-zero (enforced by every `Config::validate`).
pub fn spread<R: Rng>(rng: &mut R, mean: u64) -> u64 {
    let half = mean / 2;
    rng.gen_range(half..mean + half)
}
