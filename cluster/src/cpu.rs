//! A single execution slot within a server.
//!
//! A [Core] runs at most one job at a time. The job's end tick is drawn when the job is assigned,
//! and the job finishes (and the core returns to idle) on the first [Core::advance] at or after
//! that tick.

use crate::{spread, CoreId, Error, Request, Tick, UserId};
use rand::Rng;
use tracing::trace;

/// What a core is currently doing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Ready to accept a job.
    Idle,

    /// Running the job for `request` over `[start, end)`.
    Busy {
        request: Request,
        start: Tick,
        end: Tick,
    },

    /// Unavailable until `until` (after a server restart).
    Restarting { until: Tick },
}

/// A single-slot job execution resource.
#[derive(Clone, Debug)]
pub struct Core {
    id: CoreId,
    handle_duration: Tick,
    state: State,
}

impl Core {
    /// Create an idle core whose jobs take `spread(handle_duration)` ticks.
    pub fn new(id: CoreId, handle_duration: Tick) -> Self {
        Self {
            id,
            handle_duration,
            state: State::Idle,
        }
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Returns true if the core can accept a job.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Returns the `(start, end)` window of the running job, if any.
    pub fn window(&self) -> Option<(Tick, Tick)> {
        match self.state {
            State::Busy { start, end, .. } => Some((start, end)),
            _ => None,
        }
    }

    /// Returns the user whose job is running, if any.
    pub fn user(&self) -> Option<UserId> {
        match &self.state {
            State::Busy { request, .. } => Some(request.user),
            _ => None,
        }
    }

    /// Finish the running job (or restart) if `tick` has reached its end.
    ///
    /// Returns the request of the finished job.
    pub fn advance(&mut self, tick: Tick) -> Result<Option<Request>, Error> {
        match self.state {
            State::Idle => Ok(None),
            State::Busy { start, .. } if tick < start => Err(Error::TimeTravel {
                tick,
                core: self.id,
                start,
            }),
            State::Busy { end, .. } if tick >= end => {
                match std::mem::replace(&mut self.state, State::Idle) {
                    State::Busy { request, .. } => {
                        trace!(tick, core = %self.id, user = %request.user, sequence = request.sequence, "job finished");
                        Ok(Some(request))
                    }
                    _ => Ok(None),
                }
            }
            State::Busy { .. } => Ok(None),
            State::Restarting { until } => {
                if tick >= until {
                    trace!(tick, core = %self.id, "core available");
                    self.state = State::Idle;
                }
                Ok(None)
            }
        }
    }

    /// Start a job for `request` at `tick`, stamping its completion tick.
    ///
    /// Returns the tick at which the job will finish. The core must be idle.
    pub fn assign<R: Rng>(
        &mut self,
        rng: &mut R,
        tick: Tick,
        mut request: Request,
    ) -> Result<Tick, Error> {
        match &self.state {
            State::Idle => {}
            State::Busy { request, end, .. } => {
                return Err(Error::CoreBusy {
                    tick,
                    core: self.id,
                    user: request.user,
                    end: *end,
                });
            }
            State::Restarting { until } => {
                return Err(Error::CoreUnavailable {
                    tick,
                    core: self.id,
                    until: *until,
                });
            }
        }

        let end = tick + spread(rng, self.handle_duration);
        trace!(tick, core = %self.id, user = %request.user, sequence = request.sequence, end, "job started");
        request.completion = Some(end);
        self.state = State::Busy {
            request,
            start: tick,
            end,
        };
        Ok(end)
    }

    /// Abort any running job and stay unavailable until `until`.
    ///
    /// Returns the request of the aborted job, if any.
    pub fn restart(&mut self, until: Tick) -> Option<Request> {
        match std::mem::replace(&mut self.state, State::Restarting { until }) {
            State::Busy { request, .. } => Some(request),
            _ => None,
        }
    }
}
