//! A synthetic client that thinks, sends a request, and waits for the response.
//!
//! A user tracks exactly one outstanding request at a time. If that request goes unanswered for
//! `timeout` ticks, the user re-sends it as a burst of duplicates (a retry storm) and from then on
//! only waits for the last duplicate. Responses to anything else are ignored.
//!
//! [User::calculate] evaluates the following rules once per tick, in order:
//!
//! 1. If idle, schedule the next request `spread(period)` ticks from now.
//! 2. If the scheduled tick has arrived, send one request and start waiting.
//! 3. If the outstanding request has been waiting for `timeout` ticks, start a retry storm.
//! 4. If the outstanding request completes at this tick, return to idle.

use crate::{spread, Error, Ingress, Request, Tick, UserId};
use rand::Rng;
use tracing::{debug, trace, warn};

/// Configuration for a [User].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Mean think time (in ticks) between a response and the next request.
    pub period: Tick,

    /// Ticks a request may go unanswered before the user retries.
    pub timeout: Tick,

    /// Mean number of duplicates sent in a retry storm.
    pub resends: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            period: 100,
            timeout: 60,
            resends: 10,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.period == 0 {
            return Err(Error::InvalidConfig("period must be at least 1"));
        }
        if self.timeout == 0 {
            return Err(Error::InvalidConfig("timeout must be at least 1"));
        }
        if self.resends < 2 {
            return Err(Error::InvalidConfig("resends must be at least 2"));
        }
        Ok(())
    }
}

/// Where a user is in its request cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// No request outstanding and none scheduled.
    Idle,

    /// Thinking; the next request goes out at `at`.
    Scheduled { at: Tick },

    /// Waiting for the response to request `sequence`, sent at `submitted`.
    Awaiting {
        sequence: u64,
        submitted: Tick,
        completion: Option<Tick>,
    },
}

/// The observable effect of a single [User::calculate].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A new request was sent.
    Sent,

    /// The outstanding request timed out and `batch` duplicates were sent.
    Storm { batch: u64 },

    /// The outstanding request completed `latency` ticks after it was sent.
    Responded { latency: Tick },
}

/// A simulated user.
#[derive(Clone, Debug)]
pub struct User {
    id: UserId,
    cfg: Config,
    state: State,
    sequence: u64,
}

impl User {
    /// Create an idle user.
    pub fn new(id: UserId, cfg: Config) -> Self {
        Self {
            id,
            cfg,
            state: State::Idle,
            sequence: 0,
        }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Hand a completed request back to the user.
    ///
    /// Only the response to the outstanding request is recorded; it is observed by the next
    /// [User::calculate] at its completion tick.
    pub fn respond(&mut self, response: Request) {
        match &mut self.state {
            State::Awaiting {
                sequence,
                completion,
                ..
            } if *sequence == response.sequence && response.user == self.id => {
                *completion = response.completion;
            }
            _ => {
                trace!(user = %self.id, sequence = response.sequence, "ignoring superseded response");
            }
        }
    }

    /// Advance the user to `tick`, sending any requests through `ingress`.
    pub fn calculate<R: Rng, I: Ingress>(
        &mut self,
        rng: &mut R,
        ingress: &mut I,
        tick: Tick,
    ) -> Result<Option<Outcome>, Error> {
        // Think
        if self.state == State::Idle {
            let at = tick + spread(rng, self.cfg.period);
            debug!(tick, user = %self.id, at, "scheduled request");
            self.state = State::Scheduled { at };
        }

        match self.state {
            State::Idle => Ok(None),
            State::Scheduled { at } if tick > at => Err(Error::MissedSchedule {
                tick,
                user: self.id,
                scheduled: at,
            }),
            State::Scheduled { at } if tick == at => {
                let sequence = self.next_sequence();
                ingress.route(tick, Request::new(self.id, sequence, tick))?;
                self.state = State::Awaiting {
                    sequence,
                    submitted: tick,
                    completion: None,
                };
                debug!(tick, user = %self.id, sequence, "sent request");
                Ok(Some(Outcome::Sent))
            }
            State::Scheduled { .. } => Ok(None),
            State::Awaiting {
                sequence,
                submitted,
                completion,
            } => {
                let Some(latency) = tick.checked_sub(submitted) else {
                    return Err(Error::PrematureTick {
                        tick,
                        user: self.id,
                        submitted,
                    });
                };
                if latency >= self.cfg.timeout {
                    warn!(tick, user = %self.id, sequence, submitted, "request timed out");
                    let batch = self.storm(rng, ingress, tick)?;
                    return Ok(Some(Outcome::Storm { batch }));
                }
                if completion == Some(tick) {
                    debug!(tick, user = %self.id, sequence, latency, "received response");
                    self.state = State::Idle;
                    return Ok(Some(Outcome::Responded { latency }));
                }
                Ok(None)
            }
        }
    }

    /// Inject a client malfunction: start a retry storm now, whatever the current state.
    ///
    /// Returns the number of duplicates sent.
    pub fn fault<R: Rng, I: Ingress>(
        &mut self,
        rng: &mut R,
        ingress: &mut I,
        tick: Tick,
    ) -> Result<u64, Error> {
        warn!(tick, user = %self.id, state = ?self.state, "user broke");
        self.storm(rng, ingress, tick)
    }

    /// Send a batch of duplicates stamped with `tick` and wait for the last one.
    fn storm<R: Rng, I: Ingress>(
        &mut self,
        rng: &mut R,
        ingress: &mut I,
        tick: Tick,
    ) -> Result<u64, Error> {
        let batch = spread(rng, self.cfg.resends);
        let first = self.sequence;
        self.sequence += batch;
        for sequence in first..self.sequence {
            ingress.route(tick, Request::new(self.id, sequence, tick))?;
        }
        self.state = State::Awaiting {
            sequence: self.sequence - 1,
            submitted: tick,
            completion: None,
        };
        debug!(tick, user = %self.id, batch, "sent retry storm");
        Ok(batch)
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use rand::{
        rngs::{mock::StepRng, StdRng},
        SeedableRng,
    };

    /// Records every routed request.
    #[derive(Default)]
    struct Recorder {
        routed: Vec<(Tick, Request)>,
    }

    impl Ingress for Recorder {
        fn route(&mut self, tick: Tick, request: Request) -> Result<(), Error> {
            self.routed.push((tick, request));
            Ok(())
        }
    }

    /// Rejects every request.
    struct Unregistered;

    impl Ingress for Unregistered {
        fn route(&mut self, tick: Tick, request: Request) -> Result<(), Error> {
            Err(Error::UnregisteredUser {
                tick,
                user: request.user,
            })
        }
    }

    fn config() -> Config {
        Config {
            period: 10,
            timeout: 20,
            resends: 6,
        }
    }

    /// Complete a request as a core would.
    fn complete(request: &Request, at: Tick) -> Request {
        Request {
            completion: Some(at),
            ..request.clone()
        }
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());
        for cfg in [
            Config {
                period: 0,
                ..config()
            },
            Config {
                timeout: 0,
                ..config()
            },
            Config {
                resends: 1,
                ..config()
            },
        ] {
            assert!(cfg.validate().is_err());
        }
    }

    #[test]
    fn test_request_cycle() {
        let mut rng = StepRng::new(0, 0);
        let mut ingress = Recorder::default();
        let mut user = User::new(UserId(3), config());

        // Think for exactly period/2 ticks
        assert_eq!(user.calculate(&mut rng, &mut ingress, 0).unwrap(), None);
        assert_eq!(user.state(), State::Scheduled { at: 5 });
        for tick in 1..5 {
            assert_eq!(user.calculate(&mut rng, &mut ingress, tick).unwrap(), None);
        }
        assert!(ingress.routed.is_empty());

        // Send
        assert_eq!(
            user.calculate(&mut rng, &mut ingress, 5).unwrap(),
            Some(Outcome::Sent)
        );
        assert_eq!(ingress.routed.len(), 1);
        let (tick, request) = ingress.routed[0].clone();
        assert_eq!(tick, 5);
        assert_eq!(request, Request::new(UserId(3), 0, 5));

        // Response arrives at 12
        user.respond(complete(&request, 12));
        for tick in 6..12 {
            assert_eq!(user.calculate(&mut rng, &mut ingress, tick).unwrap(), None);
        }
        assert_eq!(
            user.calculate(&mut rng, &mut ingress, 12).unwrap(),
            Some(Outcome::Responded { latency: 7 })
        );
        assert_eq!(user.state(), State::Idle);

        // Next cycle starts on the following tick
        assert_eq!(user.calculate(&mut rng, &mut ingress, 13).unwrap(), None);
        assert_eq!(user.state(), State::Scheduled { at: 18 });
    }

    #[test]
    fn test_zero_think_time_sends_immediately() {
        let mut rng = StepRng::new(0, 0);
        let mut ingress = Recorder::default();
        let cfg = Config {
            period: 1,
            ..config()
        };
        let mut user = User::new(UserId(0), cfg);
        assert_eq!(
            user.calculate(&mut rng, &mut ingress, 0).unwrap(),
            Some(Outcome::Sent)
        );
        assert_eq!(ingress.routed.len(), 1);
    }

    #[test_traced]
    fn test_timeout_storm() {
        let mut rng = StdRng::seed_from_u64(0);
        let cfg = config();
        for _ in 0..100 {
            let mut ingress = Recorder::default();
            let mut user = User::new(UserId(1), cfg.clone());
            let mut sent = None;
            let mut tick = 0;
            while sent.is_none() {
                if user.calculate(&mut rng, &mut ingress, tick).unwrap() == Some(Outcome::Sent) {
                    sent = Some(tick);
                }
                tick += 1;
            }
            let sent = sent.unwrap();

            // Nothing happens until the timeout elapses
            for tick in sent + 1..sent + cfg.timeout {
                assert_eq!(user.calculate(&mut rng, &mut ingress, tick).unwrap(), None);
            }
            let tick = sent + cfg.timeout;
            let Some(Outcome::Storm { batch }) =
                user.calculate(&mut rng, &mut ingress, tick).unwrap()
            else {
                panic!("expected retry storm");
            };
            assert!((3..9).contains(&batch), "batch {batch} out of range");

            // The original request plus the duplicates, all stamped with the timeout tick
            let duplicates = &ingress.routed[1..];
            assert_eq!(duplicates.len() as u64, batch);
            for (routed_at, request) in duplicates {
                assert_eq!(*routed_at, tick);
                assert_eq!(request.submitted, tick);
                assert_eq!(request.user, UserId(1));
            }

            // Only the last duplicate is tracked
            let last = duplicates.last().unwrap().1.sequence;
            assert_eq!(
                user.state(),
                State::Awaiting {
                    sequence: last,
                    submitted: tick,
                    completion: None,
                }
            );
        }
    }

    #[test]
    fn test_superseded_responses_ignored() {
        let mut rng = StepRng::new(0, 0);
        let mut ingress = Recorder::default();
        let mut user = User::new(UserId(2), config());
        for tick in 0..=5 {
            user.calculate(&mut rng, &mut ingress, tick).unwrap();
        }
        let original = ingress.routed[0].1.clone();

        // Time out at 25 and send 3 duplicates (sequences 1..=3)
        for tick in 6..25 {
            user.calculate(&mut rng, &mut ingress, tick).unwrap();
        }
        assert_eq!(
            user.calculate(&mut rng, &mut ingress, 25).unwrap(),
            Some(Outcome::Storm { batch: 3 })
        );

        // The original and the first duplicates complete, but the user keeps waiting
        user.respond(complete(&original, 26));
        user.respond(complete(&ingress.routed[1].1, 27));
        user.respond(complete(&ingress.routed[2].1, 28));
        for tick in 26..29 {
            assert_eq!(user.calculate(&mut rng, &mut ingress, tick).unwrap(), None);
        }

        // The last duplicate completes
        user.respond(complete(&ingress.routed[3].1, 30));
        assert_eq!(user.calculate(&mut rng, &mut ingress, 29).unwrap(), None);
        assert_eq!(
            user.calculate(&mut rng, &mut ingress, 30).unwrap(),
            Some(Outcome::Responded { latency: 5 })
        );
    }

    #[test]
    fn test_timeout_wins_over_response() {
        let mut rng = StepRng::new(0, 0);
        let mut ingress = Recorder::default();
        let mut user = User::new(UserId(0), config());
        for tick in 0..=5 {
            user.calculate(&mut rng, &mut ingress, tick).unwrap();
        }
        let request = ingress.routed[0].1.clone();
        user.respond(complete(&request, 25));
        for tick in 6..25 {
            user.calculate(&mut rng, &mut ingress, tick).unwrap();
        }
        assert_eq!(
            user.calculate(&mut rng, &mut ingress, 25).unwrap(),
            Some(Outcome::Storm { batch: 3 })
        );
    }

    #[test_traced]
    fn test_fault() {
        let mut rng = StepRng::new(0, 0);
        let mut ingress = Recorder::default();

        // From idle
        let mut user = User::new(UserId(4), config());
        assert_eq!(user.fault(&mut rng, &mut ingress, 7).unwrap(), 3);
        assert_eq!(ingress.routed.len(), 3);
        assert!(ingress.routed.iter().all(|(t, r)| *t == 7 && r.submitted == 7));
        assert_eq!(
            user.state(),
            State::Awaiting {
                sequence: 2,
                submitted: 7,
                completion: None,
            }
        );

        // From scheduled
        let mut user = User::new(UserId(5), config());
        user.calculate(&mut rng, &mut ingress, 0).unwrap();
        assert_eq!(user.fault(&mut rng, &mut ingress, 2).unwrap(), 3);
        assert!(matches!(user.state(), State::Awaiting { submitted: 2, .. }));

        // The storm then behaves like any outstanding request
        assert_eq!(
            user.calculate(&mut rng, &mut ingress, 22).unwrap(),
            Some(Outcome::Storm { batch: 3 })
        );
    }

    #[test]
    fn test_missed_schedule() {
        let mut rng = StepRng::new(0, 0);
        let mut ingress = Recorder::default();
        let mut user = User::new(UserId(9), config());
        user.calculate(&mut rng, &mut ingress, 0).unwrap();
        let err = user.calculate(&mut rng, &mut ingress, 6).unwrap_err();
        assert_eq!(
            err,
            Error::MissedSchedule {
                tick: 6,
                user: UserId(9),
                scheduled: 5,
            }
        );
    }

    #[test]
    fn test_tick_before_submission_rejected() {
        let mut rng = StepRng::new(0, 0);
        let mut ingress = Recorder::default();
        let mut user = User::new(UserId(2), config());
        user.fault(&mut rng, &mut ingress, 100).unwrap();
        let err = user.calculate(&mut rng, &mut ingress, 40).unwrap_err();
        assert_eq!(
            err,
            Error::PrematureTick {
                tick: 40,
                user: UserId(2),
                submitted: 100,
            }
        );
        assert_eq!(err.entity(), Some(crate::Entity::User(UserId(2))));
    }

    #[test]
    fn test_routing_failure_propagates() {
        let mut rng = StepRng::new(0, 0);
        let mut user = User::new(UserId(1), config());
        user.calculate(&mut rng, &mut Unregistered, 0).unwrap();
        let err = user.calculate(&mut rng, &mut Unregistered, 5).unwrap_err();
        assert_eq!(
            err,
            Error::UnregisteredUser {
                tick: 5,
                user: UserId(1),
            }
        );
    }

    #[test]
    fn test_scheduling_at_tick_zero() {
        let mut rng = StepRng::new(0, 0);
        let mut ingress = Recorder::default();
        let cfg = Config {
            period: 1,
            ..config()
        };
        let mut user = User::new(UserId(0), cfg);
        user.calculate(&mut rng, &mut ingress, 0).unwrap();
        assert_eq!(ingress.routed[0].1.submitted, 0);
        assert!(matches!(user.state(), State::Awaiting { submitted: 0, .. }));
    }
}
