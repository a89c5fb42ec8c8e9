// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Repeated-Failures Circuit Breaker
//!
//! The pump records a failure on every connection fault and a success on every
//! healthy receive-loop iteration. The breaker arms on the first failure of an
//! episode and trips once the episode has lasted longer than the configured
//! threshold; it reports the trip exactly once per episode so the critical-error
//! callback does not fire on every retry attempt.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Outcome of recording a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerAction {
    /// Failures have not yet persisted past the threshold.
    Armed,
    /// The threshold was crossed; carries the reason for the critical-error callback.
    Tripped(String),
}

struct BreakerState {
    first_failure: Option<Instant>,
    tripped: bool,
}

/// Trips only after failures persist beyond `time_to_wait`, not on transient blips.
pub struct RepeatedFailuresCircuitBreaker {
    name: String,
    time_to_wait: Duration,
    state: Mutex<BreakerState>,
}

impl RepeatedFailuresCircuitBreaker {
    /// Creates a disarmed breaker.
    ///
    /// # Parameters
    /// * `name` - Label carried in logs and in the trip reason
    /// * `time_to_wait` - How long an episode must last before the breaker trips
    pub fn new(name: &str, time_to_wait: Duration) -> RepeatedFailuresCircuitBreaker {
        RepeatedFailuresCircuitBreaker {
            name: name.to_owned(),
            time_to_wait,
            state: Mutex::new(BreakerState {
                first_failure: None,
                tripped: false,
            }),
        }
    }

    /// Resets the breaker; any ongoing episode ends.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if state.first_failure.is_some() {
            debug!(breaker = self.name, "circuit breaker disarmed");
        }
        state.first_failure = None;
        state.tripped = false;
    }

    /// Records a failure.
    ///
    /// # Parameters
    /// * `reason` - What failed; carried into the trip reason
    ///
    /// # Returns
    /// `Tripped` exactly once per episode, at the first failure past the
    /// threshold; `Armed` otherwise.
    pub fn record_failure(&self, reason: &str) -> BreakerAction {
        let mut state = self.state.lock().unwrap();

        let first = match state.first_failure {
            Some(at) => at,
            None => {
                debug!(breaker = self.name, reason, "circuit breaker armed");
                state.first_failure = Some(Instant::now());
                return BreakerAction::Armed;
            }
        };

        if state.tripped || first.elapsed() < self.time_to_wait {
            return BreakerAction::Armed;
        }

        state.tripped = true;
        warn!(breaker = self.name, reason, "circuit breaker tripped");
        BreakerAction::Tripped(format!(
            "`{}` has failed continuously for longer than {:?}: {}",
            self.name, self.time_to_wait, reason
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn does_not_trip_within_threshold() {
        let breaker = RepeatedFailuresCircuitBreaker::new("consume", Duration::from_secs(60));

        assert_eq!(breaker.record_failure("down"), BreakerAction::Armed);
        assert_eq!(breaker.record_failure("down"), BreakerAction::Armed);
    }

    #[test]
    fn trips_once_per_sustained_episode() {
        let breaker = RepeatedFailuresCircuitBreaker::new("consume", Duration::from_millis(10));

        assert_eq!(breaker.record_failure("down"), BreakerAction::Armed);
        thread::sleep(Duration::from_millis(20));

        assert!(matches!(
            breaker.record_failure("down"),
            BreakerAction::Tripped(_)
        ));
        // Further failures in the same episode stay quiet.
        assert_eq!(breaker.record_failure("down"), BreakerAction::Armed);
    }

    #[test]
    fn success_resets_the_episode() {
        let breaker = RepeatedFailuresCircuitBreaker::new("consume", Duration::from_millis(10));

        breaker.record_failure("down");
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            breaker.record_failure("down"),
            BreakerAction::Tripped(_)
        ));

        breaker.record_success();

        // A fresh outage arms again and can trip again.
        assert_eq!(breaker.record_failure("down"), BreakerAction::Armed);
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            breaker.record_failure("down"),
            BreakerAction::Tripped(_)
        ));
    }
}
