//! Retry backoff gate.
//!
//! A failed remote operation must not be resubmitted on every reconcile
//! tick. The gate is a single persisted `retry_after` timestamp handled in
//! two phases:
//!
//! 1. First pass after the failure: arm the gate at `now + window`.
//! 2. Any later pass: block while `now < retry_after`; once elapsed, disarm
//!    and let the caller resubmit.
//!
//! Because arming and releasing happen on different passes, at least one
//! full window of wall-clock time separates a failure from the retry, no
//! matter how often the reconciler runs.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Decision produced by [`BackoffGate::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The gate was unset and has just been armed.
    Armed { until: DateTime<Utc> },

    /// The gate is armed and has not yet elapsed.
    Blocked { until: DateTime<Utc> },

    /// The gate had elapsed and was cleared; resubmission is allowed.
    Released,
}

impl GateDecision {
    /// Returns true if the caller must not submit anything this pass.
    pub fn is_blocked(&self) -> bool {
        !matches!(self, Self::Released)
    }

    /// The instant the caller has to wait for, if blocked.
    pub fn must_wait_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Armed { until } | Self::Blocked { until } => Some(*until),
            Self::Released => None,
        }
    }

    /// Time left until the gate opens, measured from `now`.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.must_wait_until()
            .and_then(|until| (until - now).to_std().ok())
            .unwrap_or_default()
    }
}

/// Fixed-window retry gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffGate {
    window: Duration,
}

impl Default for BackoffGate {
    fn default() -> Self {
        Self::new(crate::DEFAULT_RETRY_BACKOFF)
    }
}

impl BackoffGate {
    /// Create a gate with the given window.
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// The configured window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Evaluate the gate stored in `retry_after`, mutating it in place.
    ///
    /// `Released` leaves `retry_after` cleared; the caller is responsible for
    /// clearing any stale task reference alongside it.
    pub fn evaluate(
        &self,
        retry_after: &mut Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> GateDecision {
        match *retry_after {
            None => {
                let window = chrono::Duration::from_std(self.window)
                    .unwrap_or_else(|_| chrono::Duration::days(365));
                let until = now + window;
                *retry_after = Some(until);
                GateDecision::Armed { until }
            }
            Some(until) if now < until => GateDecision::Blocked { until },
            Some(_) => {
                *retry_after = None;
                GateDecision::Released
            }
        }
    }

    /// Check an armed gate without arming an unset one.
    ///
    /// Used when the failed task has vanished remotely: an armed gate must
    /// still be honoured, but there is no failure to arm a new one for.
    pub fn check(
        &self,
        retry_after: &mut Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<GateDecision> {
        retry_after.map(|_| self.evaluate(retry_after, now))
    }
}
