//! Reconciliation primitives.
//!
//! Building blocks shared by reconcilers that drive remote, long-running
//! operations to completion:
//!
//! - [`Action`]: what the control loop should do after a pass.
//! - [`BackoffGate`]: timestamp gate that enforces a minimum delay between a
//!   failed remote operation and its resubmission.
//! - [`Conditions`]: reason/severity/message status reporting.
//! - [`SpecHash`]: deterministic hash of a spec for drift detection.
//! - [`Clock`]: injectable wall clock.
//!
//! # Invariants
//!
//! - A pass is idempotent: rerunning it against unchanged inputs yields the
//!   same decisions and no state changes.
//! - All persisted timing (retry gates, condition timestamps) is wall-clock
//!   time so it survives restarts.

mod clock;
mod condition;
mod gate;

use std::time::Duration;

use sha2::{Digest, Sha256};

pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::{Condition, ConditionStatus, Conditions, Severity};
pub use gate::{BackoffGate, GateDecision};

/// Outcome of a reconcile pass, consumed by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run another pass after the given delay.
    Requeue(Duration),

    /// Nothing to do until something external changes (a completion
    /// signal, a spec edit, or the periodic resync).
    AwaitChange,

    /// The resource reached a terminal state; stop tracking it.
    Done,
}

impl Action {
    /// Requeue after `delay`.
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }

    /// Returns the requeue delay, if any.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Requeue(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns true for [`Action::Done`].
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// A spec hash for deterministic comparison.
///
/// Used to detect when the reconfigurable part of a spec changed after it
/// was last applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(json).as_bytes());
        let digest = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Wrap a previously computed hash string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical JSON: object keys sorted, no insignificant whitespace.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(v)
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Fixed window between a failed remote task and its resubmission.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Periodic resync interval for every tracked resource.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Delay before re-examining a resource with an in-flight remote task.
pub const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(10);
