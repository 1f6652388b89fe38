//! Status conditions.
//!
//! Failures and progress are reported through conditions on the resource
//! status rather than returned errors. A condition's transition time only
//! moves when its status flips, so rewriting an identical condition is a
//! no-op and a steady-state pass leaves persisted state untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// How serious a non-true condition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

/// A single status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default)]
    pub severity: Severity,

    /// Machine-readable reason, CamelCase.
    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// A true condition.
    pub fn true_(type_: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::True,
            severity: Severity::Info,
            reason: String::new(),
            message: String::new(),
            last_transition_time: now,
        }
    }

    /// A false condition with reason, severity, and message.
    pub fn false_(
        type_: impl Into<String>,
        reason: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::False,
            severity,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// An ordered set of conditions keyed by type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).is_some_and(Condition::is_true)
    }

    pub fn is_false(&self, type_: &str) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::False)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Insert or replace a condition.
    ///
    /// If a condition of the same type exists with the same status, its
    /// transition time is kept. Returns true if anything changed.
    pub fn set(&mut self, mut condition: Condition) -> bool {
        match self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                if *existing == condition {
                    return false;
                }
                *existing = condition;
                true
            }
            None => {
                self.0.push(condition);
                true
            }
        }
    }

    pub fn mark_true(&mut self, type_: &str, now: DateTime<Utc>) -> bool {
        self.set(Condition::true_(type_, now))
    }

    pub fn mark_false(
        &mut self,
        type_: &str,
        reason: &str,
        severity: Severity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        self.set(Condition::false_(type_, reason, severity, message, now))
    }

    /// Remove a condition by type. Returns true if one was removed.
    pub fn remove(&mut self, type_: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.type_ != type_);
        before != self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_same_status_keeps_transition_time() {
        let mut conds = Conditions::new();
        assert!(conds.mark_false("Ready", "Waiting", Severity::Info, "a", at(0)));
        assert!(conds.mark_false("Ready", "Waiting", Severity::Info, "b", at(10)));

        let ready = conds.get("Ready").unwrap();
        assert_eq!(ready.message, "b");
        assert_eq!(ready.last_transition_time, at(0));
    }

    #[test]
    fn test_identical_set_is_noop() {
        let mut conds = Conditions::new();
        conds.mark_true("Ready", at(0));
        assert!(!conds.mark_true("Ready", at(30)));
        assert_eq!(conds.get("Ready").unwrap().last_transition_time, at(0));
    }

    #[test]
    fn test_flip_moves_transition_time() {
        let mut conds = Conditions::new();
        conds.mark_true("Ready", at(0));
        conds.mark_false("Ready", "Lost", Severity::Warning, "gone", at(5));
        let ready = conds.get("Ready").unwrap();
        assert_eq!(ready.last_transition_time, at(5));
        assert!(conds.is_false("Ready"));
    }

    #[rstest]
    #[case(ConditionStatus::True, "True")]
    #[case(ConditionStatus::False, "False")]
    #[case(ConditionStatus::Unknown, "Unknown")]
    fn test_status_display(#[case] status: ConditionStatus, #[case] expected: &str) {
        assert_eq!(status.to_string(), expected);
    }

    #[test]
    fn test_serde_shape() {
        let cond = Condition::false_("NetworkReady", "WaitingForIp", Severity::Info, "", at(0));
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "NetworkReady");
        assert_eq!(json["status"], "False");
        assert_eq!(json["severity"], "info");
        assert!(json.get("lastTransitionTime").is_some());
    }
}
