//! Status conditions and the set/find helpers shared by every status-bearing kind.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Build a condition stamped with the current time. The stamp is only kept
    /// when the condition is new or its status transitions.
    pub fn new(type_: impl Into<String>, status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_transition_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_transition_time = at;
        self
    }
}

/// Status payloads that carry a condition list.
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map(|c| c.status == ConditionStatus::True).unwrap_or(false)
}

/// Set `desired` into `conditions`, keeping at most one entry per type.
///
/// - absent: appended as given
/// - same status/reason/message: untouched
/// - status changed: status, reason and message replaced, transition time advanced
/// - only reason/message changed: both replaced, transition time kept
///
/// Returns whether the list changed.
pub fn set_condition(conditions: &mut Vec<Condition>, desired: Condition) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == desired.type_) else {
        conditions.push(desired);
        return true;
    };

    if existing.status != desired.status {
        // Transition times never go backwards for a given condition type.
        let at = if desired.last_transition_time > existing.last_transition_time {
            desired.last_transition_time
        } else {
            existing.last_transition_time + Duration::microseconds(1)
        };
        existing.status = desired.status;
        existing.reason = desired.reason;
        existing.message = desired.message;
        existing.last_transition_time = at;
        return true;
    }

    let mut changed = false;
    if existing.reason != desired.reason {
        existing.reason = desired.reason;
        changed = true;
    }
    if existing.message != desired.message {
        existing.message = desired.message;
        changed = true;
    }
    changed
}

/// Drop the condition of the given type; returns whether one was removed.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(type_: &str, status: ConditionStatus, reason: &str, message: &str) -> Condition {
        Condition::new(type_, status, reason, message)
    }

    #[test]
    fn add_to_empty_and_non_conflicting() {
        let mut conds = Vec::new();
        assert!(set_condition(&mut conds, cond("two", ConditionStatus::True, "my-reason", "my-message")));
        assert!(set_condition(&mut conds, cond("one", ConditionStatus::True, "my-reason", "my-message")));
        let types: Vec<_> = conds.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["two", "one"]);
    }

    #[test]
    fn identical_condition_keeps_original_transition_time() {
        let before = Utc::now() - Duration::seconds(10);
        let after = Utc::now() + Duration::seconds(10);
        let mut conds = vec![cond("one", ConditionStatus::True, "my-reason", "my-message").with_transition_time(before)];
        let changed = set_condition(
            &mut conds,
            cond("one", ConditionStatus::True, "my-reason", "my-message").with_transition_time(after),
        );
        assert!(!changed);
        assert_eq!(conds[0].last_transition_time, before);
    }

    #[test]
    fn reason_change_keeps_transition_time() {
        let before = Utc::now() - Duration::seconds(10);
        let mut conds = vec![cond("one", ConditionStatus::True, "my-reason", "my-message").with_transition_time(before)];
        assert!(set_condition(&mut conds, cond("one", ConditionStatus::True, "other-reason", "other-message")));
        assert_eq!(conds[0].reason, "other-reason");
        assert_eq!(conds[0].message, "other-message");
        assert_eq!(conds[0].last_transition_time, before);
    }

    #[test]
    fn status_change_advances_transition_time() {
        let before = Utc::now() - Duration::seconds(10);
        let mut conds = vec![
            cond("two", ConditionStatus::True, "my-reason", "my-message"),
            cond("one", ConditionStatus::True, "my-reason", "my-message").with_transition_time(before),
        ];
        assert!(set_condition(&mut conds, cond("one", ConditionStatus::False, "my-different-reason", "my-othermessage")));
        assert_eq!(conds.len(), 2);
        assert_eq!(conds[1].status, ConditionStatus::False);
        assert_eq!(conds[1].reason, "my-different-reason");
        assert!(conds[1].last_transition_time > before);
    }

    #[test]
    fn status_change_with_stale_stamp_still_moves_forward() {
        let now = Utc::now();
        let mut conds = vec![cond("one", ConditionStatus::True, "r", "m").with_transition_time(now)];
        let stale = cond("one", ConditionStatus::False, "r", "m").with_transition_time(now - Duration::seconds(5));
        assert!(set_condition(&mut conds, stale));
        assert!(conds[0].last_transition_time > now);
    }

    #[test]
    fn serializes_with_kubernetes_field_names() {
        let at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let c = cond("Empty", ConditionStatus::True, "NoClusterMatched", "No ManagedCluster selected").with_transition_time(at);
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "Empty");
        assert_eq!(v["status"], "True");
        assert!(v.get("lastTransitionTime").is_some());
        let back: Condition = serde_json::from_value(v).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn find_and_remove() {
        let mut conds = vec![cond("Empty", ConditionStatus::True, "r", "m")];
        assert!(is_condition_true(&conds, "Empty"));
        assert!(!is_condition_true(&conds, "Other"));
        assert!(remove_condition(&mut conds, "Empty"));
        assert!(find_condition(&conds, "Empty").is_none());
        assert!(!remove_condition(&mut conds, "Empty"));
    }
}
