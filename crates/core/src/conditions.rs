//! Status conditions in the `metav1.Condition` shape.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";
pub const RECONCILING: &str = "Reconciling";
pub const STALLED: &str = "Stalled";

pub mod reasons {
    pub const SUCCEEDED: &str = "ReconciliationSucceeded";
    pub const FAILED: &str = "ReconciliationFailed";
    pub const PROGRESSING: &str = "Progressing";
    pub const PROGRESSING_WITH_RETRY: &str = "ProgressingWithRetry";
    pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
    pub const INVALID_EXPRESSION: &str = "InvalidExpression";
    pub const INVALID_CONFIGURATION: &str = "InvalidConfiguration";
    pub const INVALID_INPUTS: &str = "InvalidInputs";
    pub const INPUTS_FETCH_FAILED: &str = "InputsFetchFailed";
    pub const BUILD_FAILED: &str = "BuildFailed";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).map(|c| c.status == ConditionStatus::True).unwrap_or(false)
}

/// Upsert a condition; `last_transition_time` only moves when the status flips.
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    generation: Option<i64>,
    now: DateTime<Utc>,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(c) => {
            if c.status != status {
                c.last_transition_time = now;
            }
            c.status = status;
            c.reason = reason.to_string();
            c.message = message.to_string();
            c.observed_generation = generation;
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
            observed_generation: generation,
        }),
    }
}

pub fn remove(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn transition_time_moves_only_on_status_flip() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let t1 = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        let t2 = Utc.timestamp_opt(1_700_000_200, 0).unwrap();
        let mut conds = Vec::new();
        set(&mut conds, READY, ConditionStatus::False, reasons::FAILED, "boom", Some(1), t0);
        set(&mut conds, READY, ConditionStatus::False, reasons::DEPENDENCY_NOT_READY, "waiting", Some(2), t1);
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].last_transition_time, t0);
        assert_eq!(conds[0].reason, reasons::DEPENDENCY_NOT_READY);
        assert_eq!(conds[0].observed_generation, Some(2));

        set(&mut conds, READY, ConditionStatus::True, reasons::SUCCEEDED, "ok", Some(2), t2);
        assert_eq!(conds[0].last_transition_time, t2);
        assert!(is_true(&conds, READY));

        remove(&mut conds, READY);
        assert!(get(&conds, READY).is_none());
    }
}
