//! Condition transitions of a ResourceSet status.

use chrono::{DateTime, Utc};

use rset_core::conditions::{self, reasons, ConditionStatus, READY, RECONCILING, STALLED};
use rset_core::crd::ResourceSetStatus;

pub const MSG_IN_PROGRESS: &str = "Reconciliation in progress";

pub fn ready_reason(status: &ResourceSetStatus) -> Option<&str> {
    conditions::get(&status.conditions, READY).map(|c| c.reason.as_str())
}

pub fn mark_reconciling(status: &mut ResourceSetStatus, generation: Option<i64>, now: DateTime<Utc>) {
    let conds = &mut status.conditions;
    conditions::set(conds, RECONCILING, ConditionStatus::True, reasons::PROGRESSING, MSG_IN_PROGRESS, generation, now);
    if conditions::get(conds, READY).is_none() {
        conditions::set(conds, READY, ConditionStatus::Unknown, reasons::PROGRESSING, MSG_IN_PROGRESS, generation, now);
    }
}

pub fn mark_ready(status: &mut ResourceSetStatus, message: &str, generation: Option<i64>, now: DateTime<Utc>) {
    conditions::set(&mut status.conditions, READY, ConditionStatus::True, reasons::SUCCEEDED, message, generation, now);
    conditions::remove(&mut status.conditions, RECONCILING);
    conditions::remove(&mut status.conditions, STALLED);
}

/// Not ready and not retried until the object changes.
pub fn mark_stalled(status: &mut ResourceSetStatus, reason: &str, message: &str, generation: Option<i64>, now: DateTime<Utc>) {
    conditions::set(&mut status.conditions, READY, ConditionStatus::False, reason, message, generation, now);
    conditions::set(&mut status.conditions, STALLED, ConditionStatus::True, reason, message, generation, now);
    conditions::remove(&mut status.conditions, RECONCILING);
}

/// Not ready, retrying.
pub fn mark_failed(status: &mut ResourceSetStatus, reason: &str, message: &str, generation: Option<i64>, now: DateTime<Utc>) {
    conditions::set(&mut status.conditions, READY, ConditionStatus::False, reason, message, generation, now);
    conditions::set(
        &mut status.conditions,
        RECONCILING,
        ConditionStatus::True,
        reasons::PROGRESSING_WITH_RETRY,
        message,
        generation,
        now,
    );
    conditions::remove(&mut status.conditions, STALLED);
}
