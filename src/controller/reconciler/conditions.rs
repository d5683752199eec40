//! # Conditions
//!
//! Condition list updates. A condition keeps its `lastTransitionTime` while
//! its status does not change, so repeated passes leave it untouched.

use crate::controller::reconciler::reasons::{ConditionStatus, ConditionType, Reason};
use crate::crd::Condition;
use chrono::{DateTime, SecondsFormat, Utc};

/// Set (or add) the condition of `condition_type`
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    condition_type: ConditionType,
    status: ConditionStatus,
    reason: impl Reason,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    set_raw(
        conditions,
        condition_type,
        status,
        reason.as_str(),
        message.into(),
        now,
    );
}

/// Set `to` with the reason and message currently held by `from`
pub fn copy_condition(
    conditions: &mut Vec<Condition>,
    from: ConditionType,
    to: ConditionType,
    status: ConditionStatus,
    now: DateTime<Utc>,
) {
    if let Some((reason, message)) = condition_reason(conditions, from) {
        set_raw(conditions, to, status, &reason, message, now);
    }
}

fn set_raw(
    conditions: &mut Vec<Condition>,
    condition_type: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: String,
    now: DateTime<Utc>,
) {
    match conditions
        .iter_mut()
        .find(|c| c.r#type == condition_type.as_str())
    {
        Some(existing) => {
            if existing.status != status.as_str() {
                existing.status = status.as_str().to_string();
                existing.last_transition_time = Some(format_time(now));
            }
            existing.reason = Some(reason.to_string());
            existing.message = Some(message);
        }
        None => conditions.push(Condition {
            r#type: condition_type.as_str().to_string(),
            status: status.as_str().to_string(),
            last_transition_time: Some(format_time(now)),
            reason: Some(reason.to_string()),
            message: Some(message),
        }),
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, condition_type: ConditionType) {
    conditions.retain(|c| c.r#type != condition_type.as_str());
}

/// Reason and message of a condition, if present
#[must_use]
pub fn condition_reason(
    conditions: &[Condition],
    condition_type: ConditionType,
) -> Option<(String, String)> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type.as_str())
        .map(|c| {
            (
                c.reason.clone().unwrap_or_default(),
                c.message.clone().unwrap_or_default(),
            )
        })
}

/// RFC3339 with second precision, as Kubernetes writes timestamps
#[must_use]
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a timestamp written by [`format_time`]
#[must_use]
pub fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}
