use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_with::{serde_as, DefaultOnNull};

/// Criteria type id the completion subsystem assigns to self completion.
pub const CRITERIA_TYPE_SELF: u32 = 1;

/// One completion rule attached to a course.
#[serde_as]
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CompletionCriterion {
    #[serde(rename = "type")]
    pub kind: u32,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub complete: bool,
    /// Epoch seconds on the wire; 0 and null both mean "no progress yet".
    #[serde(default, rename = "timecompleted", deserialize_with = "epoch_opt")]
    pub time_completed: Option<DateTime<Utc>>,
    pub title: Option<String>,
}

impl CompletionCriterion {
    pub fn has_progress(&self) -> bool {
        self.time_completed.is_some() || self.complete
    }
}

/// Aggregate completion state for one (course, user) pair. Never persisted
/// here; fetched on demand and cached by the site's request cache.
#[serde_as]
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CourseCompletion {
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub completed: bool,
    /// Order as returned by the server; not semantically significant.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub completions: Vec<CompletionCriterion>,
    pub aggregation: Option<u32>,
}

/// Derived course status. Opaque identifiers meant for later localization
/// by the caller, not display strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    InProgress,
    NotYetStarted,
}

/// Course record as served by the course directory. Only `enablecompletion`
/// is consulted by this crate.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CourseRecord {
    pub id: u64,
    pub fullname: Option<String>,
    pub enablecompletion: Option<u32>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct WsWarning {
    pub warningcode: Option<String>,
    pub message: Option<String>,
}

// --- wire envelopes ---

#[derive(Deserialize, Debug, Clone)]
pub struct CompletionStatusResponse {
    pub completionstatus: Option<CourseCompletion>,
    #[serde(default)]
    pub warnings: Vec<WsWarning>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SelfCompletionResponse {
    /// Some deployments send 0/1 here instead of a boolean.
    #[serde(default, deserialize_with = "truthy")]
    pub status: bool,
    #[serde(default)]
    pub warnings: Vec<WsWarning>,
}

fn epoch_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw
        .filter(|&secs| secs != 0)
        .and_then(|secs| DateTime::from_timestamp(secs, 0)))
}

fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn criterion_treats_zero_timestamp_as_no_progress() {
        let c: CompletionCriterion =
            serde_json::from_value(json!({ "type": 1, "complete": false, "timecompleted": 0 }))
                .unwrap();
        assert_eq!(c.time_completed, None);
        assert!(!c.has_progress());
    }

    #[test]
    fn criterion_parses_epoch_seconds() {
        let c: CompletionCriterion = serde_json::from_value(
            json!({ "type": 1, "complete": false, "timecompleted": 1700000000i64 }),
        )
        .unwrap();
        assert_eq!(c.time_completed.unwrap().timestamp(), 1700000000);
        assert!(c.has_progress());
    }

    #[test]
    fn criterion_tolerates_null_fields() {
        let c: CompletionCriterion =
            serde_json::from_value(json!({ "type": 4, "complete": null, "timecompleted": null }))
                .unwrap();
        assert!(!c.complete);
        assert_eq!(c.time_completed, None);
    }

    #[test]
    fn self_completion_status_accepts_bool_and_integer() {
        let r: SelfCompletionResponse = serde_json::from_value(json!({ "status": true })).unwrap();
        assert!(r.status);
        let r: SelfCompletionResponse = serde_json::from_value(json!({ "status": 1 })).unwrap();
        assert!(r.status);
        let r: SelfCompletionResponse = serde_json::from_value(json!({ "status": 0 })).unwrap();
        assert!(!r.status);
        let r: SelfCompletionResponse = serde_json::from_value(json!({ "warnings": [] })).unwrap();
        assert!(!r.status);
    }

    #[test]
    fn completion_status_response_without_payload() {
        let r: CompletionStatusResponse =
            serde_json::from_value(json!({ "warnings": [] })).unwrap();
        assert!(r.completionstatus.is_none());
    }
}
