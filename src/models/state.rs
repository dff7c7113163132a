// Persisted run state
//
// The checkpoint is the only state that survives a process exit. Everything else about a run
// is rebuilt from the registry and the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub run_id: String,
    /// Always a step already recorded in a ledger.
    pub last_completed_step_id: String,
    pub success_count: u32,
    pub failure_count: u32,
    /// Failures recorded so far, so a resumed run can still report their reasons.
    #[serde(default)]
    pub failed_steps: Vec<FailedStep>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStep {
    pub step_id: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_json_uses_camel_case_keys() {
        let cp = Checkpoint {
            run_id: "r1".to_string(),
            last_completed_step_id: "004-vlc".to_string(),
            success_count: 3,
            failure_count: 1,
            failed_steps: vec![FailedStep {
                step_id: "003-zoom".to_string(),
                reason: "HTTP 404 Not Found".to_string(),
            }],
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&cp).expect("serialize");
        assert_eq!(json["lastCompletedStepId"], "004-vlc");
        assert_eq!(json["successCount"], 3);
        assert_eq!(json["failedSteps"][0]["stepId"], "003-zoom");
        let back: Checkpoint = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, cp);
    }

    #[test]
    fn checkpoint_without_failed_steps_still_loads() {
        let raw = r#"{"runId":"r1","lastCompletedStepId":"001-a","successCount":1,"failureCount":0,"timestamp":"2026-01-01T00:00:00Z"}"#;
        let cp: Checkpoint = serde_json::from_str(raw).expect("deserialize");
        assert!(cp.failed_steps.is_empty());
    }
}
