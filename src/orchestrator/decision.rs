//! Structured per-run decision log.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// One stage of a state machine run
#[derive(Debug, Clone, Serialize)]
pub struct DecisionStage {
    pub stage: String,
    pub vals: Value,
    pub time: DateTime<Utc>,
}

/// Ordered record of what a run saw and decided
#[derive(Debug)]
pub struct DecisionLog {
    stages: Vec<DecisionStage>,
    started: Instant,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn add(&mut self, stage: &str, vals: Value) {
        self.stages.push(DecisionStage {
            stage: stage.to_string(),
            vals,
            time: Utc::now(),
        });
    }

    pub fn stages(&self) -> &[DecisionStage] {
        &self.stages
    }

    /// Emit the whole log as a single event
    pub fn emit(&self, run: u64, success: bool) {
        let decision_log = serde_json::to_string(&self.stages).unwrap_or_else(|e| format!("<unprintable: {}>", e));
        tracing::info!(
            run,
            success,
            duration_ms = self.started.elapsed().as_millis() as u64,
            decision_log = %decision_log,
            "State machine run finished"
        );
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stages_keep_order() {
        let mut log = DecisionLog::new();
        log.add("begin", json!({ "slice": 3 }));
        log.add("end", json!({ "next_slice": 4 }));

        let names: Vec<_> = log.stages().iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(names, vec!["begin", "end"]);
        assert_eq!(log.stages()[0].vals["slice"], 3);
    }
}
