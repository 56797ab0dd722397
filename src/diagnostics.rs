use crate::schema::Warning;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub correlation_id: Uuid,
    pub duration_ms: u64,
    pub events: Vec<StageEvent>,
    pub warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn empty() -> Self {
        Self {
            correlation_id: Uuid::nil(),
            duration_ms: 0,
            events: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// JSON form for the response envelope. Falls back to `{}` rather than failing.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            warn!("Dropping diagnostics for {}: {}", self.correlation_id, e);
            serde_json::Value::Object(Default::default())
        })
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Per-request recorder: stage timings plus every warning raised along the way.
/// Nothing here can fail the request.
#[derive(Debug)]
pub struct DiagnosticsRecorder {
    correlation_id: Uuid,
    started: Instant,
    events: Vec<StageEvent>,
    warnings: Vec<Warning>,
}

impl Default for DiagnosticsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsRecorder {
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            started: Instant::now(),
            events: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn time<T>(&mut self, stage: &str, f: impl FnOnce() -> T) -> T {
        let started_at = Utc::now();
        let clock = Instant::now();
        let out = f();
        self.push_event(stage, started_at, clock.elapsed());
        out
    }

    pub async fn time_async<T, F>(&mut self, stage: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let started_at = Utc::now();
        let clock = Instant::now();
        let out = fut.await;
        self.push_event(stage, started_at, clock.elapsed());
        out
    }

    fn push_event(&mut self, stage: &str, started_at: DateTime<Utc>, elapsed: Duration) {
        self.events.push(StageEvent {
            stage: stage.to_string(),
            started_at,
            duration_ms: millis(elapsed),
        });
    }

    pub fn warn(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub fn extend(&mut self, warnings: impl IntoIterator<Item = Warning>) {
        self.warnings.extend(warnings);
    }

    pub fn finish(self) -> Diagnostics {
        Diagnostics {
            correlation_id: self.correlation_id,
            duration_ms: millis(self.started.elapsed()),
            events: self.events,
            warnings: self.warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::WarningCode;

    #[tokio::test]
    async fn test_records_stages_and_warnings() {
        let mut recorder = DiagnosticsRecorder::new();
        let n = recorder.time("read", || 2 + 2);
        let m = recorder.time_async("assist", async { n * 2 }).await;
        recorder.warn(Warning::new(WarningCode::LowConfidence, "weak header"));

        let diagnostics = recorder.finish();
        assert_eq!(m, 8);
        assert_eq!(diagnostics.events.len(), 2);
        assert_eq!(diagnostics.events[1].stage, "assist");
        assert_eq!(diagnostics.warnings.len(), 1);
        assert!(!diagnostics.correlation_id.is_nil());
        assert_eq!(diagnostics.to_json()["warnings"][0]["code"], "low_confidence");
    }
}
