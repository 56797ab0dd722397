//! Background runs for long freeform uploads: submit returns an id at once,
//! callers poll `status` until the job is `done` or `error`. Finished jobs are
//! kept for a retention window, then forgotten.

use crate::error::{IntakeError, Result};
use crate::pipeline::{Pipeline, PipelineEvent, PipelineResponse, UploadRequest};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: JobState,
    pub stage: String,
    /// Present only once the job is done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PipelineResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobStatus {
    fn queued() -> Self {
        Self {
            status: JobState::Queued,
            stage: "queued".to_string(),
            payload: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobState::Done | JobState::Error)
    }
}

/// How long a finished job stays readable by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(15 * 60);

struct Entry {
    status: JobStatus,
    finished_at: Option<Instant>,
}

type Jobs = Arc<Mutex<HashMap<Uuid, Entry>>>;

fn update(jobs: &Jobs, id: Uuid, f: impl FnOnce(&mut JobStatus)) {
    let mut guard = jobs.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = guard.get_mut(&id) {
        f(&mut entry.status);
        if entry.finished_at.is_none() && entry.status.is_terminal() {
            entry.finished_at = Some(Instant::now());
        }
    }
}

#[derive(Clone)]
pub struct JobStore {
    pipeline: Arc<Pipeline>,
    jobs: Jobs,
    retention: Duration,
}

impl JobStore {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Drops jobs that finished more than `retention` ago.
    fn prune(&self, jobs: &mut HashMap<Uuid, Entry>) {
        let before = jobs.len();
        jobs.retain(|_, e| e.finished_at.map_or(true, |t| t.elapsed() <= self.retention));
        if jobs.len() < before {
            debug!("Evicted {} finished job(s)", before - jobs.len());
        }
    }

    /// Queues the request on the tokio runtime and returns its id immediately.
    pub fn submit(&self, request: UploadRequest) -> Uuid {
        let id = Uuid::new_v4();
        {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            self.prune(&mut jobs);
            jobs.insert(
                id,
                Entry {
                    status: JobStatus::queued(),
                    finished_at: None,
                },
            );
        }
        info!("Job {} queued", id);

        let pipeline = Arc::clone(&self.pipeline);
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            update(&jobs, id, |s| {
                s.status = JobState::Running;
                s.stage = "starting".to_string();
            });

            let (tx, mut rx) = mpsc::channel::<PipelineEvent>(16);
            let stage_jobs = Arc::clone(&jobs);
            let stages = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    debug!("Job {} stage: {}", id, event.stage());
                    update(&stage_jobs, id, |s| {
                        if !s.is_terminal() {
                            s.stage = event.stage().to_string();
                        }
                    });
                }
            });

            let outcome = pipeline.run_with_progress(request, Some(tx)).await;
            let _ = stages.await;

            match outcome {
                Ok(response) => {
                    info!("Job {} done", id);
                    update(&jobs, id, |s| {
                        s.status = JobState::Done;
                        s.stage = "done".to_string();
                        s.payload = Some(response);
                    });
                }
                Err(failure) => {
                    info!("Job {} failed: {}", id, failure);
                    update(&jobs, id, |s| {
                        s.status = JobState::Error;
                        s.stage = "error".to_string();
                        s.error = Some(JobError {
                            code: failure.code().to_string(),
                            message: failure.error.to_string(),
                        });
                    });
                }
            }
        });
        id
    }

    pub fn status(&self, id: Uuid) -> Result<JobStatus> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        self.prune(&mut jobs);
        jobs.get(&id)
            .map(|e| e.status.clone())
            .ok_or_else(|| IntakeError::JobNotFound(id.to_string()))
    }

    /// Jobs currently held, finished ones included.
    pub fn len(&self) -> usize {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        self.prune(&mut jobs);
        jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
