//! Appliance job registry: `core.get_jobs` and terminal-state polling.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::debug;

use super::filter;
use crate::error::{ClientError, Result};
use crate::rpc::Client;

/// Default interval between job-state polls.
pub const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle state of an appliance-side job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Aborted)
    }
}

/// Progress block attached to a job record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub description: String,
}

/// One entry of the appliance job registry.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: i64,
    pub state: JobState,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default)]
    pub error: Option<String>,
}

impl Client {
    /// Fetch one job by id; `None` when the registry has no such job.
    pub async fn job_get(&self, id: i64) -> Result<Option<Job>> {
        let mut found: Vec<Job> = self
            .call("core.get_jobs", vec![json!(vec![filter("id", "=", id)])])
            .await
            .map_err(|e| e.for_method("core.get_jobs"))?;
        Ok(found.drain(..).next())
    }

    /// Poll a job until it reaches a terminal state.
    ///
    /// The overall deadline is the caller's: wrap this in
    /// `tokio::time::timeout` to bound long-running jobs.
    pub async fn job_wait(&self, id: i64, poll_interval: Duration) -> Result<Job> {
        loop {
            let job = self.job_get(id).await?.ok_or(ClientError::JobNotFound(id))?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            debug!(
                job_id = id,
                state = ?job.state,
                percent = job.progress.percent,
                "job still running"
            );
            sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Aborted.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
    }

    #[test]
    fn test_job_decodes_with_defaults() {
        let job: Job = serde_json::from_value(json!({
            "id": 17,
            "state": "RUNNING"
        }))
        .unwrap();
        assert_eq!(job.id, 17);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.progress.percent, 0.0);
        assert!(job.error.is_none());
    }
}
