pub mod processor;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use engine::decision::JobParams;
use engine::error::OrchestratorError;
use engine::timeline::TierAttemptResult;

use crate::db::Database;
use crate::orchestrator::{JobReport, JobStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// Finished with a playable file that fell outside the tolerance band.
    Flagged,
    Failed,
    Cancelled,
}

/// Body of a job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub mission: String,
    #[serde(flatten)]
    pub params: JobParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub status: JobStatus,
    pub stage: Option<JobStage>,
    pub request: JobRequest,
    pub report: Option<JobReport>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    StageChanged { job_id: i64, stage: JobStage },
    AttemptRecorded { job_id: i64, attempt: TierAttemptResult },
    JobCompleted { job_id: i64, status: JobStatus, final_duration_ticks: i64 },
    JobFailed { job_id: i64, status: JobStatus, kind: String, error: String },
}

impl JobEvent {
    pub fn job_id(&self) -> i64 {
        match self {
            JobEvent::StageChanged { job_id, .. }
            | JobEvent::AttemptRecorded { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobFailed { job_id, .. } => *job_id,
        }
    }
}

fn text_column_error(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "TEXT".to_string(), rusqlite::types::Type::Text)
}

pub struct JobManager {
    db: Arc<Database>,
    event_tx: broadcast::Sender<JobEvent>,
    cancel_tokens: Mutex<HashMap<i64, CancellationToken>>,
}

impl JobManager {
    pub fn new(db: Arc<Database>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        JobManager {
            db,
            event_tx,
            cancel_tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    pub fn create_job(&self, request: &JobRequest) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let status_str = serde_json::to_string(&JobStatus::Pending)?;
        let params_str = serde_json::to_string(&request.params)?;

        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO jobs (status, mission, params_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![status_str, request.mission, params_str, now, now],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, status, stage, mission, params_json, report_json, error, error_kind, created_at, updated_at FROM jobs WHERE id = ?1",
        )?;

        let job = stmt
            .query_row(params![id], |row| {
                let status_str: String = row.get(1)?;
                let stage_str: Option<String> = row.get(2)?;
                let params_str: String = row.get(4)?;
                let report_str: Option<String> = row.get(5)?;
                let created_at_str: String = row.get(8)?;
                let updated_at_str: String = row.get(9)?;

                let status = serde_json::from_str(&status_str).map_err(|_| text_column_error(1))?;
                let stage = stage_str
                    .map(|s| serde_json::from_str(&s))
                    .transpose()
                    .map_err(|_| text_column_error(2))?;
                let params = serde_json::from_str(&params_str).map_err(|_| text_column_error(4))?;
                let report = report_str
                    .map(|s| serde_json::from_str(&s))
                    .transpose()
                    .map_err(|_| text_column_error(5))?;
                let created_at = DateTime::parse_from_rfc3339(&created_at_str)
                    .map_err(|_| text_column_error(8))?
                    .with_timezone(&Utc);
                let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
                    .map_err(|_| text_column_error(9))?
                    .with_timezone(&Utc);

                Ok(Job {
                    id: row.get(0)?,
                    status,
                    stage,
                    request: JobRequest {
                        mission: row.get(3)?,
                        params,
                    },
                    report,
                    error: row.get(6)?,
                    error_kind: row.get(7)?,
                    created_at,
                    updated_at,
                })
            })
            .optional()?;

        Ok(job)
    }

    /// Pending job ids, oldest first.
    pub fn pending_jobs(&self) -> Result<Vec<i64>> {
        let status_str = serde_json::to_string(&JobStatus::Pending)?;
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC")?;
        let ids = stmt
            .query_map(params![status_str], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn update_job_status(&self, id: i64, status: JobStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let status_str = serde_json::to_string(&status)?;
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status_str, now, id],
        )?;
        Ok(())
    }

    pub fn set_stage(&self, id: i64, stage: JobStage) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let stage_str = serde_json::to_string(&stage)?;
        {
            let conn = self.db.conn()?;
            conn.execute(
                "UPDATE jobs SET stage = ?1, updated_at = ?2 WHERE id = ?3",
                params![stage_str, now, id],
            )?;
        }
        self.emit(JobEvent::StageChanged { job_id: id, stage });
        Ok(())
    }

    pub fn record_attempt(&self, id: i64, attempt: &TierAttemptResult) -> Result<()> {
        self.db.insert_attempt(id, attempt)?;
        self.emit(JobEvent::AttemptRecorded {
            job_id: id,
            attempt: attempt.clone(),
        });
        Ok(())
    }

    pub fn complete_job(&self, id: i64, report: &JobReport) -> Result<JobStatus> {
        let status = if report.is_publishable() {
            JobStatus::Completed
        } else {
            JobStatus::Flagged
        };
        let now = Utc::now().to_rfc3339();
        let status_str = serde_json::to_string(&status)?;
        let report_str = serde_json::to_string(report)?;
        let violation = report.tolerance_violation.as_ref().map(|v| v.to_string());
        {
            let conn = self.db.conn()?;
            conn.execute(
                "UPDATE jobs SET status = ?1, report_json = ?2, error = ?3, error_kind = ?4, updated_at = ?5 WHERE id = ?6",
                params![
                    status_str,
                    report_str,
                    violation,
                    violation.as_ref().map(|_| "duration_out_of_tolerance"),
                    now,
                    id
                ],
            )?;
        }
        self.emit(JobEvent::JobCompleted {
            job_id: id,
            status,
            final_duration_ticks: report.final_duration_ticks,
        });
        Ok(status)
    }

    pub fn fail_job(&self, id: i64, error: &OrchestratorError) -> Result<JobStatus> {
        let status = match error {
            OrchestratorError::Cancelled(_) => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        };
        let now = Utc::now().to_rfc3339();
        let status_str = serde_json::to_string(&status)?;
        let message = format!("{:#}", error);
        {
            let conn = self.db.conn()?;
            conn.execute(
                "UPDATE jobs SET status = ?1, error = ?2, error_kind = ?3, updated_at = ?4 WHERE id = ?5",
                params![status_str, message, error.kind(), now, id],
            )?;
        }
        self.emit(JobEvent::JobFailed {
            job_id: id,
            status,
            kind: error.kind().to_string(),
            error: message,
        });
        Ok(status)
    }

    /// Token the processor hands to the orchestrator for a running job.
    pub fn register_cancel_token(&self, id: i64) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, token.clone());
        token
    }

    pub fn release_cancel_token(&self, id: i64) {
        self.cancel_tokens.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
    }

    /// Move a job from `from` to `to` only if it is still in `from`.
    /// Returns whether this call made the change.
    pub fn transition_status(&self, id: i64, from: JobStatus, to: JobStatus) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let from_str = serde_json::to_string(&from)?;
        let to_str = serde_json::to_string(&to)?;
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to_str, now, id, from_str],
        )?;
        Ok(changed == 1)
    }

    /// Cancel a pending or running job. Returns false if the job is unknown
    /// or already finished.
    pub fn cancel_job(&self, id: i64) -> Result<bool> {
        if self.transition_status(id, JobStatus::Pending, JobStatus::Cancelled)? {
            return Ok(true);
        }
        let token = self
            .cancel_tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> JobManager {
        JobManager::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn request() -> JobRequest {
        serde_json::from_value(serde_json::json!({
            "mission": "Explain cold brew",
            "target_duration": 30.0,
            "platform": "tiktok",
            "tolerance": 0.05
        }))
        .unwrap()
    }

    #[test]
    fn created_jobs_are_pending_and_readable() {
        let jobs = manager();
        let id = jobs.create_job(&request()).unwrap();
        let job = jobs.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.stage, None);
        assert_eq!(job.request.params.platform, "tiktok");
        assert_eq!(job.request.params.tolerance, Some(0.05));
        assert_eq!(jobs.pending_jobs().unwrap(), vec![id]);
        assert!(jobs.get_job(id + 1).unwrap().is_none());
    }

    #[tokio::test]
    async fn stage_changes_are_broadcast() {
        let jobs = manager();
        let mut rx = jobs.subscribe();
        let id = jobs.create_job(&request()).unwrap();
        jobs.set_stage(id, JobStage::Generating).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), id);
        assert!(matches!(event, JobEvent::StageChanged { stage: JobStage::Generating, .. }));
        assert_eq!(jobs.get_job(id).unwrap().unwrap().stage, Some(JobStage::Generating));
    }

    #[test]
    fn cancelling_a_running_job_trips_its_token() {
        let jobs = manager();
        let id = jobs.create_job(&request()).unwrap();
        jobs.update_job_status(id, JobStatus::Running).unwrap();
        let token = jobs.register_cancel_token(id);

        assert!(jobs.cancel_job(id).unwrap());
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancelling_a_pending_job_marks_it_cancelled() {
        let jobs = manager();
        let id = jobs.create_job(&request()).unwrap();
        assert!(jobs.cancel_job(id).unwrap());
        assert_eq!(jobs.get_job(id).unwrap().unwrap().status, JobStatus::Cancelled);
        assert!(!jobs.cancel_job(id).unwrap());
        assert!(jobs.pending_jobs().unwrap().is_empty());
    }

    #[test]
    fn failures_record_their_kind() {
        let jobs = manager();
        let id = jobs.create_job(&request()).unwrap();
        let status = jobs
            .fail_job(id, &OrchestratorError::synthesis("segment 0 failed"))
            .unwrap();
        assert_eq!(status, JobStatus::Failed);
        let job = jobs.get_job(id).unwrap().unwrap();
        assert_eq!(job.error_kind.as_deref(), Some("synthesis_error"));
    }

    #[test]
    fn only_one_transition_out_of_pending_wins() {
        let jobs = manager();
        let id = jobs.create_job(&request()).unwrap();
        assert!(jobs.cancel_job(id).unwrap());
        assert!(!jobs
            .transition_status(id, JobStatus::Pending, JobStatus::Running)
            .unwrap());
        assert_eq!(jobs.get_job(id).unwrap().unwrap().status, JobStatus::Cancelled);

        let other = jobs.create_job(&request()).unwrap();
        assert!(jobs
            .transition_status(other, JobStatus::Pending, JobStatus::Running)
            .unwrap());
        assert!(!jobs
            .transition_status(other, JobStatus::Pending, JobStatus::Running)
            .unwrap());
    }
}
