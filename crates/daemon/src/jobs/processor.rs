use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::generation::AttemptLog;
use crate::jobs::{JobManager, JobStatus};
use crate::orchestrator::{JobReport, JobStage, Orchestrator};

pub struct JobProcessor {
    job_manager: Arc<JobManager>,
    orchestrator: Arc<Orchestrator>,
}

impl JobProcessor {
    pub fn new(job_manager: Arc<JobManager>, orchestrator: Arc<Orchestrator>) -> Self {
        JobProcessor {
            job_manager,
            orchestrator,
        }
    }

    /// Run one job to a terminal status. Orchestration failures are recorded
    /// on the job; only registry errors are returned.
    pub async fn process_job(&self, job_id: i64) -> Result<Option<JobReport>> {
        let job = self
            .job_manager
            .get_job(job_id)?
            .ok_or_else(|| anyhow::anyhow!("Job {} not found", job_id))?;
        // Registered before the claim so a concurrent cancel can trip it.
        let cancel = self.job_manager.register_cancel_token(job_id);
        let claimed = match self
            .job_manager
            .transition_status(job_id, JobStatus::Pending, JobStatus::Running)
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.job_manager.release_cancel_token(job_id);
                return Err(e);
            }
        };
        if !claimed {
            self.job_manager.release_cancel_token(job_id);
            return Ok(None);
        }

        let recorder = self.job_manager.clone();
        let log = Arc::new(AttemptLog::with_observer(move |attempt| {
            if let Err(e) = recorder.record_attempt(job_id, attempt) {
                error!("[Jobs] job {} failed to persist attempt: {:?}", job_id, e);
            }
        }));
        let stages = self.job_manager.clone();
        let observer = move |stage: JobStage| {
            if let Err(e) = stages.set_stage(job_id, stage) {
                warn!("[Jobs] job {} failed to record stage {}: {:?}", job_id, stage, e);
            }
        };

        info!("[Jobs] job {} started", job_id);
        let outcome = self
            .orchestrator
            .run(job_id, &job.request.mission, &job.request.params, &cancel, log, &observer)
            .await;
        self.job_manager.release_cancel_token(job_id);

        match outcome {
            Ok(report) => {
                let status = self.job_manager.complete_job(job_id, &report)?;
                info!("[Jobs] job {} finished as {:?}", job_id, status);
                Ok(Some(report))
            }
            Err(e) => {
                let status = self.job_manager.fail_job(job_id, &e)?;
                warn!("[Jobs] job {} ended as {:?}: {}", job_id, status, e);
                Ok(None)
            }
        }
    }

    pub async fn run(&self) {
        loop {
            let pending = match self.job_manager.pending_jobs() {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!("[Jobs] error listing pending jobs: {:?}", e);
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for job_id in pending {
                if let Err(e) = self.process_job(job_id).await {
                    error!("[Jobs] error processing job {}: {:?}", job_id, e);
                    let _ = self.job_manager.update_job_status(job_id, JobStatus::Failed);
                }
            }

            sleep(Duration::from_secs(1)).await;
        }
    }
}
