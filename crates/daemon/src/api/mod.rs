use axum::Router;
use std::sync::Arc;

use engine::decision::DecisionConfig;

use crate::jobs::JobManager;

pub mod jobs;

pub fn router(job_manager: Arc<JobManager>, decision_config: Arc<DecisionConfig>) -> Router {
    Router::new().nest("/jobs", jobs::router(job_manager, decision_config))
}
