use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{sse::Event, Json, Sse},
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use engine::decision::{decide, DecisionConfig};
use engine::timeline::TierAttemptResult;

use crate::jobs::{JobManager, JobRequest};
use crate::orchestrator::{JobReport, JobStage};

type ApiState = (Arc<JobManager>, Arc<DecisionConfig>);

#[derive(Serialize)]
pub struct CreateJobResponse {
    job_id: i64,
    clip_count: usize,
    target_duration_ticks: i64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    kind: &'static str,
    error: String,
}

#[derive(Serialize)]
pub struct JobResponse {
    id: i64,
    status: String,
    stage: Option<JobStage>,
    mission: String,
    report: Option<JobReport>,
    publishable: Option<bool>,
    error: Option<String>,
    error_kind: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Serialize)]
pub struct CancelResponse {
    cancelled: bool,
}

pub fn router(job_manager: Arc<JobManager>, decision_config: Arc<DecisionConfig>) -> Router {
    Router::new()
        .route("/", post(create_job))
        .route("/:id", get(get_job))
        .route("/:id/attempts", get(get_attempts))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/events", get(events))
        .with_state((job_manager, decision_config))
}

/// POST /jobs - parameters are validated before the job is queued.
async fn create_job(
    State((job_manager, decision_config)): State<ApiState>,
    Json(request): Json<JobRequest>,
) -> Result<Json<CreateJobResponse>, (StatusCode, Json<ErrorResponse>)> {
    let decision = decide(&request.params, &decision_config).map_err(|e| {
        let status = if e.is_rejection() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (
            status,
            Json(ErrorResponse {
                kind: e.kind(),
                error: e.to_string(),
            }),
        )
    })?;

    let job_id = job_manager.create_job(&request).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                kind: "internal",
                error: e.to_string(),
            }),
        )
    })?;
    info!("[Jobs] queued job {} ({} clips)", job_id, decision.clip_count);

    Ok(Json(CreateJobResponse {
        job_id,
        clip_count: decision.clip_count,
        target_duration_ticks: decision.target_duration_ticks,
    }))
}

async fn get_job(
    State((job_manager, _)): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<JobResponse>, StatusCode> {
    let job = job_manager
        .get_job(id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(JobResponse {
        id: job.id,
        status: format!("{:?}", job.status),
        stage: job.stage,
        mission: job.request.mission,
        publishable: job.report.as_ref().map(|r| r.is_publishable()),
        report: job.report,
        error: job.error,
        error_kind: job.error_kind,
        created_at: job.created_at.to_rfc3339(),
        updated_at: job.updated_at.to_rfc3339(),
    }))
}

async fn get_attempts(
    State((job_manager, _)): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<TierAttemptResult>>, StatusCode> {
    job_manager
        .get_job(id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let attempts = job_manager
        .db()
        .list_attempts(id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(attempts))
}

async fn cancel_job(
    State((job_manager, _)): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<CancelResponse>, StatusCode> {
    job_manager
        .get_job(id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let cancelled = job_manager
        .cancel_job(id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(CancelResponse { cancelled }))
}

/// GET /jobs/:id/events - server-sent job events for one job
async fn events(
    State((job_manager, _)): State<ApiState>,
    Path(job_id): Path<i64>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = job_manager.subscribe();

    let event_stream = stream::unfold((rx, job_id), |(mut rx, job_id)| async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.job_id() == job_id => {
                    let json = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                    return Some((Ok(Event::default().data(json)), (rx, job_id)));
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    });

    let keep_alive = stream::unfold((), |_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Some((Ok(Event::default().comment("keep-alive")), ()))
    });

    let combined = stream::select(event_stream, keep_alive);

    Sse::new(combined).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive-text"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<JobManager>) {
        let jobs = Arc::new(JobManager::new(Arc::new(Database::open_in_memory().unwrap())));
        (router(jobs.clone(), Arc::new(DecisionConfig::default())), jobs)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn valid_submission_is_queued() {
        let (app, jobs) = app();
        let response = app
            .oneshot(post_json(
                "/",
                serde_json::json!({"mission": "Explain tides", "target_duration": 30.0, "platform": "tiktok"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["clip_count"], 3);
        let id = body["job_id"].as_i64().unwrap();
        assert_eq!(jobs.pending_jobs().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn out_of_bounds_duration_is_rejected_before_queueing() {
        let (app, jobs) = app();
        let response = app
            .oneshot(post_json(
                "/",
                serde_json::json!({"mission": "x", "target_duration": 1.0, "platform": "tiktok"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "invalid_duration");
        assert!(jobs.pending_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pending_job_can_be_cancelled() {
        let (app, jobs) = app();
        let id = jobs
            .create_job(&serde_json::from_value(serde_json::json!({
                "mission": "m", "target_duration": 20.0, "platform": "youtube_shorts"
            })).unwrap())
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json(&format!("/{}/cancel", id), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["cancelled"], true);

        let response = app
            .oneshot(Request::builder().uri(format!("/{}", id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "Cancelled");
    }
}
