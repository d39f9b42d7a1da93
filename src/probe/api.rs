//! Probe wire API
//!
//! The narrow HTTP contract agents speak: register, heartbeat, long-poll
//! for jobs, submit results. Everything except registration authenticates
//! with `Authorization: Bearer <probe token>`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{ProbeMetrics, ProbePendingJob};

use super::service::{ProbeError, ProbeResultSubmission, ProbeService};

pub fn probe_router(service: Arc<ProbeService>) -> Router {
    Router::new()
        .route("/api/v1/probe/register", post(register))
        .route("/api/v1/probe/heartbeat", post(heartbeat))
        .route("/api/v1/probe/jobs/poll", post(poll_jobs))
        .route("/api/v1/probe/jobs/:job_id/result", post(submit_result))
        .with_state(service)
}

fn bearer_token(headers: &HeaderMap) -> Result<String, (StatusCode, String)> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "missing bearer token".to_string(),
        ))
}

fn into_response(err: ProbeError) -> (StatusCode, String) {
    match err {
        ProbeError::Unauthorized => (StatusCode::UNAUTHORIZED, err.to_string()),
        ProbeError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        ProbeError::Store(_) | ProbeError::Ingest(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    org_id: String,
    name: String,
    region: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    probe_id: String,
}

async fn register(
    State(service): State<Arc<ProbeService>>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), (StatusCode, String)> {
    let probe = service
        .register(
            &request.org_id,
            &request.name,
            &request.region,
            &request.token,
        )
        .await
        .map_err(into_response)?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { probe_id: probe.id }),
    ))
}

async fn heartbeat(
    State(service): State<Arc<ProbeService>>,
    headers: HeaderMap,
    Json(metrics): Json<ProbeMetrics>,
) -> Result<StatusCode, (StatusCode, String)> {
    let token = bearer_token(&headers)?;
    service
        .heartbeat(&token, &metrics, Utc::now())
        .await
        .map_err(into_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct PollRequest {
    #[serde(default)]
    batch_size: Option<u32>,
}

async fn poll_jobs(
    State(service): State<Arc<ProbeService>>,
    headers: HeaderMap,
    Json(request): Json<PollRequest>,
) -> Result<Json<Vec<ProbePendingJob>>, (StatusCode, String)> {
    let token = bearer_token(&headers)?;
    let jobs = service
        .poll_jobs(&token, request.batch_size, Utc::now())
        .await
        .map_err(into_response)?;
    debug!("poll handed out {} job(s)", jobs.len());
    Ok(Json(jobs))
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    check_result_id: String,
}

async fn submit_result(
    State(service): State<Arc<ProbeService>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    Json(submission): Json<ProbeResultSubmission>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    let token = bearer_token(&headers)?;
    let check_result_id = service
        .submit_result(&token, &job_id, submission)
        .await
        .map_err(into_response)?;
    Ok(Json(SubmitResponse { check_result_id }))
}
