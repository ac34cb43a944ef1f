//! Internal API used by the job-management collaborator.
//!
//! Jobs are pushed in as descriptors; sessions are opened against a
//! registered job and returned with the URL the browser should visit.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{Error, Result};
use crate::jobs::{JobDescriptor, JobDirectory};
use crate::sessions::SessionType;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub rank: u32,
    #[serde(rename = "type")]
    pub session_type: SessionType,
}

/// What the caller hands to the browser for each access mode.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OpenSession {
    Web {
        job_id: String,
        rank: u32,
        session_id: String,
        redirect_to: String,
    },
    Vnc {
        job_id: String,
        rank: u32,
        session_id: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Shell {
        job_id: String,
        rank: u32,
        session_id: String,
        url: String,
    },
}

/// `PUT /api/jobs/{job_id}`: register or replace a job descriptor.
pub async fn put_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(mut job): Json<JobDescriptor>,
) -> Result<Response> {
    if !job.id.is_empty() && job.id != job_id {
        return Err(Error::BadRequest(format!(
            "Descriptor id {} does not match path {job_id}",
            job.id
        )));
    }
    if job.replicas == 0 {
        return Err(Error::BadRequest("replicas must be at least 1".to_string()));
    }
    if job.workload.is_empty() {
        return Err(Error::BadRequest("workload must not be empty".to_string()));
    }
    job.id = job_id;

    let body = Json(job.clone());
    let replaced = state.jobs.upsert(job).await;
    info!(job_id = %body.id, replaced, "Job registered");
    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, body).into_response())
}

/// `DELETE /api/jobs/{job_id}`: forget a job. Open tunnels die with its pods.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode> {
    state
        .jobs
        .remove(&job_id)
        .await
        .ok_or_else(|| Error::not_found(format!("Job {job_id} not found")))?;
    info!(job_id = %job_id, "Job removed");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/jobs/{job_id}/sessions`: open an interactive session.
pub async fn create_session(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<OpenSession>> {
    let job = state
        .jobs
        .find_job(&job_id)
        .await
        .ok_or_else(|| Error::not_found(format!("Job {job_id} not found")))?;
    if request.rank >= job.replicas {
        return Err(Error::BadRequest(format!(
            "Rank {} out of range, job {job_id} has {} replica(s)",
            request.rank, job.replicas
        )));
    }

    let session_id = state
        .sessions
        .store()
        .create(&job_id, request.rank, request.session_type)
        .await?;
    info!(
        job_id = %job_id,
        rank = request.rank,
        session_type = %request.session_type,
        "Session created"
    );

    let public_url = state.config.server.public_url.trim_end_matches('/');
    let rank = request.rank;
    let payload = match request.session_type {
        SessionType::Web => {
            let redirect_to = match job.resources.ingress_domains.first() {
                Some(domain) => {
                    let scheme = if public_url.starts_with("https://") {
                        "https"
                    } else {
                        "http"
                    };
                    format!("{scheme}://{domain}/")
                }
                None => format!("{public_url}/authorize-app/{session_id}"),
            };
            OpenSession::Web {
                job_id,
                rank,
                session_id,
                redirect_to,
            }
        }
        SessionType::Vnc => OpenSession::Vnc {
            url: crate::util::websocket_url(public_url, &format!("/vnc/{session_id}")),
            password: job.resources.vnc_password.clone(),
            job_id,
            rank,
            session_id,
        },
        SessionType::Shell => OpenSession::Shell {
            url: crate::util::websocket_url(public_url, "/shell"),
            job_id,
            rank,
            session_id,
        },
    };
    Ok(Json(payload))
}

/// `GET /api/tunnels`: open tunnels, for operators.
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Value> {
    let tunnels = state.tunnels.list().await;
    Json(json!({
        "placement": state.tunnels.placement().as_str(),
        "tunnels": tunnels,
    }))
}
