//! Error taxonomy shared by every component.
//!
//! Handlers return [`Error`] directly; [`IntoResponse`] renders it as a JSON
//! body `{"error": "...", "code": "..."}` with the matching status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown session, job or pod. Also used for shell protocol violations.
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    /// The cluster API could not be reached or answered with an error.
    #[error("cluster API error: {0}")]
    Cluster(String),
    /// The port-forward subprocess could not be started or never became ready.
    #[error("failed to start port forward: {0}")]
    Spawn(String),
    #[error("no free local port after {attempts} attempts")]
    PortsExhausted { attempts: u32 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn forbidden() -> Self {
        Self::Forbidden("Forbidden".to_string())
    }

    /// Stable machine-readable code, sent alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Cluster(_) => "CLUSTER_ERROR",
            Self::Spawn(_) => "SPAWN_FAILED",
            Self::PortsExhausted { .. } => "PORTS_EXHAUSTED",
            Self::Io(_) => "IO_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Cluster(_) | Self::Spawn(_) => StatusCode::BAD_GATEWAY,
            Self::PortsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Cluster(e.to_string())
    }
}
