//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version, tunnel placement and open tunnel count.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let tunnels = state.tunnels.len().await;
    let jobs = state.jobs.len().await;
    let cached_sessions = state.sessions.len().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "placement": state.tunnels.placement().as_str(),
        "tunnels": tunnels,
        "jobs": jobs,
        "cached_sessions": cached_sessions,
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::testing;

    #[tokio::test]
    async fn test_health_is_public() {
        let (state, _) = testing::state().await;
        let app = crate::build_router(state);

        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["tunnels"], 0);
        assert_eq!(value["jobs"], 1);
        assert_eq!(value["placement"], "in-cluster");
    }
}
