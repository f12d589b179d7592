use axum::{extract::State, response::Json as ResponseJson, routing::get, Json, Router};
use tracing::warn;

use crate::models::{AppState, HealthResponse};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> ResponseJson<HealthResponse> {
    let now = state.clock.now();
    let store = match state.store.counts(now).await {
        Ok(_) => "connected",
        Err(e) => {
            warn!(error = %e, "Health check could not reach job store");
            "unavailable"
        }
    };

    Json(HealthResponse {
        status: if store == "connected" { "ok" } else { "degraded" }.to_string(),
        timestamp: now.to_rfc3339(),
        store: store.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{body_json, memory_state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_reports_store() {
        let response = router(memory_state())
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "connected");
    }
}
