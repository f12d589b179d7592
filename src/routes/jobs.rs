use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use crate::models::AppState;
use crate::queue::{Job, JobHandle, JobKind, JobOptions, JobPriority};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub kind: JobKind,
    pub subject_id: String,
    #[serde(default)]
    pub priority: JobPriority,
    pub delay_ms: Option<u64>,
    pub dedup_key: Option<String>,
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> AppResult<(StatusCode, ResponseJson<JobHandle>)> {
    let mut options = JobOptions::default().with_priority(request.priority);
    if let Some(ms) = request.delay_ms {
        options = options.with_delay(Duration::from_millis(ms));
    }
    if let Some(key) = request.dedup_key.filter(|k| !k.trim().is_empty()) {
        options = options.with_dedup_key(key);
    }

    let handle = state.producer.enqueue(request.kind, &request.subject_id, options).await?;
    info!(job_id = %handle.job_id, created = handle.created, "Job submitted over HTTP");

    Ok((StatusCode::ACCEPTED, Json(handle)))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<ResponseJson<Job>> {
    state
        .store
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {}", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{body_json, memory_state, state_with_store};
    use crate::testing::FlakyJobStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn post_json(body: &str) -> Request<Body> {
        Request::post("/api/jobs")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_then_fetch_job() {
        let app = router(memory_state());

        let response = app
            .clone()
            .oneshot(post_json(r#"{"kind":"trade_analysis","subjectId":"t1","priority":"high"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let handle = body_json(response).await;
        assert_eq!(handle["jobId"], "trade_analysis:t1");
        assert_eq!(handle["created"], true);

        let response = app
            .clone()
            .oneshot(Request::get("/api/jobs/trade_analysis:t1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job = body_json(response).await;
        assert_eq!(job["priority"], "high");
        assert_eq!(job["state"], "waiting");
        assert!(job.get("lock_token").is_none());

        let duplicate = app
            .oneshot(post_json(r#"{"kind":"trade_analysis","subjectId":"t1"}"#))
            .await
            .unwrap();
        assert_eq!(body_json(duplicate).await["created"], false);
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let response = router(memory_state())
            .oneshot(Request::get("/api/jobs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_store_outage_is_503() {
        let app = router(state_with_store(Arc::new(FlakyJobStore::failing_on(&[1]))));
        let response = app
            .oneshot(post_json(r#"{"kind":"weekly_insight","subjectId":"u1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_blank_subject_is_400() {
        let response = router(memory_state())
            .oneshot(post_json(r#"{"kind":"trade_analysis","subjectId":"  "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
