use axum::{
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::models::AppState;
use crate::queue::{PoolStats, StateCounts};
use crate::scheduler::{SchedulerError, SweepReport, SweepStatus};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/scheduler", get(scheduler_status))
        .route("/api/scheduler/{name}/run", post(run_sweep))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub jobs: StateCounts,
    pub pool: PoolStats,
}

async fn queue_stats(State(state): State<AppState>) -> AppResult<ResponseJson<QueueStats>> {
    let jobs = state.store.counts(state.clock.now()).await?;
    Ok(Json(QueueStats {
        jobs,
        pool: state.metrics.snapshot(),
    }))
}

async fn scheduler_status(State(state): State<AppState>) -> ResponseJson<Vec<SweepStatus>> {
    Json(state.scheduler.status())
}

async fn run_sweep(State(state): State<AppState>, Path(name): Path<String>) -> AppResult<ResponseJson<SweepReport>> {
    match state.scheduler.run_now(&name).await {
        Ok(report) => Ok(Json(report)),
        Err(SchedulerError::UnknownSweep(name)) => Err(AppError::NotFound(format!("sweep {}", name))),
        Err(e) => Err(AppError::Internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobKind, JobOptions};
    use crate::routes::test_support::{body_json, memory_state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_stats_reflect_queue_depth() {
        let state = memory_state();
        state
            .producer
            .enqueue(JobKind::TradeAnalysis, "t1", JobOptions::default())
            .await
            .unwrap();
        state
            .producer
            .enqueue(
                JobKind::TradeAnalysis,
                "t2",
                JobOptions::default().with_delay(std::time::Duration::from_secs(600)),
            )
            .await
            .unwrap();

        let response = router(state)
            .oneshot(Request::get("/api/queue/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["jobs"]["waiting"], 1);
        assert_eq!(body["jobs"]["delayed"], 1);
        assert_eq!(body["pool"]["concurrency"], 2);
    }

    #[tokio::test]
    async fn test_unknown_sweep_is_404() {
        let response = router(memory_state())
            .oneshot(Request::post("/api/scheduler/bogus/run").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_scheduler_status_lists_sweeps() {
        let response = router(memory_state())
            .oneshot(Request::get("/api/scheduler").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }
}
