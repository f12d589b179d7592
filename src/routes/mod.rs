//! HTTP surface
//!
//! - `/api/health` - liveness and job store reachability
//! - `/api/jobs` - submit a job, look one up by id
//! - `/api/queue/stats` - queue depth and worker pool counters
//! - `/api/scheduler` - sweep status and manual triggers

pub mod health;
pub mod jobs;
pub mod queue;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::models::AppState;

pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    Router::new()
        .merge(health::router(state.clone()))
        .merge(jobs::router(state.clone()))
        .merge(queue::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::models::AppState;
    use crate::queue::{JobProducer, JobStore, MemoryJobStore, PoolMetrics};
    use crate::scheduler::Scheduler;
    use crate::utils::SystemClock;

    pub fn state_with_store(store: Arc<dyn JobStore>) -> AppState {
        AppState {
            producer: JobProducer::new(store.clone(), 3),
            store,
            metrics: Arc::new(PoolMetrics::new(2)),
            scheduler: Arc::new(Scheduler::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn memory_state() -> AppState {
        state_with_store(Arc::new(MemoryJobStore::new()))
    }

    pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
