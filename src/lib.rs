// Trade Journal background jobs: AI analysis queue, worker pool and sweeps

pub mod analysis;
pub mod app;
pub mod config;
pub mod db;
pub mod llm;
pub mod models;
pub mod queue;
pub mod routes;
pub mod scheduler;
pub mod types;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use app::{Backend, Services};
pub use config::Config;
pub use models::AppState;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
