// Service wiring shared by the HTTP server, the worker process and the CLI

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::analysis::AnalysisExecutor;
use crate::config::Config;
use crate::db::{self, MemorySubjectRepository, PgSubjectRepository, SubjectRepository};
use crate::llm::{AnalysisProvider, LLMProviderConfig, LlmAnalysisProvider, LLM};
use crate::models::AppState;
use crate::queue::{JobEvents, JobProducer, JobStore, MemoryJobStore, PoolMetrics, RedisJobStore, WorkerPool};
use crate::scheduler::{AnalysisSweep, CleanupSweep, Scheduler, UsageSweep};
use crate::utils::{with_retry, Clock, SystemClock};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Where jobs and subjects live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Redis job store and Postgres repository.
    External,
    /// Process-local stores, for local runs and demos.
    InMemory,
}

/// Connected stores plus everything derived from configuration alone.
pub struct Services {
    pub config: Config,
    pub store: Arc<dyn JobStore>,
    pub repo: Arc<dyn SubjectRepository>,
    pub producer: JobProducer,
    pub metrics: Arc<PoolMetrics>,
    pub events: JobEvents,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub async fn connect(config: Config, backend: Backend) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let retention = config.queue.retention();

        let (store, repo): (Arc<dyn JobStore>, Arc<dyn SubjectRepository>) = match backend {
            Backend::InMemory => {
                info!("Using in-memory job store and repository");
                (
                    Arc::new(MemoryJobStore::with_retention(retention)),
                    Arc::new(MemorySubjectRepository::new()),
                )
            }
            Backend::External => {
                let url = config.redis.url.clone();
                let prefix = config.redis.prefix.clone();
                let store = with_retry(
                    move || {
                        let url = url.clone();
                        let prefix = prefix.clone();
                        Box::pin(async move { RedisJobStore::connect(&url, &prefix, retention).await })
                    },
                    CONNECT_ATTEMPTS,
                    CONNECT_BASE_DELAY,
                )
                .await
                .context("Failed to connect to Redis")?;

                let database_url = config
                    .database
                    .url
                    .clone()
                    .context("DATABASE_URL must be set unless --in-memory is used")?;
                let pool = db::create_pool(&config.database, &database_url).await?;
                info!("Running database migrations...");
                db::run_migrations(&pool).await?;
                info!("Database migrations completed");

                (Arc::new(store), Arc::new(PgSubjectRepository::new(pool)))
            }
        };

        let producer = JobProducer::new(store.clone(), config.queue.max_attempts).with_clock(clock.clone());
        let metrics = Arc::new(PoolMetrics::new(config.queue.concurrency.max(1)));

        Ok(Self {
            config,
            store,
            repo,
            producer,
            metrics,
            events: JobEvents::default(),
            clock,
        })
    }

    pub fn analysis_provider(&self) -> Result<Arc<dyn AnalysisProvider>> {
        let llm_config = &self.config.llm;
        let llm = LLM::new(LLMProviderConfig {
            name: llm_config.provider.clone(),
            api_key: llm_config.api_key.clone(),
            base_url: llm_config.base_url.clone(),
        })
        .context("LLM provider is not configured")?;

        info!(provider = llm.provider_name(), model = %llm_config.model, "Analysis provider ready");
        let provider = LlmAnalysisProvider::new(llm, llm_config.model.clone())
            .with_sampling(Some(llm_config.max_tokens), Some(llm_config.temperature));
        Ok(Arc::new(provider))
    }

    pub fn worker_pool(&self, provider: Arc<dyn AnalysisProvider>) -> WorkerPool {
        let executor = AnalysisExecutor::new(self.repo.clone(), provider, self.config.executor.executor_config())
            .with_clock(self.clock.clone());

        WorkerPool::new(self.store.clone(), Arc::new(executor), self.config.queue.pool_config())
            .with_clock(self.clock.clone())
            .with_events(self.events.clone())
            .with_metrics(self.metrics.clone())
    }

    /// Scheduler with the analysis, cleanup and usage sweeps registered but
    /// not started.
    pub fn scheduler(&self) -> Scheduler {
        let settings = &self.config.scheduler;
        let scheduler = Scheduler::new().with_clock(self.clock.clone());

        scheduler.register(
            Arc::new(AnalysisSweep::new(
                self.repo.clone(),
                self.producer.clone(),
                self.clock.clone(),
                settings.analysis_sweep(),
            )),
            Duration::from_secs(settings.analysis_interval_secs.max(1)),
        );
        scheduler.register(
            Arc::new(CleanupSweep::new(
                self.repo.clone(),
                self.clock.clone(),
                Duration::from_secs(settings.cleanup_max_age_days * 24 * 60 * 60),
            )),
            Duration::from_secs(settings.cleanup_interval_secs.max(1)),
        );
        scheduler.register(
            Arc::new(UsageSweep::new(self.repo.clone(), self.clock.clone())),
            Duration::from_secs(settings.usage_interval_secs.max(1)),
        );

        scheduler
    }

    pub fn app_state(&self, scheduler: Arc<Scheduler>) -> AppState {
        AppState {
            producer: self.producer.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            scheduler,
            clock: self.clock.clone(),
        }
    }
}
