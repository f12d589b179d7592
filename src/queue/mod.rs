// Background job queue: storage, producer and worker pool

pub mod events;
pub mod jobs;
pub mod memory;
pub mod metrics;
pub mod producer;
pub mod rate_limiter;
pub mod redis_store;
pub mod store;
pub mod workers;

pub use events::{JobEvent, JobEvents};
pub use jobs::{Job, JobHandle, JobKind, JobOptions, JobPriority, JobState, DEFAULT_MAX_ATTEMPTS};
pub use memory::MemoryJobStore;
pub use metrics::{PoolMetrics, PoolStats};
pub use producer::{JobProducer, ProducerError};
pub use redis_store::RedisJobStore;
pub use store::{JobStore, RetentionPolicy, StateCounts, StoreError};
pub use workers::{Disposition, JobFailure, JobHandler, PoolHandle, WorkerPool, WorkerPoolConfig};
