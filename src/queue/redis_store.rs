//! Redis-backed job store.
//!
//! Layout under a configurable prefix `{p}`:
//!
//! ```text
//! {p}:job:{id}            HASH  job record (state, attempts, timestamps as epoch ms)
//! {p}:seq                 STR   enqueue counter, FIFO tiebreak
//! {p}:waiting             ZSET  due jobs, score = rank * 1e15 + seq
//! {p}:delayed             ZSET  delayed jobs, score = delay_until ms
//! {p}:active              ZSET  claimed jobs, score = claimed_at ms
//! {p}:completed:{kind}    ZSET  finished jobs, score = finished_at ms
//! {p}:failed:{kind}       ZSET
//! ```
//!
//! Every state transition is a Lua script, so a claim and its bookkeeping are
//! atomic and two workers can never hold the same job.
//!
//! The claim and reclaim scripts reach job hashes by id, which cannot be
//! declared as `KEYS` up front. The store therefore needs a single Redis node,
//! or on Redis Cluster a hash-tagged prefix such as `{tj:queue}` so every key
//! lands in one slot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use tracing::info;

use crate::queue::jobs::{Job, JobKind, JobState, NewJob};
use crate::queue::store::{
    EnqueueOutcome, JobStore, RetentionPolicy, StallReport, StateCounts, StoreError, StoreResult,
    STALLED_ERROR,
};
use crate::utils::from_millis;

const ENQUEUE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state == 'waiting' or state == 'active' then
  return 0
end
local seq = redis.call('INCR', KEYS[4])
local score = string.format('%.0f', tonumber(ARGV[5]) * 1e15 + seq)
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[5], ARGV[1])
redis.call('ZREM', KEYS[6], ARGV[1])
redis.call('HSET', KEYS[1],
  'id', ARGV[1], 'kind', ARGV[2], 'subject_id', ARGV[3], 'priority', ARGV[4],
  'state', 'waiting', 'attempts', '0', 'max_attempts', ARGV[6],
  'enqueued_at', ARGV[7], 'seq', tostring(seq), 'score', score)
if ARGV[8] ~= '' then
  redis.call('HSET', KEYS[1], 'delay_until', ARGV[8])
  redis.call('ZADD', KEYS[3], ARGV[8], ARGV[1])
else
  redis.call('ZADD', KEYS[2], score, ARGV[1])
end
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local score = redis.call('HGET', ARGV[1] .. ':job:' .. id, 'score')
  if score then
    redis.call('ZADD', KEYS[1], score, id)
  end
end
while true do
  local popped = redis.call('ZPOPMIN', KEYS[1])
  if #popped == 0 then
    return false
  end
  local id = popped[1]
  local job = ARGV[1] .. ':job:' .. id
  if redis.call('EXISTS', job) == 1 then
    redis.call('HINCRBY', job, 'attempts', 1)
    redis.call('HSET', job, 'state', 'active', 'claimed_at', ARGV[2], 'lock_token', ARGV[3])
    redis.call('HDEL', job, 'delay_until')
    redis.call('ZADD', KEYS[3], ARGV[2], id)
    return id
  end
end
"#;

const FINISH_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' or redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], 'state', ARGV[3], 'finished_at', ARGV[4])
redis.call('HDEL', KEYS[1], 'lock_token')
if ARGV[5] ~= '' then
  redis.call('HSET', KEYS[1], 'last_error', ARGV[5])
end
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
local overflow = redis.call('ZCARD', KEYS[3]) - tonumber(ARGV[6])
if overflow > 0 then
  local stale = redis.call('ZRANGE', KEYS[3], 0, overflow - 1)
  for _, old in ipairs(stale) do
    redis.call('DEL', ARGV[7] .. ':job:' .. old)
  end
  redis.call('ZREMRANGEBYRANK', KEYS[3], 0, overflow - 1)
end
return 1
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' or redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], 'state', 'waiting', 'delay_until', ARGV[3], 'last_error', ARGV[4])
redis.call('HDEL', KEYS[1], 'lock_token')
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

const DISCARD_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' or redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('DEL', KEYS[1])
return 1
"#;

const RECLAIM_SCRIPT: &str = r#"
local stalled = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[2])
local out = {}
for _, id in ipairs(stalled) do
  redis.call('ZREM', KEYS[1], id)
  local job = ARGV[1] .. ':job:' .. id
  if redis.call('EXISTS', job) == 1 then
    local attempts = tonumber(redis.call('HGET', job, 'attempts') or '0')
    local max = tonumber(redis.call('HGET', job, 'max_attempts') or '1')
    redis.call('HDEL', job, 'lock_token')
    redis.call('HSET', job, 'last_error', ARGV[4])
    if attempts >= max then
      redis.call('HSET', job, 'state', 'failed', 'finished_at', ARGV[3])
      local fields = redis.call('HGETALL', job)
      local snapshot = {}
      for i = 1, #fields, 2 do
        snapshot[fields[i]] = fields[i + 1]
      end
      table.insert(out, 'failed:' .. cjson.encode(snapshot))
      local failed = ARGV[1] .. ':failed:' .. snapshot['kind']
      redis.call('ZADD', failed, ARGV[3], id)
      local overflow = redis.call('ZCARD', failed) - tonumber(ARGV[5])
      if overflow > 0 then
        local stale = redis.call('ZRANGE', failed, 0, overflow - 1)
        for _, old in ipairs(stale) do
          redis.call('DEL', ARGV[1] .. ':job:' .. old)
        end
        redis.call('ZREMRANGEBYRANK', failed, 0, overflow - 1)
      end
    else
      redis.call('HSET', job, 'state', 'waiting')
      redis.call('ZADD', KEYS[2], redis.call('HGET', job, 'score'), id)
      table.insert(out, 'requeued:' .. id)
    end
  end
end
return out
"#;

pub const DEFAULT_PREFIX: &str = "tj:queue";

/// Key names under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeySpace {
    prefix: String,
}

impl KeySpace {
    fn new(prefix: &str) -> Self {
        Self { prefix: prefix.trim_end_matches(':').to_string() }
    }

    fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn set(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn finished(&self, state: JobState, kind: JobKind) -> String {
        format!("{}:{}:{}", self.prefix, state.as_str(), kind.as_str())
    }
}

pub struct RedisJobStore {
    conn: ConnectionManager,
    keys: KeySpace,
    retention: RetentionPolicy,
    enqueue_script: Script,
    claim_script: Script,
    finish_script: Script,
    retry_script: Script,
    discard_script: Script,
    reclaim_script: Script,
}

impl RedisJobStore {
    pub async fn connect(url: &str, prefix: &str, retention: RetentionPolicy) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(prefix, "Connected to Redis job store");
        Ok(Self::with_connection(conn, prefix, retention))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: &str, retention: RetentionPolicy) -> Self {
        Self {
            conn,
            keys: KeySpace::new(prefix),
            retention,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            finish_script: Script::new(FINISH_SCRIPT),
            retry_script: Script::new(RETRY_SCRIPT),
            discard_script: Script::new(DISCARD_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
        }
    }

    fn job_key(&self, id: &str) -> String {
        self.keys.job(id)
    }

    fn set_key(&self, name: &str) -> String {
        self.keys.set(name)
    }

    fn finished_key(&self, state: JobState, kind: JobKind) -> String {
        self.keys.finished(state, kind)
    }

    async fn load(&self, id: &str) -> StoreResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(id, &fields).map(Some)
    }

    async fn load_many(&self, ids: &[String]) -> StoreResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hgetall(self.job_key(id));
        }
        let mut conn = self.conn.clone();
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (id, fields) in ids.iter().zip(rows.iter()) {
            if !fields.is_empty() {
                jobs.push(job_from_fields(id, fields)?);
            }
        }
        Ok(jobs)
    }

    async fn finish(
        &self,
        job_id: &str,
        lock_token: &str,
        state: JobState,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let Some(job) = self.load(job_id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .finish_script
            .key(self.job_key(job_id))
            .key(self.set_key("active"))
            .key(self.finished_key(state, job.kind))
            .arg(job_id)
            .arg(lock_token)
            .arg(state.as_str())
            .arg(now.timestamp_millis())
            .arg(error)
            .arg(self.retention.keep(state))
            .arg(&self.keys.prefix)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, new: NewJob) -> StoreResult<EnqueueOutcome> {
        let mut conn = self.conn.clone();
        let delay_until = new
            .delay_until
            .map(|at| at.timestamp_millis().to_string())
            .unwrap_or_default();

        let created: i64 = self
            .enqueue_script
            .key(self.job_key(&new.id))
            .key(self.set_key("waiting"))
            .key(self.set_key("delayed"))
            .key(self.set_key("seq"))
            .key(self.finished_key(JobState::Completed, new.kind))
            .key(self.finished_key(JobState::Failed, new.kind))
            .arg(&new.id)
            .arg(new.kind.as_str())
            .arg(&new.subject_id)
            .arg(new.priority.as_str())
            .arg(new.priority.rank() as i64)
            .arg(new.max_attempts)
            .arg(new.enqueued_at.timestamp_millis())
            .arg(delay_until)
            .invoke_async(&mut conn)
            .await?;

        let job = self.load(&new.id).await?.ok_or_else(|| StoreError::Corrupt {
            id: new.id.clone(),
            reason: "job vanished right after enqueue".to_string(),
        })?;
        Ok(EnqueueOutcome { job, created: created == 1 })
    }

    async fn claim(&self, now: DateTime<Utc>, lock_token: &str) -> StoreResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = self
            .claim_script
            .key(self.set_key("waiting"))
            .key(self.set_key("delayed"))
            .key(self.set_key("active"))
            .arg(&self.keys.prefix)
            .arg(now.timestamp_millis())
            .arg(lock_token)
            .invoke_async(&mut conn)
            .await?;

        match claimed {
            Some(id) => self.load(&id).await,
            None => Ok(None),
        }
    }

    async fn complete(&self, job_id: &str, lock_token: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.finish(job_id, lock_token, JobState::Completed, "", now).await
    }

    async fn retry(
        &self,
        job_id: &str,
        lock_token: &str,
        delay_until: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .retry_script
            .key(self.job_key(job_id))
            .key(self.set_key("active"))
            .key(self.set_key("delayed"))
            .arg(job_id)
            .arg(lock_token)
            .arg(delay_until.timestamp_millis())
            .arg(error)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn fail(&self, job_id: &str, lock_token: &str, error: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.finish(job_id, lock_token, JobState::Failed, error, now).await
    }

    async fn discard(&self, job_id: &str, lock_token: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .discard_script
            .key(self.job_key(job_id))
            .key(self.set_key("active"))
            .arg(job_id)
            .arg(lock_token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn reclaim_stalled(&self, active_before: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<StallReport> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = self
            .reclaim_script
            .key(self.set_key("active"))
            .key(self.set_key("waiting"))
            .arg(&self.keys.prefix)
            .arg(active_before.timestamp_millis())
            .arg(now.timestamp_millis())
            .arg(STALLED_ERROR)
            .arg(self.retention.failed_per_kind)
            .invoke_async(&mut conn)
            .await?;
        parse_stall_entries(entries)
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<Job>> {
        self.load(job_id).await
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> StoreResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = limit as isize - 1;
        let mut conn = self.conn.clone();

        let ids: Vec<String> = match state {
            JobState::Waiting => {
                let mut ids: Vec<String> = conn.zrange(self.set_key("waiting"), 0, stop).await?;
                if ids.len() < limit {
                    let delayed: Vec<String> = conn
                        .zrange(self.set_key("delayed"), 0, (limit - ids.len()) as isize - 1)
                        .await?;
                    ids.extend(delayed);
                }
                ids
            }
            JobState::Active => conn.zrange(self.set_key("active"), 0, stop).await?,
            JobState::Completed | JobState::Failed => {
                let mut ids = Vec::new();
                for kind in JobKind::ALL {
                    let newest: Vec<String> = conn.zrevrange(self.finished_key(state, kind), 0, stop).await?;
                    ids.extend(newest);
                }
                ids
            }
        };

        let mut jobs = self.load_many(&ids).await?;
        if state.is_terminal() {
            jobs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        }
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn counts(&self, now: DateTime<Utc>) -> StoreResult<StateCounts> {
        let mut pipe = redis::pipe();
        pipe.zcard(self.set_key("waiting"))
            .zcount(self.set_key("delayed"), "-inf", now.timestamp_millis())
            .zcount(self.set_key("delayed"), format!("({}", now.timestamp_millis()), "+inf")
            .zcard(self.set_key("active"));
        for kind in JobKind::ALL {
            pipe.zcard(self.finished_key(JobState::Completed, kind));
        }
        for kind in JobKind::ALL {
            pipe.zcard(self.finished_key(JobState::Failed, kind));
        }

        let mut conn = self.conn.clone();
        let values: Vec<u64> = pipe.query_async(&mut conn).await?;
        if values.len() != 4 + 2 * JobKind::ALL.len() {
            return Err(StoreError::Unavailable(format!(
                "unexpected reply length {} for queue counts",
                values.len()
            )));
        }

        let kinds = JobKind::ALL.len();
        Ok(StateCounts {
            waiting: values[0] + values[1],
            delayed: values[2],
            active: values[3],
            completed: values[4..4 + kinds].iter().sum(),
            failed: values[4 + kinds..].iter().sum(),
        })
    }
}

fn parse_stall_entries(entries: Vec<String>) -> StoreResult<StallReport> {
    let mut report = StallReport::default();
    for entry in entries {
        match entry.split_once(':') {
            Some(("failed", snapshot)) => {
                let fields: HashMap<String, String> =
                    serde_json::from_str(snapshot).map_err(|e| StoreError::Corrupt {
                        id: "<stalled>".to_string(),
                        reason: format!("bad job snapshot: {}", e),
                    })?;
                let id = fields.get("id").cloned().unwrap_or_default();
                report.failed.push(job_from_fields(&id, &fields)?);
            }
            Some(("requeued", id)) => report.requeued.push(id.to_string()),
            _ => {}
        }
    }
    Ok(report)
}

fn job_from_fields(id: &str, fields: &HashMap<String, String>) -> StoreResult<Job> {
    let corrupt = |reason: String| StoreError::Corrupt { id: id.to_string(), reason };

    let text = |name: &str| -> StoreResult<&str> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| corrupt(format!("missing field `{}`", name)))
    };
    let number = |name: &str| -> StoreResult<i64> {
        text(name)?
            .parse::<i64>()
            .map_err(|e| corrupt(format!("field `{}`: {}", name, e)))
    };
    let timestamp = |name: &str| -> StoreResult<Option<DateTime<Utc>>> {
        match fields.get(name).filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .parse::<i64>()
                .map(|ms| Some(from_millis(ms)))
                .map_err(|e| corrupt(format!("field `{}`: {}", name, e))),
            None => Ok(None),
        }
    };

    Ok(Job {
        id: text("id")?.to_string(),
        kind: text("kind")?.parse().map_err(|e| corrupt(format!("{}", e)))?,
        subject_id: text("subject_id")?.to_string(),
        priority: text("priority")?.parse().map_err(|e| corrupt(format!("{}", e)))?,
        state: text("state")?.parse().map_err(|e| corrupt(format!("{}", e)))?,
        attempts: number("attempts")? as u32,
        max_attempts: number("max_attempts")? as u32,
        seq: number("seq")? as u64,
        enqueued_at: from_millis(number("enqueued_at")?),
        delay_until: timestamp("delay_until")?,
        claimed_at: timestamp("claimed_at")?,
        finished_at: timestamp("finished_at")?,
        last_error: fields.get("last_error").cloned(),
        lock_token: fields.get("lock_token").cloned(),
    })
}
