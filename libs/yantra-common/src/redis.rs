use crate::error::StoreResult;
use crate::leases::{Lease, LeaseRegistry};
use crate::queue::JobQueue;
use crate::store::StateStore;
use crate::text;
use crate::types::{Compiler, Job, JobKind, Submission};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Redis key semantics - shared by producers, workers and the CLI so the
/// key layout never drifts between them.

pub const QUEUE_PREFIX: &str = "yantra:queue";
pub const COMPILER_PREFIX: &str = "yantra:compiler";
pub const SUBMISSION_PREFIX: &str = "yantra:submission";
pub const LEASE_PREFIX: &str = "yantra:lease";

/// Set of every known compiler id
pub const COMPILER_INDEX: &str = "yantra:compilers";
/// Set of submission ids not yet in a terminal state
pub const ACTIVE_SUBMISSION_INDEX: &str = "yantra:submissions:active";

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Generate deterministic queue name for a job kind
pub fn queue_name(kind: JobKind) -> String {
    format!("{}:{}", QUEUE_PREFIX, kind)
}

pub fn compiler_key(id: &str) -> String {
    format!("{}:{}", COMPILER_PREFIX, id)
}

pub fn submission_key(id: &Uuid) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

pub fn lease_key(key: &str) -> String {
    format!("{}:{}", LEASE_PREFIX, key)
}

pub async fn connect(redis_url: &str) -> StoreResult<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// Two Redis lists, one per job kind. RPUSH + BLPOP gives FIFO per lane.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn push(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(job)?;
        conn.rpush::<_, _, ()>(queue_name(job.kind()), payload).await?;
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> StoreResult<Option<Job>> {
        let mut conn = self.conn.clone();
        // BLPOP checks keys in order, so builds drain first
        let lanes = vec![queue_name(JobKind::Build), queue_name(JobKind::Execution)];
        let result: Option<(String, String)> = conn.blpop(lanes, timeout.as_secs_f64()).await?;

        match result {
            Some((lane, payload)) => match serde_json::from_str::<Job>(&payload) {
                Ok(job) => Ok(Some(job)),
                Err(e) => {
                    // A malformed payload can never succeed; drop it instead of looping on it
                    warn!(queue = %lane, error = %e, payload = %payload, "Discarding unparseable job");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

/// Compiler and submission records stored as JSON documents
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get_compiler(&self, id: &str) -> StoreResult<Option<Compiler>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(compiler_key(id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn put_compiler(&self, compiler: &Compiler) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(compiler)?;
        redis::pipe()
            .atomic()
            .set(compiler_key(&compiler.id), payload)
            .ignore()
            .sadd(COMPILER_INDEX, &compiler.id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_compiler(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(compiler_key(id))
            .ignore()
            .srem(COMPILER_INDEX, id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_compilers(&self) -> StoreResult<Vec<Compiler>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(COMPILER_INDEX).await?;
        let mut compilers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(compiler) = self.get_compiler(&id).await? {
                compilers.push(compiler);
            }
        }
        Ok(compilers)
    }

    async fn append_build_logs(&self, id: &str, chunk: &str, limit: usize) -> StoreResult<()> {
        // Read-modify-write is safe: only the lease-holding build manager writes
        // a compiler while it is building.
        if let Some(mut compiler) = self.get_compiler(id).await? {
            text::append_bounded(&mut compiler.build_logs, chunk, limit);
            compiler.updated_at = Utc::now();
            self.put_compiler(&compiler).await?;
        }
        Ok(())
    }

    async fn get_submission(&self, id: &Uuid) -> StoreResult<Option<Submission>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(submission_key(id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn put_submission(&self, submission: &Submission) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(submission)?;
        let id = submission.job_id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(submission_key(&submission.job_id), payload)
            .ignore();
        if submission.status.is_terminal() {
            pipe.srem(ACTIVE_SUBMISSION_INDEX, &id).ignore();
        } else {
            pipe.sadd(ACTIVE_SUBMISSION_INDEX, &id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn list_active_submissions(&self) -> StoreResult<Vec<Submission>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(ACTIVE_SUBMISSION_INDEX).await?;
        let mut submissions = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(uuid) = Uuid::parse_str(&id) else {
                warn!(id = %id, "Ignoring malformed submission id in active index");
                continue;
            };
            if let Some(submission) = self.get_submission(&uuid).await? {
                if !submission.status.is_terminal() {
                    submissions.push(submission);
                }
            }
        }
        Ok(submissions)
    }
}

/// Leases backed by `SET NX PX`; expiry covers holders that die mid-job
#[derive(Clone)]
pub struct RedisLeases {
    conn: ConnectionManager,
}

impl RedisLeases {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LeaseRegistry for RedisLeases {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<Lease>> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(lease_key(key))
            .arg(token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(claimed.map(|_| Lease {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(lease_key(&lease.key))
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_held(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(lease_key(key)).await?)
    }
}
