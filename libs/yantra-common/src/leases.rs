//! Keyed mutual exclusion with expiring leases.
//!
//! A lease maps a key (e.g. `build:python-3.11`) to an acquisition token. The
//! holder releases it on completion; if the holder dies, the lease expires
//! after its TTL and the reaper may reclaim the work.

use crate::error::StoreResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: Uuid,
}

pub fn build_lease_key(compiler_id: &str) -> String {
    format!("build:{}", compiler_id)
}

pub fn execution_lease_key(submission_id: &Uuid) -> String {
    format!("exec:{}", submission_id)
}

#[async_trait]
pub trait LeaseRegistry: Send + Sync {
    /// Claim `key` for `ttl`. Returns `None` while another holder owns it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<Lease>>;

    /// Release only if the token still matches; a stale holder never frees
    /// someone else's lease.
    async fn release(&self, lease: &Lease) -> StoreResult<()>;

    async fn is_held(&self, key: &str) -> StoreResult<bool>;
}

#[derive(Default)]
pub struct MemoryLeases {
    entries: Mutex<HashMap<String, (Uuid, Instant)>>,
}

impl MemoryLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held and not expired
    pub fn held_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|(_, (_, expires))| *expires > now)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[async_trait]
impl LeaseRegistry for MemoryLeases {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<Lease>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4();
        entries.insert(key.to_string(), (token, now + ttl));
        Ok(Some(Lease {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(entries.get(&lease.key), Some((token, _)) if *token == lease.token) {
            entries.remove(&lease.key);
        }
        Ok(())
    }

    async fn is_held(&self, key: &str) -> StoreResult<bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(matches!(entries.get(key), Some((_, expires)) if *expires > Instant::now()))
    }
}
