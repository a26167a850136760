/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Replay buffers and ownership records.
//!
//! `transcript:buffer:{taskId}` and `summary:buffer:{taskId}` hold the latest
//! cumulative text (TTL-bound) so a reconnecting client recovers partials it
//! missed. `task:owner:{taskId}` authorizes stream requests. Buffers are
//! written only by the task's worker and read only by the stream endpoint, so
//! no coordination beyond the store's own atomicity is needed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ReplayError;

fn transcript_key(id: Uuid) -> String {
    format!("transcript:buffer:{}", id)
}

fn summary_key(id: Uuid) -> String {
    format!("summary:buffer:{}", id)
}

fn owner_key(id: Uuid) -> String {
    format!("task:owner:{}", id)
}

/// Ephemeral keyspace for replay buffers and ownership records.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    async fn write_transcript(&self, id: Uuid, text: &str, ttl: Duration)
        -> Result<(), ReplayError>;

    async fn write_summary(&self, id: Uuid, text: &str, ttl: Duration) -> Result<(), ReplayError>;

    async fn read_transcript(&self, id: Uuid) -> Result<Option<String>, ReplayError>;

    async fn read_summary(&self, id: Uuid) -> Result<Option<String>, ReplayError>;

    /// Written at task creation; no TTL.
    async fn set_owner(&self, id: Uuid, owner: &str) -> Result<(), ReplayError>;

    async fn owner(&self, id: Uuid) -> Result<Option<String>, ReplayError>;

    /// Deletion cascade: buffers and ownership record for one task.
    async fn clear_task(&self, id: Uuid) -> Result<(), ReplayError>;
}

/// Redis-backed replay store.
#[derive(Clone)]
pub struct RedisReplayStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisReplayStore {
    pub async fn connect(redis_url: &str) -> Result<Self, ReplayError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| ReplayError::Backend(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ReplayError::Backend(e.to_string()))?;
        Ok(Self { conn })
    }

    async fn set_ex(&self, key: String, value: &str, ttl: Duration) -> Result<(), ReplayError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| ReplayError::Backend(e.to_string()))
    }

    async fn get(&self, key: String) -> Result<Option<String>, ReplayError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(&key)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| ReplayError::Backend(e.to_string()))
    }
}

#[async_trait]
impl ReplayStore for RedisReplayStore {
    async fn write_transcript(
        &self,
        id: Uuid,
        text: &str,
        ttl: Duration,
    ) -> Result<(), ReplayError> {
        self.set_ex(transcript_key(id), text, ttl).await
    }

    async fn write_summary(&self, id: Uuid, text: &str, ttl: Duration) -> Result<(), ReplayError> {
        self.set_ex(summary_key(id), text, ttl).await
    }

    async fn read_transcript(&self, id: Uuid) -> Result<Option<String>, ReplayError> {
        self.get(transcript_key(id)).await
    }

    async fn read_summary(&self, id: Uuid) -> Result<Option<String>, ReplayError> {
        self.get(summary_key(id)).await
    }

    async fn set_owner(&self, id: Uuid, owner: &str) -> Result<(), ReplayError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(owner_key(id))
            .arg(owner)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| ReplayError::Backend(e.to_string()))
    }

    async fn owner(&self, id: Uuid) -> Result<Option<String>, ReplayError> {
        self.get(owner_key(id)).await
    }

    async fn clear_task(&self, id: Uuid) -> Result<(), ReplayError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(transcript_key(id))
            .arg(summary_key(id))
            .arg(owner_key(id))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| ReplayError::Backend(e.to_string()))
    }
}

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory replay store with real TTL semantics (checked on read).
#[derive(Default)]
pub struct MemoryReplayStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryReplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&self, key: String, value: &str, ttl: Option<Duration>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key,
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(|t| Instant::now() + t),
                },
            );
    }

    fn fetch(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| at <= Instant::now()) {
                    entries.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }
}

#[async_trait]
impl ReplayStore for MemoryReplayStore {
    async fn write_transcript(
        &self,
        id: Uuid,
        text: &str,
        ttl: Duration,
    ) -> Result<(), ReplayError> {
        self.put(transcript_key(id), text, Some(ttl));
        Ok(())
    }

    async fn write_summary(&self, id: Uuid, text: &str, ttl: Duration) -> Result<(), ReplayError> {
        self.put(summary_key(id), text, Some(ttl));
        Ok(())
    }

    async fn read_transcript(&self, id: Uuid) -> Result<Option<String>, ReplayError> {
        Ok(self.fetch(&transcript_key(id)))
    }

    async fn read_summary(&self, id: Uuid) -> Result<Option<String>, ReplayError> {
        Ok(self.fetch(&summary_key(id)))
    }

    async fn set_owner(&self, id: Uuid, owner: &str) -> Result<(), ReplayError> {
        self.put(owner_key(id), owner, None);
        Ok(())
    }

    async fn owner(&self, id: Uuid) -> Result<Option<String>, ReplayError> {
        Ok(self.fetch(&owner_key(id)))
    }

    async fn clear_task(&self, id: Uuid) -> Result<(), ReplayError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&transcript_key(id));
        entries.remove(&summary_key(id));
        entries.remove(&owner_key(id));
        Ok(())
    }
}
