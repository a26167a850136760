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

//! In-memory store for tests and local development.
//!
//! Implements the same contracts as the PostgreSQL store, including the
//! conditional-update refusal semantics. The single mutex stands in for the
//! database's serialization of state transitions; `claim_batch` holds it
//! across the handler awaits, mirroring row locks held for the duration of
//! the claiming transaction.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    OutboxEvent, OutboxKind, OutboxStatus, Task, TaskConfig, TaskMessage, TaskResult, TaskStatus,
};

use super::{OutboxHandler, OutboxStore, TaskStore};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    results: HashMap<Uuid, TaskResult>,
    outbox: Vec<OutboxEvent>,
}

impl Inner {
    fn push_outbox(&mut self, aggregate_id: Uuid, kind: OutboxKind, message: &TaskMessage) {
        self.outbox.push(OutboxEvent {
            id: Uuid::new_v4(),
            aggregate_id,
            kind,
            payload: serde_json::to_value(message).unwrap_or_default(),
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
        });
    }

    fn upsert_result(&mut self, id: Uuid, transcript: &str, summary: &str) {
        let entry = self.results.entry(id).or_insert_with(|| TaskResult {
            task_id: id,
            transcript: String::new(),
            summary: String::new(),
            updated_at: Utc::now(),
        });
        if !transcript.is_empty() {
            entry.transcript = transcript.to_string();
        }
        if !summary.is_empty() {
            entry.summary = summary.to_string();
        }
        entry.updated_at = Utc::now();
    }
}

/// In-memory task + outbox store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all outbox rows, oldest first.
    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.inner.lock().await.outbox.clone()
    }

    /// Snapshot of one task, if present.
    pub async fn task(&self, id: Uuid) -> Option<Task> {
        self.inner.lock().await.tasks.get(&id).cloned()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task_with_outbox(
        &self,
        id: Uuid,
        owner: &str,
        file_path: &str,
        message: &TaskMessage,
    ) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let task = Task {
            id,
            user_id: owner.to_string(),
            status: TaskStatus::Pending,
            file_path: Some(file_path.to_string()),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        inner.tasks.insert(id, task.clone());
        inner.push_outbox(id, OutboxKind::Stt, message);
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        self.inner
            .lock()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<TaskResult>, StoreError> {
        Ok(self.inner.lock().await.results.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == from => {
                task.status = to;
                task.error_message = error_message.map(|s| s.to_string());
                task.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::StateConflict {
                task_id: id,
                expected: from,
            }),
        }
    }

    async fn touch_processing(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Processing => {
                task.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::StateConflict {
                task_id: id,
                expected: TaskStatus::Processing,
            }),
        }
    }

    async fn upsert_result(
        &self,
        id: Uuid,
        transcript: &str,
        summary: &str,
    ) -> Result<(), StoreError> {
        self.inner.lock().await.upsert_result(id, transcript, summary);
        Ok(())
    }

    async fn complete_with_summary(&self, id: Uuid, summary: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Processing => {
                task.status = TaskStatus::Completed;
                task.error_message = None;
                task.updated_at = Utc::now();
            }
            _ => {
                return Err(StoreError::StateConflict {
                    task_id: id,
                    expected: TaskStatus::Processing,
                })
            }
        }
        inner.upsert_result(id, "", summary);
        Ok(())
    }

    async fn save_transcript_and_enqueue_summary(
        &self,
        id: Uuid,
        transcript: &str,
        message: &TaskMessage,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.upsert_result(id, transcript, "");
        inner.push_outbox(id, OutboxKind::Summary, message);
        Ok(())
    }

    async fn cancel_task(&self, id: Uuid, owner: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&id) {
            Some(task)
                if task.user_id == owner
                    && matches!(task.status, TaskStatus::Pending | TaskStatus::Processing) =>
            {
                task.status = TaskStatus::Cancelled;
                task.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::NotFound(id)),
        }
    }

    async fn resummarize(
        &self,
        id: Uuid,
        owner: &str,
        config: TaskConfig,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        let transcript = match inner.results.get(&id) {
            Some(result) if !result.transcript.is_empty() => result.transcript.clone(),
            _ => return Err(StoreError::MissingTranscript(id)),
        };

        match inner.tasks.get_mut(&id) {
            Some(task) if task.user_id == owner && task.status == TaskStatus::Completed => {
                task.status = TaskStatus::Processing;
                task.error_message = None;
                task.updated_at = Utc::now();
            }
            _ => {
                return Err(StoreError::StateConflict {
                    task_id: id,
                    expected: TaskStatus::Completed,
                })
            }
        }

        let message = TaskMessage::summary(id, owner, &transcript, config);
        inner.push_outbox(id, OutboxKind::Summary, &message);
        Ok(())
    }

    async fn reap_stale_processing(&self, older_than: Duration) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut reaped = 0u64;
        for task in inner.tasks.values_mut() {
            if task.status == TaskStatus::Processing && task.updated_at < cutoff {
                task.status = TaskStatus::Failed;
                task.error_message = Some("task timed out (system recovery)".to_string());
                task.updated_at = Utc::now();
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_batch(
        &self,
        limit: i64,
        handler: OutboxHandler<'_>,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;

        let mut claimed: Vec<usize> = inner
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == OutboxStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        claimed.sort_by_key(|&i| inner.outbox[i].created_at);
        claimed.truncate(limit.max(0) as usize);

        let mut sent = 0usize;
        for idx in claimed {
            let event = inner.outbox[idx].clone();
            if handler(event).await.is_ok() {
                let row = &mut inner.outbox[idx];
                row.status = OutboxStatus::Sent;
                row.processed_at = Some(Utc::now());
                sent += 1;
            }
        }
        Ok(sent)
    }
}
