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

//! Durable state store contracts.
//!
//! All concurrency between the control plane (cancel, resummarize) and the
//! data plane (worker completion) is arbitrated here by conditional updates:
//! no component reads state and then writes it without a guard. A guarded
//! write that matches zero rows returns [`StoreError::StateConflict`] and the
//! caller abandons the action.
//!
//! Two implementations exist: the PostgreSQL one used in production and an
//! in-memory one for tests and local development.

pub mod memory;
pub mod outbox_pg;
pub mod postgres;

pub use memory::MemoryStore;
pub use outbox_pg::PgOutboxStore;
pub use postgres::PgTaskStore;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::{QueueError, StoreError};
use crate::models::{OutboxEvent, Task, TaskConfig, TaskMessage, TaskResult, TaskStatus};

/// Per-row handler invoked while an outbox claim transaction is open.
///
/// Returning `Ok` marks the row `sent` within the claiming transaction;
/// returning `Err` leaves it `pending` for a later attempt.
pub type OutboxHandler<'a> =
    &'a mut (dyn FnMut(OutboxEvent) -> BoxFuture<'static, Result<(), QueueError>> + Send);

/// Durable record of tasks and their results.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new `pending` task and its STT outbox row in one
    /// transaction, so creation and dispatch cannot diverge.
    async fn create_task_with_outbox(
        &self,
        id: Uuid,
        owner: &str,
        file_path: &str,
        message: &TaskMessage,
    ) -> Result<Task, StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError>;

    async fn get_result(&self, id: Uuid) -> Result<Option<TaskResult>, StoreError>;

    /// Conditional state transition guarded by the expected source state.
    /// Refreshes `updated_at`; zero rows affected means another actor already
    /// moved the task and the caller must abandon the action.
    async fn transition(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Redelivery guard for SUMMARY messages: refreshes `updated_at` while
    /// the task is still `processing`. Zero rows is a conflict, which stops
    /// a redelivered message from invoking the LLM twice.
    async fn touch_processing(&self, id: Uuid) -> Result<(), StoreError>;

    /// Upserts the result row. An empty string leaves the corresponding
    /// column untouched.
    async fn upsert_result(
        &self,
        id: Uuid,
        transcript: &str,
        summary: &str,
    ) -> Result<(), StoreError>;

    /// Single transaction: conditional `processing -> completed` plus the
    /// final summary upsert.
    async fn complete_with_summary(&self, id: Uuid, summary: &str) -> Result<(), StoreError>;

    /// Single transaction: transcript upsert plus a SUMMARY outbox insert.
    /// Guarantees "transcript persisted <=> summary will be dispatched".
    async fn save_transcript_and_enqueue_summary(
        &self,
        id: Uuid,
        transcript: &str,
        message: &TaskMessage,
    ) -> Result<(), StoreError>;

    /// Conditional cancel owned by `owner`:
    /// `status IN (pending, processing) -> cancelled`. Zero rows affected
    /// returns [`StoreError::NotFound`].
    async fn cancel_task(&self, id: Uuid, owner: &str) -> Result<(), StoreError>;

    /// Single transaction: require a stored transcript, conditional
    /// `completed -> processing` for `owner`, and a SUMMARY outbox insert
    /// carrying the transcript.
    async fn resummarize(
        &self,
        id: Uuid,
        owner: &str,
        config: TaskConfig,
    ) -> Result<(), StoreError>;

    /// Bulk `processing -> failed` for tasks whose `updated_at` is older than
    /// `now - older_than`. Returns the number of rows reaped.
    async fn reap_stale_processing(&self, older_than: Duration) -> Result<u64, StoreError>;
}

/// Claiming side of the transactional outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `limit` oldest pending rows under row-level locks that
    /// skip contended rows, invokes `handler` per row, and marks successful
    /// rows `sent` with `processed_at = now()` in the same transaction.
    ///
    /// Returns the number of rows marked sent.
    async fn claim_batch(
        &self,
        limit: i64,
        handler: OutboxHandler<'_>,
    ) -> Result<usize, StoreError>;
}
