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

//! Error types for the pipeline.
//!
//! Each infrastructure concern gets its own error enum so callers can match
//! on the failure class that matters to them. `StateConflict` is the one
//! variant with control-flow meaning: a conditional update matched zero rows
//! and the caller must abandon the action (another actor already moved the
//! task).

use thiserror::Error;
use uuid::Uuid;

use crate::models::TaskStatus;

/// Errors from the durable state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to obtain a connection from the pool.
    #[error("connection pool error: {0}")]
    ConnectionPool(String),

    /// The database rejected or failed a query.
    #[error("database error: {0}")]
    Database(String),

    /// A conditional state transition matched zero rows.
    #[error("state transition refused for task {task_id} (expected status '{expected}')")]
    StateConflict { task_id: Uuid, expected: TaskStatus },

    /// The task does not exist.
    #[error("task {0} not found")]
    NotFound(Uuid),

    /// A resummarize was requested for a task with no stored transcript.
    #[error("task {0} has no stored transcript")]
    MissingTranscript(Uuid),

    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors from the pub/sub event bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("bus publish error: {0}")]
    Publish(String),

    #[error("bus subscribe error: {0}")]
    Subscribe(String),
}

/// Errors from the replay-buffer / ownership store.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay store error: {0}")]
    Backend(String),
}

/// Errors from the work queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    /// No publish channel installed yet (startup or mid-reconnect).
    #[error("queue publish channel unavailable")]
    ChannelUnavailable,

    #[error("queue publish error: {0}")]
    Publish(String),

    #[error("queue message serialization error: {0}")]
    Serialization(String),
}

/// Errors from the STT / LLM providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid provider input: {0}")]
    InvalidInput(String),

    #[error("provider request failed: {0}")]
    Http(String),

    /// Non-2xx response from the provider, body included verbatim.
    #[error("provider returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("provider stream error: {0}")]
    Stream(String),

    #[error("provider i/o error: {0}")]
    Io(String),
}

/// Errors from the audio chunker.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("audio i/o error: {0}")]
    Io(String),

    #[error("ffprobe failed: {0}")]
    Probe(String),

    #[error("ffmpeg failed: {0}")]
    Transcode(String),
}

/// Unified error for a worker task execution.
///
/// `Cancelled` is deliberately separate from the failure variants: the error
/// handler inspects it to decide between the `cancelled` and `failed`
/// terminal states.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("cancelled")]
    Cancelled,

    #[error("chunk transcription timed out after {0} seconds")]
    ChunkTimeout(u64),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Chunking(#[from] ChunkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors from the task control operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// No row matched (unknown task, wrong owner, or terminal state).
    #[error("task not found or not cancellable")]
    NotCancellable,

    #[error("task is not in a resummarizable state")]
    Conflict,

    #[error("task has no stored transcript")]
    MissingTranscript,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StateConflict { .. } => ControlError::Conflict,
            StoreError::MissingTranscript(_) => ControlError::MissingTranscript,
            other => ControlError::Store(other),
        }
    }
}
