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

//! Domain models: persisted entities, queue messages, and bus events.

pub mod event;
pub mod message;
pub mod outbox;
pub mod task;

pub use event::{
    progress_channel, task_id_from_channel, CancelSignal, ProgressEvent, CANCEL_CHANNEL,
    PROGRESS_PATTERN,
};
pub use message::{TaskConfig, TaskKind, TaskMessage};
pub use outbox::{OutboxEvent, OutboxKind, OutboxStatus};
pub use task::{Task, TaskResult, TaskStatus};
