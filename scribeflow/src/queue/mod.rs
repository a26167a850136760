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

//! Durable work queue.
//!
//! The queue named `tasks` carries [`TaskMessage`]s with manual
//! acknowledgement and per-consumer prefetch. This module owns the publish
//! side; the consume loop lives in the worker binary, which drives the AMQP
//! consumer directly and reconnects with backoff.

pub mod amqp;
pub mod memory;

pub use amqp::AmqpQueue;
pub use memory::MemoryQueue;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::models::TaskMessage;

/// Name of the work queue.
pub const TASKS_QUEUE: &str = "tasks";

/// Publish side of the work queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Publishes a persistent message to the `tasks` queue.
    async fn publish(&self, message: &TaskMessage) -> Result<(), QueueError>;
}
