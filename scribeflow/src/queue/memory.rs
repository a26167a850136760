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

//! In-memory queue for tests and local development.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::QueueError;
use crate::models::TaskMessage;

use super::TaskQueue;

/// FIFO in-memory queue. `fail_publishes` simulates a broker outage so relay
/// retry behavior can be exercised.
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<TaskMessage>>,
    notify: Notify,
    fail_publishes: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every publish fails with [`QueueError::Publish`].
    pub fn set_failing(&self, failing: bool) {
        self.fail_publishes.store(failing, Ordering::SeqCst);
    }

    /// Removes and returns the oldest message, if any.
    pub fn try_pop(&self) -> Option<TaskMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Waits for a message to arrive.
    pub async fn pop(&self) -> TaskMessage {
        loop {
            if let Some(msg) = self.try_pop() {
                return msg;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(&self, message: &TaskMessage) -> Result<(), QueueError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(QueueError::Publish("simulated broker outage".into()));
        }
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(message.clone());
        // notify_one stores a permit, so a pop racing this publish still
        // observes the wakeup.
        self.notify.notify_one();
        Ok(())
    }
}
