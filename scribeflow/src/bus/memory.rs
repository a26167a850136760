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

//! In-process event bus for tests and local development.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BusError;

use super::{channel_matches, BusMessage, BusSubscription, EventBus};

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// In-memory pub/sub with the same at-most-once, fire-and-forget semantics
/// as the Redis bus.
#[derive(Default)]
pub struct MemoryEventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_subscriber(&self, pattern: &str) -> BusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                pattern: pattern.to_string(),
                tx,
            });
        BusSubscription::new(rx)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|sub| {
            if !channel_matches(&sub.pattern, channel) {
                return true;
            }
            // Send failure means the subscription was dropped.
            sub.tx
                .send(BusMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        Ok(self.add_subscriber(channel))
    }

    async fn pattern_subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError> {
        Ok(self.add_subscriber(pattern))
    }
}
