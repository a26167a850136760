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

//! Pub/sub event bus.
//!
//! The bus carries per-task progress events (`progress:{taskId}`) and the
//! global cancellation channel. Delivery is best-effort at-most-once; the
//! replay buffers and the terminal state in the database tolerate lost
//! messages. The bus is never a system of record.

pub mod memory;
pub mod redis;

pub use self::redis::RedisEventBus;
pub use memory::MemoryEventBus;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BusError;

/// One delivered pub/sub message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// A live subscription. The stream ends (`next` returns `None`) when the
/// underlying connection drops; callers that need a durable subscription
/// resubscribe with backoff.
pub struct BusSubscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl BusSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Fire-and-forget pub/sub channel.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Subscribes to a single channel by exact name.
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError>;

    /// Subscribes to every channel matching a glob pattern
    /// (e.g. `progress:*`).
    async fn pattern_subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError>;
}

/// Glob match supporting a trailing `*`, which is the only pattern shape the
/// pipeline uses.
pub(crate) fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => channel == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matching() {
        assert!(channel_matches("progress:*", "progress:abc"));
        assert!(channel_matches("progress:*", "progress:"));
        assert!(!channel_matches("progress:*", "cancel_channel"));
        assert!(channel_matches("cancel_channel", "cancel_channel"));
        assert!(!channel_matches("cancel_channel", "cancel_channel2"));
    }
}
