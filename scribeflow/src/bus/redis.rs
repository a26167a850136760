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

//! Redis-backed event bus.
//!
//! Publishing goes through a multiplexed connection manager shared by every
//! clone. Each subscription opens its own pub/sub connection and pumps
//! messages into an in-process channel; when the connection drops the pump
//! exits and the subscription stream ends, which callers observe as `None`.

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use async_trait::async_trait;

use crate::error::BusError;

use super::{BusMessage, BusSubscription, EventBus};

/// Event bus over Redis pub/sub.
#[derive(Clone)]
pub struct RedisEventBus {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
}

impl RedisEventBus {
    /// Connects the shared publisher. Subscriptions dial on demand.
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| BusError::Connection(e.to_string()))?;
        let publisher = client
            .get_connection_manager()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self { client, publisher })
    }

    async fn open_subscription(
        &self,
        target: &str,
        pattern: bool,
    ) -> Result<BusSubscription, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        if pattern {
            pubsub
                .psubscribe(target)
                .await
                .map_err(|e| BusError::Subscribe(e.to_string()))?;
        } else {
            pubsub
                .subscribe(target)
                .await
                .map_err(|e| BusError::Subscribe(e.to_string()))?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let subject = target.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(channel = %channel, "Dropping non-text bus payload: {}", e);
                        continue;
                    }
                };
                if tx.send(BusMessage { channel, payload }).is_err() {
                    // Subscriber gone; drop the pub/sub connection.
                    break;
                }
            }
            debug!(subscription = %subject, "Bus subscription pump stopped");
        });

        Ok(BusSubscription::new(rx))
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        self.open_subscription(channel, false).await
    }

    async fn pattern_subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError> {
        self.open_subscription(pattern, true).await
    }
}
