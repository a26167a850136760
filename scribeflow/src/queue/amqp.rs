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

//! AMQP queue publisher.
//!
//! The publish channel is replaced on every reconnect (the previous one is
//! dead once its connection drops), so it lives behind a mutex and the
//! consume loop installs a fresh one via [`AmqpQueue::set_channel`]. The
//! mutex also serializes publishes; an AMQP channel is not safe for
//! concurrent publish.

use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel};
use tokio::sync::Mutex;
use tracing::debug;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::models::TaskMessage;

use super::{TaskQueue, TASKS_QUEUE};

/// Delivery mode 2 marks messages persistent.
const PERSISTENT: u8 = 2;

/// Publisher handle over a replaceable AMQP channel.
#[derive(Default)]
pub struct AmqpQueue {
    channel: Mutex<Option<Channel>>,
}

impl AmqpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a fresh publish channel, discarding the previous one.
    /// Called by the consume loop after every (re)connect.
    pub async fn set_channel(&self, channel: Channel) {
        let mut guard = self.channel.lock().await;
        *guard = Some(channel);
        debug!("Queue publish channel installed");
    }
}

#[async_trait]
impl TaskQueue for AmqpQueue {
    async fn publish(&self, message: &TaskMessage) -> Result<(), QueueError> {
        let body =
            serde_json::to_vec(message).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let guard = self.channel.lock().await;
        let channel = guard.as_ref().ok_or(QueueError::ChannelUnavailable)?;

        channel
            .basic_publish(
                "",
                TASKS_QUEUE,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;

        Ok(())
    }
}
