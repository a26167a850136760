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

//! Outbox relay.
//!
//! Writing to the database and the queue separately admits the failure mode
//! "state committed, queue publish lost" and a task stuck forever. The
//! control plane and the worker therefore write follow-on work into the
//! outbox table inside their state-changing transactions, and this relay
//! reconciles it against the queue with at-least-once semantics: a claimed
//! row is marked sent only after its publish succeeds, inside the claiming
//! transaction, so a crash at any point leaves the row pending for the next
//! pass.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, error, info};

use crate::error::QueueError;
use crate::models::{OutboxEvent, TaskMessage};
use crate::queue::TaskQueue;
use crate::store::OutboxStore;
use crate::worker::cancel::CancelToken;

/// Why [`OutboxRelay::run`] returned.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayExit {
    /// Shutdown was requested.
    Shutdown,
    /// The store kept failing; the supervisor should rebuild the relay with
    /// a fresh connection.
    StoreFailure,
}

/// Consecutive store failures tolerated before giving the connection up.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Periodic outbox drainer.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    queue: Arc<dyn TaskQueue>,
    interval: Duration,
    batch_size: i64,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        queue: Arc<dyn TaskQueue>,
        interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            queue,
            interval,
            batch_size,
        }
    }

    /// Runs the relay until shutdown, or until the store looks dead.
    pub async fn run(&self, shutdown: CancelToken) -> RelayExit {
        info!(
            "Outbox relay started (interval={:?}, batch={})",
            self.interval, self.batch_size
        );
        let mut consecutive_failures = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Outbox relay stopped");
                    return RelayExit::Shutdown;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.drain_once().await {
                Ok(sent) => {
                    consecutive_failures = 0;
                    if sent > 0 {
                        debug!("Outbox relay dispatched {} message(s)", sent);
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!("Outbox relay pass failed: {}", e);
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        return RelayExit::StoreFailure;
                    }
                }
            }
        }
    }

    /// One claim-and-publish pass. Returns the number of rows marked sent.
    pub async fn drain_once(&self) -> Result<usize, crate::error::StoreError> {
        let queue = self.queue.clone();
        let mut handler = move |event: OutboxEvent| -> BoxFuture<'static, Result<(), QueueError>> {
            let queue = queue.clone();
            Box::pin(async move {
                let mut message: TaskMessage = serde_json::from_value(event.payload)
                    .map_err(|e| QueueError::Serialization(e.to_string()))?;
                // The row's kind is authoritative over whatever the payload
                // was serialized with.
                message.kind = event.kind;
                queue.publish(&message).await
            })
        };

        self.store.claim_batch(self.batch_size, &mut handler).await
    }
}
