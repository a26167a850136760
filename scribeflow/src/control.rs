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

//! Task control operations: create, cancel, resummarize.
//!
//! Each operation is defined by the invariants it enforces against the store
//! and the bus:
//!
//! - **create** inserts the pending task together with its STT outbox row in
//!   one transaction and writes the ownership record.
//! - **cancel** is a conditional update over (id, owner, non-terminal
//!   status); only a successful update publishes on `cancel_channel`.
//! - **resummarize** transactionally requires a stored transcript, moves
//!   `completed -> processing`, and enqueues the SUMMARY outbox row.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::ControlError;
use crate::models::{CancelSignal, TaskConfig, CANCEL_CHANNEL};
use crate::replay::ReplayStore;
use crate::store::TaskStore;

/// The thin control plane over the pipeline.
pub struct TaskControl {
    store: Arc<dyn TaskStore>,
    replay: Arc<dyn ReplayStore>,
    bus: Arc<dyn EventBus>,
}

impl TaskControl {
    pub fn new(
        store: Arc<dyn TaskStore>,
        replay: Arc<dyn ReplayStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self { store, replay, bus }
    }

    /// Creates a pending task for `owner` over an already-uploaded file and
    /// returns the generated id. The STT dispatch rides the outbox.
    pub async fn create(
        &self,
        owner: &str,
        file_path: &str,
        config: TaskConfig,
    ) -> Result<Uuid, ControlError> {
        let id = Uuid::new_v4();
        let message = crate::models::TaskMessage::stt(id, owner, file_path, config);

        self.store
            .create_task_with_outbox(id, owner, file_path, &message)
            .await?;
        self.replay.set_owner(id, owner).await?;

        info!(task_id = %id, owner, "Task created");
        Ok(id)
    }

    /// Cancels a pending or processing task owned by `owner`. On success the
    /// cancellation signal is published so workers abort in-flight work; the
    /// terminal state is already durable even if the signal is lost.
    pub async fn cancel(&self, id: Uuid, owner: &str) -> Result<(), ControlError> {
        self.store.cancel_task(id, owner).await.map_err(|e| match e {
            crate::error::StoreError::NotFound(_) => ControlError::NotCancellable,
            other => ControlError::Store(other),
        })?;

        let signal = CancelSignal { task_id: id };
        let payload = serde_json::to_string(&signal).unwrap_or_default();
        if let Err(e) = self.bus.publish(CANCEL_CHANNEL, &payload).await {
            warn!(task_id = %id, "Cancel signal publish failed: {}", e);
        }

        info!(task_id = %id, "Task cancelled");
        Ok(())
    }

    /// Re-runs the summary stage over the stored transcript.
    pub async fn resummarize(
        &self,
        id: Uuid,
        owner: &str,
        config: TaskConfig,
    ) -> Result<(), ControlError> {
        self.store.resummarize(id, owner, config).await?;
        info!(task_id = %id, "Task queued for resummarize");
        Ok(())
    }
}
