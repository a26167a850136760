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

//! Stale-task reaper.
//!
//! A worker that crashes mid-task leaves its row in `processing` with no one
//! to finish it. Since `updated_at` is refreshed on every mutation, a
//! `processing` row that has not moved within the timeout is orphaned; the
//! reaper sweeps it to `failed` so clients stop waiting.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::store::TaskStore;
use crate::worker::cancel::CancelToken;

/// Periodic sweep of orphaned `processing` tasks.
pub struct Reaper {
    store: Arc<dyn TaskStore>,
    interval: Duration,
    timeout: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn TaskStore>, interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            interval,
            timeout,
        }
    }

    /// Runs sweeps until `shutdown` fires.
    pub async fn run(&self, shutdown: CancelToken) {
        info!(
            "Reaper started (interval={:?}, timeout={:?})",
            self.interval, self.timeout
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reaper stopped");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.store.reap_stale_processing(self.timeout).await {
                Ok(0) => {}
                Ok(reaped) => info!("Reaper failed {} stale task(s)", reaped),
                Err(e) => error!("Reaper sweep failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskConfig, TaskMessage, TaskStatus};
    use crate::store::{MemoryStore, TaskStore};
    use uuid::Uuid;

    #[tokio::test]
    async fn sweeps_only_stale_processing_tasks() {
        let store = Arc::new(MemoryStore::new());

        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        for id in [stale, fresh] {
            let msg = TaskMessage::stt(id, "u", "/tmp/a.wav", TaskConfig::default());
            store
                .create_task_with_outbox(id, "u", "/tmp/a.wav", &msg)
                .await
                .unwrap();
            store
                .transition(id, TaskStatus::Pending, TaskStatus::Processing, None)
                .await
                .unwrap();
        }

        // Nothing is older than the timeout yet.
        assert_eq!(
            store.reap_stale_processing(Duration::from_secs(60)).await.unwrap(),
            0
        );

        // Age both tasks past a short timeout, then refresh one so only the
        // other qualifies.
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.touch_processing(fresh).await.unwrap();
        let reaped = store
            .reap_stale_processing(Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        let stale_task = store.task(stale).await.unwrap();
        assert_eq!(stale_task.status, TaskStatus::Failed);
        assert_eq!(
            stale_task.error_message.as_deref(),
            Some("task timed out (system recovery)")
        );
        assert_eq!(store.task(fresh).await.unwrap().status, TaskStatus::Processing);
    }
}
