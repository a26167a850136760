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

//! Event multiplexer.
//!
//! One pattern subscription to `progress:*` per process, fanned out
//! in-memory to per-task listeners. Without this, every client stream would
//! open its own bus subscription and the bus connection count would scale
//! with user load instead of process count.
//!
//! Fan-out sends are non-blocking: a listener whose buffer is full has that
//! event dropped for it alone, so one slow client can never stall the
//! fan-out loop or starve its siblings. Reconnecting clients recover dropped
//! partials from the replay buffers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::models::event::task_id_from_channel;
use crate::models::PROGRESS_PATTERN;
use crate::worker::cancel::CancelToken;

/// Listener channel capacity; absorbs bursts without letting a stalled
/// client hold memory indefinitely.
const LISTENER_BUFFER: usize = 16;

/// Handle identifying one registered listener, returned by
/// [`Broadcaster::subscribe`] and required by [`Broadcaster::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Registry = HashMap<String, HashMap<u64, mpsc::Sender<String>>>;

/// In-process fan-out of per-task progress events.
pub struct Broadcaster {
    bus: Arc<dyn EventBus>,
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            registry: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a listener for one task and returns its buffered receiver.
    pub fn subscribe(&self, task_id: &str) -> (ListenerId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry
            .entry(task_id.to_string())
            .or_default()
            .insert(id, tx);

        (ListenerId(id), rx)
    }

    /// Removes a listener; the receiver's channel closes. Empty task entries
    /// are deleted so the registry stays bounded by live listeners.
    pub fn unsubscribe(&self, task_id: &str, listener: ListenerId) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(listeners) = registry.get_mut(task_id) {
            listeners.remove(&listener.0);
            if listeners.is_empty() {
                registry.remove(task_id);
            }
        }
    }

    /// Number of listeners currently registered for a task.
    pub fn listener_count(&self, task_id: &str) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .map_or(0, |l| l.len())
    }

    /// Background fan-out loop. Holds the process's single `progress:*`
    /// subscription; if it drops, resubscribes after 3 seconds until
    /// shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancelToken) {
        loop {
            match self.bus.pattern_subscribe(PROGRESS_PATTERN).await {
                Ok(mut subscription) => {
                    info!("Broadcaster started, listening to {}", PROGRESS_PATTERN);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                info!("Broadcaster shutting down");
                                return;
                            }
                            msg = subscription.next() => match msg {
                                Some(msg) => self.dispatch(&msg.channel, msg.payload),
                                None => {
                                    warn!("Broadcaster bus subscription closed");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!("Broadcaster subscribe failed: {}", e),
            }

            if shutdown.is_cancelled() {
                info!("Broadcaster shutting down");
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Delivers one bus message to every listener of its task. Non-blocking:
    /// a full listener buffer drops the event for that listener only.
    pub(crate) fn dispatch(&self, channel: &str, payload: String) {
        let Some(task_id) = task_id_from_channel(channel) else {
            return;
        };

        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        let Some(listeners) = registry.get(task_id) else {
            return;
        };
        for (id, tx) in listeners {
            if let Err(e) = tx.try_send(payload.clone()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        debug!(task_id, listener = *id, "Slow listener, dropping event")
                    }
                    mpsc::error::TrySendError::Closed(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryEventBus;
    use crate::models::event::progress_channel;
    use uuid::Uuid;

    fn setup() -> (Arc<MemoryEventBus>, Arc<Broadcaster>, CancelToken) {
        let bus = Arc::new(MemoryEventBus::new());
        let broadcaster = Arc::new(Broadcaster::new(bus.clone()));
        let shutdown = CancelToken::new();
        tokio::spawn(Arc::clone(&broadcaster).run(shutdown.clone()));
        (bus, broadcaster, shutdown)
    }

    async fn publish_until_received(
        bus: &MemoryEventBus,
        channel: &str,
        payload: &str,
        rx: &mut mpsc::Receiver<String>,
    ) -> String {
        // The run loop subscribes asynchronously; retry until it is wired up.
        for _ in 0..100 {
            bus.publish(channel, payload).await.unwrap();
            match tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
                Ok(Some(msg)) => return msg,
                _ => continue,
            }
        }
        panic!("event never delivered");
    }

    #[tokio::test]
    async fn fans_out_to_task_listeners() {
        let (bus, broadcaster, _shutdown) = setup();
        let task = Uuid::new_v4();
        let (id_a, mut rx_a) = broadcaster.subscribe(&task.to_string());

        let msg =
            publish_until_received(&bus, &progress_channel(task), "payload-1", &mut rx_a).await;
        assert_eq!(msg, "payload-1");

        broadcaster.unsubscribe(&task.to_string(), id_a);
        assert_eq!(broadcaster.listener_count(&task.to_string()), 0);
    }

    #[tokio::test]
    async fn other_tasks_do_not_cross_talk() {
        let (bus, broadcaster, _shutdown) = setup();
        let task_a = Uuid::new_v4();
        let task_b = Uuid::new_v4();
        let (_id_a, mut rx_a) = broadcaster.subscribe(&task_a.to_string());
        let (_id_b, mut rx_b) = broadcaster.subscribe(&task_b.to_string());

        let msg =
            publish_until_received(&bus, &progress_channel(task_a), "for-a", &mut rx_a).await;
        assert_eq!(msg, "for-a");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx_b.recv())
                .await
                .is_err(),
            "listener B must not observe task A's events"
        );
    }

    #[tokio::test]
    async fn slow_listener_drops_but_does_not_stall_siblings() {
        let (bus, broadcaster, _shutdown) = setup();
        let task = Uuid::new_v4();
        let (_slow_id, mut slow_rx) = broadcaster.subscribe(&task.to_string());
        let (_fast_id, mut fast_rx) = broadcaster.subscribe(&task.to_string());

        // Prime the pipeline so the subscription is live.
        let first =
            publish_until_received(&bus, &progress_channel(task), "prime", &mut fast_rx).await;
        assert_eq!(first, "prime");

        // The fast listener drains continuously while the slow one never
        // reads at all.
        let flood = LISTENER_BUFFER * 4;
        let drainer = tokio::spawn(async move {
            let mut seen = 0;
            while seen < flood {
                match tokio::time::timeout(Duration::from_secs(2), fast_rx.recv()).await {
                    Ok(Some(_)) => seen += 1,
                    _ => break,
                }
            }
            seen
        });

        for i in 0..flood {
            bus.publish(&progress_channel(task), &format!("evt-{}", i))
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }

        let fast_seen = drainer.await.unwrap();
        assert_eq!(fast_seen, flood, "fast listener throughput was degraded");

        // The slow listener got at most its buffer (plus the primer).
        let mut slow_seen = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(50), slow_rx.recv()).await
        {
            slow_seen += 1;
        }
        assert!(slow_seen <= LISTENER_BUFFER + 1);
    }

    #[tokio::test]
    async fn empty_entries_are_removed() {
        let (_bus, broadcaster, _shutdown) = setup();
        let task = Uuid::new_v4().to_string();
        let (id_1, _rx_1) = broadcaster.subscribe(&task);
        let (id_2, _rx_2) = broadcaster.subscribe(&task);
        assert_eq!(broadcaster.listener_count(&task), 2);

        broadcaster.unsubscribe(&task, id_1);
        assert_eq!(broadcaster.listener_count(&task), 1);
        broadcaster.unsubscribe(&task, id_2);
        assert_eq!(broadcaster.listener_count(&task), 0);
    }
}
