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

//! Stream endpoint.
//!
//! Serves one long-lived SSE stream per task request:
//!
//! 1. Authorize against the ownership record.
//! 2. Register with the Broadcaster **before** reading the replay buffers;
//!    an event that fires in between is then buffered in the listener
//!    channel instead of lost.
//! 3. Replay buffered transcript/summary partials, then forward live events
//!    until the client disconnects.
//! 4. Unsubscribe on the way out (listener guard drops with the stream).

use std::convert::Infallible;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use futures::StreamExt;
use tracing::{debug, error};
use uuid::Uuid;

use crate::broadcaster::{Broadcaster, ListenerId};
use crate::models::ProgressEvent;
use crate::replay::ReplayStore;

/// Rejection from the stream endpoint, ready to render as a response.
pub type StreamReject = (StatusCode, &'static str);

/// Unsubscribes its listener when the client stream is dropped.
struct ListenerGuard {
    broadcaster: Arc<Broadcaster>,
    task_key: String,
    listener: ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(&self.task_key, self.listener);
        debug!(task_id = %self.task_key, "Stream listener released");
    }
}

/// The per-task SSE endpoint.
pub struct StreamEndpoint {
    broadcaster: Arc<Broadcaster>,
    replay: Arc<dyn ReplayStore>,
}

impl StreamEndpoint {
    pub fn new(broadcaster: Arc<Broadcaster>, replay: Arc<dyn ReplayStore>) -> Self {
        Self { broadcaster, replay }
    }

    /// Full SSE response for one stream request.
    pub async fn handle(
        &self,
        task_id: Uuid,
        user_id: Option<&str>,
    ) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StreamReject> {
        let stream = self.open_stream(task_id, user_id).await?;
        Ok(Sse::new(stream.map(|payload| Ok(Event::default().data(payload))))
            .keep_alive(KeepAlive::default()))
    }

    /// Authorizes and opens the payload stream: replayed partials first,
    /// then live events until disconnect.
    pub async fn open_stream(
        &self,
        task_id: Uuid,
        user_id: Option<&str>,
    ) -> Result<impl Stream<Item = String>, StreamReject> {
        let Some(user_id) = user_id.filter(|u| !u.is_empty()) else {
            return Err((StatusCode::UNAUTHORIZED, "Unauthorized"));
        };

        let owner = self.replay.owner(task_id).await.map_err(|e| {
            error!(task_id = %task_id, "Ownership lookup failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        })?;
        match owner {
            None => return Err((StatusCode::NOT_FOUND, "Task not found")),
            Some(owner) if owner != user_id => {
                return Err((StatusCode::FORBIDDEN, "Forbidden"));
            }
            Some(_) => {}
        }

        // Registration precedes buffer replay.
        let task_key = task_id.to_string();
        let (listener, rx) = self.broadcaster.subscribe(&task_key);
        let guard = ListenerGuard {
            broadcaster: Arc::clone(&self.broadcaster),
            task_key,
            listener,
        };

        let mut replayed = Vec::new();
        if let Ok(Some(transcript)) = self.replay.read_transcript(task_id).await {
            if !transcript.is_empty() {
                replayed.push(ProgressEvent::transcript_update(task_id, &transcript).to_json());
            }
        }
        if let Ok(Some(summary)) = self.replay.read_summary(task_id).await {
            if !summary.is_empty() {
                replayed.push(ProgressEvent::summary_chunk(task_id, &summary).to_json());
            }
        }

        let live = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|payload| (payload, (rx, guard)))
        });

        Ok(futures::stream::iter(replayed).chain(live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryEventBus;
    use crate::replay::MemoryReplayStore;
    use std::time::Duration;

    fn endpoint() -> (Arc<MemoryReplayStore>, Arc<Broadcaster>, StreamEndpoint) {
        let bus = Arc::new(MemoryEventBus::new());
        let replay = Arc::new(MemoryReplayStore::new());
        let broadcaster = Arc::new(Broadcaster::new(bus));
        let endpoint = StreamEndpoint::new(Arc::clone(&broadcaster), replay.clone());
        (replay, broadcaster, endpoint)
    }

    #[tokio::test]
    async fn missing_owner_is_not_found() {
        let (_replay, _broadcaster, endpoint) = endpoint();
        let err = endpoint
            .open_stream(Uuid::new_v4(), Some("user-1"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_owner_is_forbidden() {
        let (replay, _broadcaster, endpoint) = endpoint();
        let id = Uuid::new_v4();
        replay.set_owner(id, "owner-a").await.unwrap();

        let err = endpoint
            .open_stream(id, Some("owner-b"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_user_is_unauthorized() {
        let (_replay, _broadcaster, endpoint) = endpoint();
        let err = endpoint.open_stream(Uuid::new_v4(), None).await.err().unwrap();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn replays_buffers_then_forwards_live_events() {
        let (replay, broadcaster, endpoint) = endpoint();
        let id = Uuid::new_v4();
        let ttl = Duration::from_secs(600);
        replay.set_owner(id, "user-1").await.unwrap();
        replay.write_transcript(id, "hello world", ttl).await.unwrap();
        replay.write_summary(id, "Hello ", ttl).await.unwrap();

        let mut stream = Box::pin(
            endpoint
                .open_stream(id, Some("user-1"))
                .await
                .expect("stream should open"),
        );

        // Replay order: transcript buffer, then summary buffer.
        let first: serde_json::Value =
            serde_json::from_str(&stream.next().await.unwrap()).unwrap();
        assert_eq!(first["type"], "transcript_update");
        assert_eq!(first["content"], "hello world");

        let second: serde_json::Value =
            serde_json::from_str(&stream.next().await.unwrap()).unwrap();
        assert_eq!(second["type"], "summary_chunk");
        assert_eq!(second["content"], "Hello ");

        // Live events flow through the broadcaster registration.
        assert_eq!(broadcaster.listener_count(&id.to_string()), 1);
        broadcaster.dispatch(
            &crate::models::event::progress_channel(id),
            "live-1".to_string(),
        );
        assert_eq!(stream.next().await.unwrap(), "live-1");

        // Dropping the stream releases the listener.
        drop(stream);
        assert_eq!(broadcaster.listener_count(&id.to_string()), 0);
    }
}
