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

//! Worker engine.
//!
//! One execution context per queue delivery, keyed in the active-task
//! registry by task id so the cancellation listener can reach in-flight
//! work. Dispatch is by message kind:
//!
//! - **STT**: chunk the audio, transcribe chunks concurrently (bounded
//!   fan-out, fail-fast), stream in-order cumulative transcript updates,
//!   then atomically persist the transcript together with the SUMMARY
//!   outbox row.
//! - **SUMMARY**: stream the LLM, forwarding each delta and maintaining the
//!   reconnect replay buffer, then atomically complete the task with the
//!   final summary.
//!
//! Every state-advancing write is a conditional update; a refusal means
//! another actor (cancel, reaper, a concurrent delivery) already moved the
//! task and this delivery abandons its work.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::AudioChunker;
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::{StoreError, WorkerError};
use crate::models::event::progress_channel;
use crate::models::{
    CancelSignal, ProgressEvent, TaskKind, TaskMessage, TaskStatus, CANCEL_CHANNEL,
};
use crate::providers::{SpeechToText, Summarizer};
use crate::replay::ReplayStore;
use crate::store::TaskStore;

use super::cancel::{ActiveTasks, CancelToken};
use super::merge::merge_transcripts;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Concurrent STT calls per task.
    pub stt_concurrency: usize,
    /// Maximum chunk duration handed to the chunker, in seconds.
    pub chunk_max_secs: f64,
    /// Per-chunk STT call timeout.
    pub chunk_timeout: Duration,
    /// TTL for the replay buffers.
    pub replay_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stt_concurrency: 5,
            chunk_max_secs: 30.0,
            chunk_timeout: Duration::from_secs(300),
            replay_ttl: Duration::from_secs(600),
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            stt_concurrency: config.stt_concurrency,
            chunk_max_secs: config.chunk_max_secs,
            chunk_timeout: config.chunk_timeout,
            replay_ttl: config.replay_ttl,
        }
    }
}

/// In-order streaming state for the STT fan-out. Chunks may complete out of
/// order; an update is emitted only when the next-in-order gap fills, and it
/// always carries the full cumulative transcript.
struct StreamState {
    transcripts: Vec<Option<String>>,
    next_to_stream: usize,
    cumulative: String,
}

/// The worker engine. Construct once, wrap in an `Arc`, and call
/// [`WorkerEngine::process`] per queue delivery.
pub struct WorkerEngine {
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn EventBus>,
    replay: Arc<dyn ReplayStore>,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn Summarizer>,
    chunker: Arc<dyn AudioChunker>,
    active: ActiveTasks,
    settings: EngineSettings,
}

impl WorkerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: Arc<dyn EventBus>,
        replay: Arc<dyn ReplayStore>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn Summarizer>,
        chunker: Arc<dyn AudioChunker>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            bus,
            replay,
            stt,
            llm,
            chunker,
            active: ActiveTasks::new(),
            settings,
        }
    }

    /// The active-task registry, shared with the shutdown path.
    pub fn active_tasks(&self) -> ActiveTasks {
        self.active.clone()
    }

    /// Processes one queue delivery to completion (terminal state or quiet
    /// abandon). The caller acks the delivery afterwards.
    pub async fn process(self: Arc<Self>, message: TaskMessage) {
        let token = CancelToken::new();
        self.active.register(message.task_id, token.clone());

        match message.kind {
            TaskKind::Stt => self.handle_stt(&token, &message).await,
            TaskKind::Summary => self.handle_summary(&token, &message).await,
        }

        self.active.deregister(message.task_id);
    }

    /// Long-lived `cancel_channel` subscriber routing signals into the
    /// active-task registry. Resubscribes after 3 seconds on disconnect,
    /// until shutdown.
    pub async fn run_cancellation_listener(self: Arc<Self>, shutdown: CancelToken) {
        loop {
            match self.bus.subscribe(CANCEL_CHANNEL).await {
                Ok(mut subscription) => {
                    info!("Cancellation listener subscribed to {}", CANCEL_CHANNEL);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                info!("Cancellation listener stopped");
                                return;
                            }
                            msg = subscription.next() => match msg {
                                Some(msg) => {
                                    match serde_json::from_str::<CancelSignal>(&msg.payload) {
                                        Ok(signal) => {
                                            if self.active.cancel(signal.task_id) {
                                                info!(task_id = %signal.task_id, "Received cancellation for in-flight task");
                                            }
                                        }
                                        Err(e) => debug!("Ignoring malformed cancel payload: {}", e),
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
                Err(e) => warn!("Cancellation listener subscribe failed: {}", e),
            }

            if shutdown.is_cancelled() {
                info!("Cancellation listener stopped");
                return;
            }
            warn!("Cancellation listener disconnected, resubscribing in 3s");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    // --- STT stage ---

    async fn handle_stt(self: &Arc<Self>, token: &CancelToken, message: &TaskMessage) {
        let id = message.task_id;
        info!(task_id = %id, "Processing STT task");

        // Claim the task. A refusal means it was cancelled (or otherwise
        // moved) before pickup; nothing was started, so no event is emitted.
        match self
            .store
            .transition(id, TaskStatus::Pending, TaskStatus::Processing, None)
            .await
        {
            Ok(()) => {}
            Err(StoreError::StateConflict { .. }) => {
                debug!(task_id = %id, "STT pickup refused, abandoning delivery");
                return;
            }
            Err(e) => {
                error!(task_id = %id, "STT pickup failed: {}", e);
                self.publish_event(&ProgressEvent::failed(id, "task state unavailable"))
                    .await;
                return;
            }
        }

        let Some(file_path) = message.file_path.clone() else {
            self.handle_error(token, message, WorkerError::Provider(
                crate::error::ProviderError::InvalidInput("STT message carries no file path".into()),
            ))
            .await;
            return;
        };

        self.publish_event(&ProgressEvent::progress(id, 10, "processing audio"))
            .await;

        let chunks = match self
            .chunker
            .split(std::path::Path::new(&file_path), self.settings.chunk_max_secs)
            .await
        {
            Ok(set) => set,
            Err(e) => {
                self.handle_error(token, message, WorkerError::Chunking(e)).await;
                return;
            }
        };

        let total = chunks.len();
        self.publish_event(&ProgressEvent::progress(
            id,
            30,
            &format!("transcribing {} chunk(s)", total),
        ))
        .await;

        // Concurrent transcription: bounded fan-out, first error cancels the
        // shared STT token so siblings abort promptly.
        let stt_token = token.child();
        let semaphore = Arc::new(Semaphore::new(self.settings.stt_concurrency.max(1)));
        let state = Arc::new(Mutex::new(StreamState {
            transcripts: vec![None; total],
            next_to_stream: 0,
            cumulative: String::new(),
        }));
        let first_error: Arc<std::sync::Mutex<Option<WorkerError>>> =
            Arc::new(std::sync::Mutex::new(None));

        let mut join_set = JoinSet::new();
        for chunk in chunks.chunks.iter().cloned() {
            let engine = Arc::clone(self);
            let stt_token = stt_token.clone();
            let semaphore = Arc::clone(&semaphore);
            let state = Arc::clone(&state);
            let first_error = Arc::clone(&first_error);

            join_set.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = stt_token.cancelled() => return,
                };

                let outcome = tokio::select! {
                    result = tokio::time::timeout(
                        engine.settings.chunk_timeout,
                        engine.stt.transcribe(&chunk.path),
                    ) => match result {
                        Ok(Ok(text)) => Ok(text),
                        Ok(Err(e)) => Err(WorkerError::Provider(e)),
                        Err(_) => Err(WorkerError::ChunkTimeout(
                            engine.settings.chunk_timeout.as_secs(),
                        )),
                    },
                    _ = stt_token.cancelled() => return,
                };

                match outcome {
                    Err(e) => {
                        let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                        if slot.is_none() {
                            *slot = Some(e);
                            drop(slot);
                            // Fail fast: abort sibling transcriptions.
                            stt_token.cancel();
                        }
                    }
                    Ok(text) => {
                        engine.record_chunk(id, &state, chunk.index, text).await;
                    }
                }
            });
        }

        while join_set.join_next().await.is_some() {}

        let failure = if token.is_cancelled() {
            Some(WorkerError::Cancelled)
        } else {
            first_error.lock().unwrap_or_else(|p| p.into_inner()).take()
        };
        if let Some(e) = failure {
            drop(chunks);
            self.handle_error(token, message, e).await;
            return;
        }

        let transcript = {
            let state = state.lock().await;
            state.cumulative.clone()
        };
        drop(chunks);

        let summary_message = TaskMessage::summary(
            id,
            &message.creator_id,
            &transcript,
            message.config.clone(),
        );
        if let Err(e) = self
            .store
            .save_transcript_and_enqueue_summary(id, &transcript, &summary_message)
            .await
        {
            self.handle_error(token, message, WorkerError::Store(e)).await;
            return;
        }

        self.publish_event(&ProgressEvent::progress(
            id,
            75,
            "transcription complete, preparing summary",
        ))
        .await;

        self.cleanup_upload(&file_path).await;
    }

    /// Records a completed chunk and, when it fills the next-in-order gap,
    /// advances through every contiguously completed chunk, emitting one
    /// cumulative update and refreshing the replay buffer. Out-of-order
    /// completions emit nothing until the gap fills.
    async fn record_chunk(&self, id: Uuid, state: &Mutex<StreamState>, index: usize, text: String) {
        let cumulative = {
            let mut guard = state.lock().await;
            let StreamState {
                transcripts,
                next_to_stream,
                cumulative,
            } = &mut *guard;

            transcripts[index] = Some(text);
            if index != *next_to_stream {
                return;
            }
            while let Some(Some(next)) = transcripts.get(*next_to_stream) {
                *cumulative = merge_transcripts(cumulative, next);
                *next_to_stream += 1;
            }
            cumulative.clone()
        };

        self.emit_transcript_update(id, &cumulative).await;
    }

    async fn publish_event(&self, event: &ProgressEvent) {
        let payload = event.to_json();
        if let Err(e) = self
            .bus
            .publish(&progress_channel(event.task_id), &payload)
            .await
        {
            warn!(task_id = %event.task_id, "Progress publish failed: {}", e);
        }
    }

    async fn emit_transcript_update(&self, id: Uuid, cumulative: &str) {
        self.publish_event(&ProgressEvent::transcript_update(id, cumulative))
            .await;
        if let Err(e) = self
            .replay
            .write_transcript(id, cumulative, self.settings.replay_ttl)
            .await
        {
            warn!(task_id = %id, "Transcript replay write failed: {}", e);
        }
    }

    // --- SUMMARY stage ---

    async fn handle_summary(self: &Arc<Self>, token: &CancelToken, message: &TaskMessage) {
        let id = message.task_id;
        info!(task_id = %id, "Processing SUMMARY task");

        // Redelivery guard: the task must still be processing. A refusal
        // means this is a duplicate delivery (or the task was cancelled) and
        // the LLM must not run again.
        match self.store.touch_processing(id).await {
            Ok(()) => {}
            Err(StoreError::StateConflict { .. }) => {
                debug!(task_id = %id, "SUMMARY pickup refused, abandoning delivery");
                return;
            }
            Err(e) => {
                error!(task_id = %id, "SUMMARY pickup failed: {}", e);
                return;
            }
        }

        self.publish_event(&ProgressEvent::progress(id, 80, "summarizing"))
            .await;

        let transcript = message.transcript.clone().unwrap_or_default();
        if transcript.is_empty() {
            self.handle_error(token, message, WorkerError::Provider(
                crate::error::ProviderError::InvalidInput("SUMMARY message carries no transcript".into()),
            ))
            .await;
            return;
        }

        let prompt = if message.config.summary_prompt.is_empty() {
            None
        } else {
            Some(message.config.summary_prompt.as_str())
        };

        let mut stream = match self.llm.summarize_stream(&transcript, prompt).await {
            Ok(stream) => stream,
            Err(e) => {
                self.handle_error(token, message, WorkerError::Provider(e)).await;
                return;
            }
        };

        let mut accumulated = String::new();
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => {
                    self.handle_error(token, message, WorkerError::Cancelled).await;
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delta)) => {
                    accumulated.push_str(&delta);
                    self.publish_event(&ProgressEvent::summary_chunk(id, &delta))
                        .await;
                    if let Err(e) = self
                        .replay
                        .write_summary(id, &accumulated, self.settings.replay_ttl)
                        .await
                    {
                        warn!(task_id = %id, "Summary replay write failed: {}", e);
                    }
                }
                Some(Err(e)) => {
                    self.handle_error(token, message, WorkerError::Provider(e)).await;
                    return;
                }
                None => break,
            }
        }

        match self.store.complete_with_summary(id, &accumulated).await {
            Ok(()) => {
                self.publish_event(&ProgressEvent::completed(id)).await;
                info!(task_id = %id, "Task completed");
            }
            Err(StoreError::StateConflict { .. }) => {
                // Another actor finished the task first; no terminal event.
                debug!(task_id = %id, "Completion refused, abandoning delivery");
            }
            Err(e) => {
                error!(task_id = %id, "Failed to complete task: {}", e);
            }
        }
    }

    // --- error disposition ---

    /// Routes a task failure to its terminal state and event. Cancellation
    /// is recognized from the task token, not the error chain, and carries
    /// no detail beyond "cancelled".
    async fn handle_error(&self, token: &CancelToken, message: &TaskMessage, err: WorkerError) {
        let id = message.task_id;
        let cancelled = matches!(err, WorkerError::Cancelled) || token.is_cancelled();

        if cancelled {
            info!(task_id = %id, "Task cancelled");
            // The control plane usually wrote `cancelled` already; this write
            // is the idempotent worker-side half and may legitimately no-op.
            match self
                .store
                .transition(
                    id,
                    TaskStatus::Processing,
                    TaskStatus::Cancelled,
                    Some("cancelled"),
                )
                .await
            {
                Ok(()) | Err(StoreError::StateConflict { .. }) => {}
                Err(e) => error!(task_id = %id, "Cancel transition failed: {}", e),
            }
            self.publish_event(&ProgressEvent::cancelled(id)).await;
        } else {
            let detail = err.to_string();
            error!(task_id = %id, "Task failed: {}", detail);
            match self
                .store
                .transition(id, TaskStatus::Processing, TaskStatus::Failed, Some(&detail))
                .await
            {
                Ok(()) => {
                    self.publish_event(&ProgressEvent::failed(id, &detail)).await;
                }
                Err(StoreError::StateConflict { .. }) => {
                    // Another actor already moved the task; it owns the
                    // terminal event.
                    debug!(task_id = %id, "Failure transition refused");
                }
                Err(e) => error!(task_id = %id, "Failure transition errored: {}", e),
            }
        }

        if message.kind == TaskKind::Stt {
            if let Some(path) = &message.file_path {
                self.cleanup_upload(path).await;
            }
        }
    }

    /// Deletes the uploaded source file; idempotent.
    async fn cleanup_upload(&self, path: &str) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove upload {}: {}", path, e);
            }
        }
    }
}
