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

//! End-to-end pipeline tests over the in-memory implementations.
//!
//! These exercise the decoupled flow the way production runs it: the control
//! plane writes task + outbox, the relay drains the outbox to the queue, the
//! worker engine consumes messages and publishes progress, and clients
//! observe events through the bus.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use scribeflow::audio::{AudioChunker, Chunk, ChunkSet};
use scribeflow::bus::{BusSubscription, EventBus, MemoryEventBus};
use scribeflow::error::{ChunkError, ProviderError};
use scribeflow::models::{
    OutboxKind, OutboxStatus, ProgressEvent, TaskConfig, TaskKind, TaskStatus, PROGRESS_PATTERN,
};
use scribeflow::providers::{SpeechToText, Summarizer, SummaryStream};
use scribeflow::queue::MemoryQueue;
use scribeflow::replay::{MemoryReplayStore, ReplayStore};
use scribeflow::store::{MemoryStore, TaskStore};
use scribeflow::worker::EngineSettings;
use scribeflow::{CancelToken, OutboxRelay, TaskControl, WorkerEngine};

// --- test doubles ---

/// Splits any input into a fixed number of chunk descriptors without
/// touching the filesystem; the paths encode the chunk index for the STT
/// stub.
struct StubChunker {
    chunk_count: usize,
    fail: bool,
}

#[async_trait]
impl AudioChunker for StubChunker {
    async fn split(&self, input: &Path, _max_chunk_secs: f64) -> Result<ChunkSet, ChunkError> {
        if self.fail {
            return Err(ChunkError::Probe("simulated probe failure".into()));
        }
        let chunks = (0..self.chunk_count)
            .map(|index| Chunk {
                index,
                path: PathBuf::from(format!("{}.chunk{}", input.display(), index)),
            })
            .collect();
        Ok(ChunkSet::unmanaged(chunks))
    }
}

/// Per-chunk scripted STT: text, delay, or failure, keyed by the chunk index
/// embedded in the path.
#[derive(Clone)]
struct StubStt {
    texts: Vec<&'static str>,
    delays_ms: Vec<u64>,
    fail_index: Option<usize>,
    hang_index: Option<usize>,
}

impl StubStt {
    fn uniform(texts: Vec<&'static str>) -> Self {
        let delays = vec![0; texts.len()];
        Self {
            texts,
            delays_ms: delays,
            fail_index: None,
            hang_index: None,
        }
    }

    fn chunk_index(path: &Path) -> usize {
        let name = path.to_string_lossy();
        name.rsplit("chunk")
            .next()
            .and_then(|s| s.parse().ok())
            .expect("stub chunk path carries its index")
    }
}

#[async_trait]
impl SpeechToText for StubStt {
    async fn transcribe(&self, audio_path: &Path) -> Result<String, ProviderError> {
        let index = Self::chunk_index(audio_path);
        if Some(index) == self.hang_index {
            // Parks until the engine cancels the call.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::time::sleep(Duration::from_millis(self.delays_ms[index])).await;
        if Some(index) == self.fail_index {
            return Err(ProviderError::Api {
                status: 500,
                body: "simulated STT outage".into(),
            });
        }
        Ok(self.texts[index].to_string())
    }
}

/// Streams scripted summary chunks.
#[derive(Clone)]
struct StubLlm {
    chunks: Vec<&'static str>,
}

#[async_trait]
impl Summarizer for StubLlm {
    async fn summarize_stream(
        &self,
        transcript: &str,
        _prompt: Option<&str>,
    ) -> Result<SummaryStream, ProviderError> {
        assert!(!transcript.is_empty(), "engine must pass the transcript");
        let chunks: Vec<Result<String, ProviderError>> =
            self.chunks.iter().map(|c| Ok(c.to_string())).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

// --- harness ---

struct Harness {
    store: Arc<MemoryStore>,
    bus: Arc<MemoryEventBus>,
    replay: Arc<MemoryReplayStore>,
    queue: Arc<MemoryQueue>,
    control: TaskControl,
    engine: Arc<WorkerEngine>,
    relay: OutboxRelay,
}

fn harness(chunker: StubChunker, stt: StubStt, llm: StubLlm) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(MemoryEventBus::new());
    let replay = Arc::new(MemoryReplayStore::new());
    let queue = Arc::new(MemoryQueue::new());

    let control = TaskControl::new(store.clone(), replay.clone(), bus.clone());
    let engine = Arc::new(WorkerEngine::new(
        store.clone(),
        bus.clone(),
        replay.clone(),
        Arc::new(stt),
        Arc::new(llm),
        Arc::new(chunker),
        EngineSettings::default(),
    ));
    let relay = OutboxRelay::new(store.clone(), queue.clone(), Duration::from_millis(10), 32);

    Harness {
        store,
        bus,
        replay,
        queue,
        control,
        engine,
        relay,
    }
}

/// Creates a real temp file standing in for the uploaded audio.
fn seed_upload() -> PathBuf {
    let path = std::env::temp_dir().join(format!("scribeflow-upload-{}.ogg", uuid::Uuid::new_v4()));
    std::fs::write(&path, b"not really audio").expect("seed upload");
    path
}

async fn next_event(sub: &mut BusSubscription) -> ProgressEvent {
    let msg = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("timed out waiting for progress event")
        .expect("bus subscription closed");
    serde_json::from_str(&msg.payload).expect("progress event JSON")
}

async fn expect_no_event(sub: &mut BusSubscription) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), sub.next()).await;
    assert!(outcome.is_err(), "unexpected event: {:?}", outcome);
}

// --- scenarios ---

#[tokio::test]
async fn happy_path_streams_events_in_order_and_completes() {
    let h = harness(
        StubChunker {
            chunk_count: 1,
            fail: false,
        },
        StubStt::uniform(vec!["hello world"]),
        StubLlm {
            chunks: vec!["Sum", "mary", "."],
        },
    );
    let upload = seed_upload();
    let mut events = h.bus.pattern_subscribe(PROGRESS_PATTERN).await.unwrap();

    let id = h
        .control
        .create("user-1", &upload.to_string_lossy(), TaskConfig::default())
        .await
        .unwrap();

    // Relay dispatches the STT job; the worker runs it.
    assert_eq!(h.relay.drain_once().await.unwrap(), 1);
    let stt_message = h.queue.try_pop().expect("STT message on the queue");
    assert_eq!(stt_message.kind, TaskKind::Stt);
    h.engine.clone().process(stt_message).await;

    // Transcript persisted atomically with the SUMMARY outbox row.
    let result = h.store.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.transcript, "hello world");
    let outbox = h.store.outbox_events().await;
    assert_eq!(outbox.len(), 2);
    assert_eq!(outbox[1].kind, OutboxKind::Summary);

    // Relay dispatches the SUMMARY job; the worker completes the task.
    assert_eq!(h.relay.drain_once().await.unwrap(), 1);
    let summary_message = h.queue.try_pop().expect("SUMMARY message on the queue");
    assert_eq!(summary_message.kind, TaskKind::Summary);
    assert_eq!(summary_message.transcript.as_deref(), Some("hello world"));
    h.engine.clone().process(summary_message).await;

    let task = h.store.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let result = h.store.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.summary, "Summary.");

    // The uploaded source file is gone; every outbox row is sent.
    assert!(!upload.exists());
    assert!(h
        .store
        .outbox_events()
        .await
        .iter()
        .all(|e| e.status == OutboxStatus::Sent));

    // Client-visible event order, exactly as streamed.
    let expectations: Vec<(&str, Option<u8>, Option<&str>)> = vec![
        ("progress", Some(10), None),
        ("progress", Some(30), None),
        ("transcript_update", None, Some("hello world")),
        ("progress", Some(75), None),
        ("progress", Some(80), None),
        ("summary_chunk", None, Some("Sum")),
        ("summary_chunk", None, Some("mary")),
        ("summary_chunk", None, Some(".")),
        ("completed", None, None),
    ];
    for (kind, progress, content) in expectations {
        let event = next_event(&mut events).await;
        assert_eq!(event.kind, kind);
        if let Some(progress) = progress {
            assert_eq!(event.progress, Some(progress), "at {}", kind);
        }
        if let Some(content) = content {
            assert_eq!(event.content.as_deref(), Some(content), "at {}", kind);
        }
    }
    expect_no_event(&mut events).await;

    // Replay buffers carry the cumulative texts for reconnecting clients.
    assert_eq!(
        h.replay.read_transcript(id).await.unwrap().as_deref(),
        Some("hello world")
    );
    assert_eq!(
        h.replay.read_summary(id).await.unwrap().as_deref(),
        Some("Summary.")
    );
}

#[tokio::test]
async fn out_of_order_chunks_emit_one_cumulative_merged_update() {
    let mut stt = StubStt::uniform(vec![
        "the quick brown fox jumps over",
        "jumps over the lazy dog",
    ]);
    // Chunk 1 finishes well before chunk 0.
    stt.delays_ms = vec![150, 0];

    let h = harness(
        StubChunker {
            chunk_count: 2,
            fail: false,
        },
        stt,
        StubLlm {
            chunks: vec!["ok"],
        },
    );
    let upload = seed_upload();
    let mut events = h.bus.pattern_subscribe(PROGRESS_PATTERN).await.unwrap();

    h.control
        .create("user-1", &upload.to_string_lossy(), TaskConfig::default())
        .await
        .unwrap();
    h.relay.drain_once().await.unwrap();
    h.engine.clone().process(h.queue.try_pop().unwrap()).await;

    // progress(10), progress(30), then exactly one transcript_update: the
    // out-of-order completion waited for the gap to fill, and the merge
    // de-duplicated the overlap.
    let mut transcript_updates = Vec::new();
    loop {
        let event = next_event(&mut events).await;
        match event.kind.as_str() {
            "transcript_update" => transcript_updates.push(event.content.unwrap()),
            "progress" if event.progress == Some(75) => break,
            _ => {}
        }
    }
    assert_eq!(
        transcript_updates,
        vec!["the quick brown fox jumps over the lazy dog".to_string()]
    );
}

#[tokio::test]
async fn in_order_chunks_emit_prefix_monotone_updates() {
    let h = harness(
        StubChunker {
            chunk_count: 3,
            fail: false,
        },
        StubStt {
            texts: vec!["first part.", "second part.", "third part."],
            delays_ms: vec![0, 40, 80],
            fail_index: None,
            hang_index: None,
        },
        StubLlm {
            chunks: vec!["ok"],
        },
    );
    let upload = seed_upload();
    let mut events = h.bus.pattern_subscribe(PROGRESS_PATTERN).await.unwrap();

    h.control
        .create("user-1", &upload.to_string_lossy(), TaskConfig::default())
        .await
        .unwrap();
    h.relay.drain_once().await.unwrap();
    h.engine.clone().process(h.queue.try_pop().unwrap()).await;

    let mut updates = Vec::new();
    loop {
        let event = next_event(&mut events).await;
        match event.kind.as_str() {
            "transcript_update" => updates.push(event.content.unwrap()),
            "progress" if event.progress == Some(75) => break,
            _ => {}
        }
    }

    // Successive updates extend one another.
    assert!(!updates.is_empty());
    for pair in updates.windows(2) {
        assert!(
            pair[1].starts_with(pair[0].as_str()),
            "{:?} does not extend {:?}",
            pair[1],
            pair[0]
        );
    }
    assert_eq!(updates.last().unwrap(), "first part. second part. third part.");
}

#[tokio::test]
async fn cancel_during_stt_aborts_and_cleans_up() {
    let mut stt = StubStt::uniform(vec!["a", "b", "c"]);
    stt.hang_index = Some(1);

    let h = harness(
        StubChunker {
            chunk_count: 3,
            fail: false,
        },
        stt,
        StubLlm { chunks: vec![] },
    );
    let upload = seed_upload();
    let mut events = h.bus.pattern_subscribe(PROGRESS_PATTERN).await.unwrap();

    let shutdown = CancelToken::new();
    tokio::spawn(h.engine.clone().run_cancellation_listener(shutdown.clone()));

    let id = h
        .control
        .create("user-1", &upload.to_string_lossy(), TaskConfig::default())
        .await
        .unwrap();
    h.relay.drain_once().await.unwrap();

    let worker = tokio::spawn(h.engine.clone().process(h.queue.try_pop().unwrap()));

    // Wait until the task is actually in flight, then cancel it.
    let first = next_event(&mut events).await;
    assert_eq!(first.kind, "progress");
    // Give the cancellation listener a beat to subscribe.
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.control.cancel(id, "user-1").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker should unwind after cancellation")
        .unwrap();

    assert_eq!(h.store.task(id).await.unwrap().status, TaskStatus::Cancelled);
    assert!(!upload.exists(), "cancelled task must remove its upload");

    // The client sees `cancelled` and never `completed`.
    let mut saw_cancelled = false;
    loop {
        let msg = tokio::time::timeout(Duration::from_millis(300), events.next()).await;
        match msg {
            Ok(Some(raw)) => {
                let event: ProgressEvent = serde_json::from_str(&raw.payload).unwrap();
                assert_ne!(event.kind, "completed");
                if event.kind == "cancelled" {
                    saw_cancelled = true;
                }
            }
            _ => break,
        }
    }
    assert!(saw_cancelled);
    shutdown.cancel();
}

#[tokio::test]
async fn stt_chunk_failure_fails_the_task_and_skips_summary() {
    let mut stt = StubStt::uniform(vec!["a", "b", "c"]);
    stt.fail_index = Some(0);
    stt.delays_ms = vec![0, 50, 50];

    let h = harness(
        StubChunker {
            chunk_count: 3,
            fail: false,
        },
        stt,
        StubLlm { chunks: vec![] },
    );
    let upload = seed_upload();
    let mut events = h.bus.pattern_subscribe(PROGRESS_PATTERN).await.unwrap();

    let id = h
        .control
        .create("user-1", &upload.to_string_lossy(), TaskConfig::default())
        .await
        .unwrap();
    h.relay.drain_once().await.unwrap();
    h.engine.clone().process(h.queue.try_pop().unwrap()).await;

    let task = h.store.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("simulated STT outage"));
    assert!(!upload.exists());

    // No SUMMARY outbox row was enqueued.
    let outbox = h.store.outbox_events().await;
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].kind, OutboxKind::Stt);

    let mut saw_failed = false;
    loop {
        let msg = tokio::time::timeout(Duration::from_millis(300), events.next()).await;
        match msg {
            Ok(Some(raw)) => {
                let event: ProgressEvent = serde_json::from_str(&raw.payload).unwrap();
                if event.kind == "failed" {
                    saw_failed = true;
                }
            }
            _ => break,
        }
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn chunking_failure_fails_the_task() {
    let h = harness(
        StubChunker {
            chunk_count: 0,
            fail: true,
        },
        StubStt::uniform(vec![]),
        StubLlm { chunks: vec![] },
    );
    let upload = seed_upload();

    let id = h
        .control
        .create("user-1", &upload.to_string_lossy(), TaskConfig::default())
        .await
        .unwrap();
    h.relay.drain_once().await.unwrap();
    h.engine.clone().process(h.queue.try_pop().unwrap()).await;

    let task = h.store.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(!upload.exists());
}

#[tokio::test]
async fn redelivered_messages_are_no_ops() {
    let h = harness(
        StubChunker {
            chunk_count: 1,
            fail: false,
        },
        StubStt::uniform(vec!["hello world"]),
        StubLlm {
            chunks: vec!["Sum", "mary", "."],
        },
    );
    let upload = seed_upload();

    let id = h
        .control
        .create("user-1", &upload.to_string_lossy(), TaskConfig::default())
        .await
        .unwrap();
    h.relay.drain_once().await.unwrap();
    let stt_message = h.queue.try_pop().unwrap();
    h.engine.clone().process(stt_message.clone()).await;
    h.relay.drain_once().await.unwrap();
    let summary_message = h.queue.try_pop().unwrap();
    h.engine.clone().process(summary_message.clone()).await;
    assert_eq!(h.store.task(id).await.unwrap().status, TaskStatus::Completed);

    let mut events = h.bus.pattern_subscribe(PROGRESS_PATTERN).await.unwrap();

    // Redelivering either stage finds its conditional guard refused and
    // emits nothing; state and results are untouched.
    h.engine.clone().process(stt_message).await;
    h.engine.clone().process(summary_message).await;
    expect_no_event(&mut events).await;

    let task = h.store.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let result = h.store.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.transcript, "hello world");
    assert_eq!(result.summary, "Summary.");
}

#[tokio::test]
async fn relay_retries_rows_whose_publish_failed() {
    let h = harness(
        StubChunker {
            chunk_count: 1,
            fail: false,
        },
        StubStt::uniform(vec!["x"]),
        StubLlm { chunks: vec![] },
    );
    let upload = seed_upload();

    h.control
        .create("user-1", &upload.to_string_lossy(), TaskConfig::default())
        .await
        .unwrap();

    // Broker down: the row stays pending.
    h.queue.set_failing(true);
    assert_eq!(h.relay.drain_once().await.unwrap(), 0);
    let outbox = h.store.outbox_events().await;
    assert_eq!(outbox[0].status, OutboxStatus::Pending);
    assert!(h.queue.is_empty());

    // Broker back: the same row goes out and is marked sent.
    h.queue.set_failing(false);
    assert_eq!(h.relay.drain_once().await.unwrap(), 1);
    let outbox = h.store.outbox_events().await;
    assert_eq!(outbox[0].status, OutboxStatus::Sent);
    assert!(outbox[0].processed_at.is_some());
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn summary_redelivery_guard_blocks_double_llm_invocation() {
    let h = harness(
        StubChunker {
            chunk_count: 1,
            fail: false,
        },
        StubStt::uniform(vec!["hello"]),
        StubLlm {
            chunks: vec!["done"],
        },
    );
    let upload = seed_upload();

    let id = h
        .control
        .create("user-1", &upload.to_string_lossy(), TaskConfig::default())
        .await
        .unwrap();
    h.relay.drain_once().await.unwrap();
    h.engine.clone().process(h.queue.try_pop().unwrap()).await;
    h.relay.drain_once().await.unwrap();
    let summary_message = h.queue.try_pop().unwrap();

    h.engine.clone().process(summary_message.clone()).await;
    let completed_at = h.store.task(id).await.unwrap().updated_at;

    // The duplicate finds the task no longer `processing` and leaves it be.
    h.engine.clone().process(summary_message).await;
    let task = h.store.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.updated_at, completed_at);
}
