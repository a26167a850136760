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

//! # Scribeflow
//!
//! An asynchronous audio transcription and summarization pipeline.
//!
//! Uploaded audio becomes a transcript (STT stage) and then a streamed
//! summary (SUMMARY stage). The two stages are decoupled through a durable
//! work queue; the database couples state changes to queue dispatch via a
//! transactional outbox; and progress flows to browsers over SSE through a
//! single-subscription event multiplexer with reconnect-safe replay buffers.
//!
//! ## Architecture
//!
//! ```text
//! control API ──> tasks + outbox (Postgres) ──> outbox relay ──> queue (AMQP)
//!                                                                   │
//!                      worker engine <── consume ──────────────────┘
//!                      │        │
//!             STT / LLM providers   progress events (Redis pub/sub)
//!                                        │
//!                          broadcaster (one psubscribe per process)
//!                                        │
//!                                SSE client streams
//! ```
//!
//! State transitions are conditional updates; the queue is at-least-once and
//! handlers are idempotent, so the pipeline achieves effective exactly-once
//! state movement without distributed transactions.

pub mod audio;
pub mod broadcaster;
pub mod bus;
pub mod config;
pub mod control;
pub mod database;
pub mod error;
pub mod models;
pub mod outbox;
pub mod providers;
pub mod queue;
pub mod reaper;
pub mod replay;
pub mod sse;
pub mod store;
pub mod worker;

pub use broadcaster::Broadcaster;
pub use config::Config;
pub use control::TaskControl;
pub use database::Database;
pub use outbox::{OutboxRelay, RelayExit};
pub use reaper::Reaper;
pub use sse::StreamEndpoint;
pub use worker::{ActiveTasks, CancelToken, WorkerEngine};
