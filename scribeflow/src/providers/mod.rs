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

//! STT and LLM provider capabilities.
//!
//! The worker engine depends on two capability ports. Two variants satisfy
//! each: a mock for development and tests, and a remote OpenAI-compatible
//! HTTP client. The variant is selected at startup from configuration.
//!
//! The summarizer returns an ordered stream of deltas; the call site drains
//! it, and the stream ends only after the upstream stream terminates
//! (normally or with an error item).

pub mod mock;
pub mod remote;

pub use mock::{MockSpeechToText, MockSummarizer};
pub use remote::{RemoteSpeechToText, RemoteSummarizer};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::AiConfig;
use crate::error::ProviderError;

/// Ordered stream of summary deltas.
pub type SummaryStream = BoxStream<'static, Result<String, ProviderError>>;

/// Speech-to-text over one normalized audio chunk.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> Result<String, ProviderError>;
}

/// Streaming summarization of a transcript.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `prompt` overrides the provider's default instruction when non-empty.
    async fn summarize_stream(
        &self,
        transcript: &str,
        prompt: Option<&str>,
    ) -> Result<SummaryStream, ProviderError>;
}

/// Builds the provider pair selected by configuration.
pub fn from_config(config: &AiConfig) -> (Arc<dyn SpeechToText>, Arc<dyn Summarizer>) {
    if config.mock {
        tracing::info!("Mock AI providers enabled");
        (
            Arc::new(MockSpeechToText::new()),
            Arc::new(MockSummarizer::new()),
        )
    } else {
        tracing::info!("Remote AI providers enabled (STT + LLM)");
        (
            Arc::new(RemoteSpeechToText::new(
                &config.stt_url,
                &config.stt_model,
                &config.stt_api_key,
            )),
            Arc::new(RemoteSummarizer::new(
                &config.llm_url,
                &config.llm_model,
                &config.llm_api_key,
                &config.llm_prompt,
            )),
        )
    }
}
