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

//! Mock providers.
//!
//! Simulate realistic latency and streaming behavior so the full pipeline
//! can be exercised without provider credentials. The STT mock verifies the
//! chunk path actually exists, which catches wiring mistakes in the worker.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;

use crate::error::ProviderError;

use super::{SpeechToText, Summarizer, SummaryStream};

const MOCK_TRANSCRIPT: &str =
    "This is a simulated transcription of the uploaded audio. It covers a short \
     discussion about the system architecture and its design trade-offs.";

const MOCK_SUMMARY_CHUNKS: &[&str] = &[
    "Summary: ",
    "the recording walks through ",
    "the service architecture, ",
    "covering the gateway, ",
    "the work queue, ",
    "and the worker pipeline.",
    "\n\nKey points:\n",
    "1. asynchronous task processing;\n",
    "2. streamed partial results;\n",
    "3. atomic state management.",
];

fn jitter_ms(base: u64, spread: u64) -> Duration {
    let extra = rand::thread_rng().gen_range(0..spread);
    Duration::from_millis(base + extra)
}

/// Mock STT: fixed text after a short randomized delay.
#[derive(Debug, Clone, Default)]
pub struct MockSpeechToText;

impl MockSpeechToText {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SpeechToText for MockSpeechToText {
    async fn transcribe(&self, audio_path: &Path) -> Result<String, ProviderError> {
        if audio_path.as_os_str().is_empty() {
            return Err(ProviderError::InvalidInput("file path is empty".into()));
        }
        tokio::fs::metadata(audio_path).await.map_err(|_| {
            ProviderError::InvalidInput(format!("file not found at {}", audio_path.display()))
        })?;

        tokio::time::sleep(jitter_ms(400, 400)).await;
        Ok(MOCK_TRANSCRIPT.to_string())
    }
}

/// Mock LLM: streams fixed chunks with per-chunk delays.
#[derive(Debug, Clone, Default)]
pub struct MockSummarizer;

impl MockSummarizer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize_stream(
        &self,
        transcript: &str,
        _prompt: Option<&str>,
    ) -> Result<SummaryStream, ProviderError> {
        if transcript.is_empty() {
            return Err(ProviderError::InvalidInput("input text is empty".into()));
        }

        let stream = futures::stream::iter(MOCK_SUMMARY_CHUNKS)
            .then(|chunk| async move {
                tokio::time::sleep(jitter_ms(50, 100)).await;
                Ok(chunk.to_string())
            })
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stt_rejects_missing_file() {
        let stt = MockSpeechToText::new();
        let err = stt
            .transcribe(Path::new("/nonexistent/audio.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn summarizer_streams_all_chunks_in_order() {
        let llm = MockSummarizer::new();
        let mut stream = llm.summarize_stream("some transcript", None).await.unwrap();

        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(&chunk.unwrap());
        }
        assert!(collected.starts_with("Summary: "));
        assert!(collected.ends_with("atomic state management."));
    }

    #[tokio::test]
    async fn summarizer_rejects_empty_input() {
        let llm = MockSummarizer::new();
        assert!(llm.summarize_stream("", None).await.is_err());
    }
}
