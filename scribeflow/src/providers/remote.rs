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

//! OpenAI-compatible remote providers.
//!
//! STT posts the chunk as multipart/form-data to an `audio/transcriptions`
//! endpoint; the summarizer posts to a `chat/completions` endpoint with
//! `stream: true` and parses the SSE response line by line, yielding each
//! `choices[0].delta.content` fragment.

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;

use super::{SpeechToText, Summarizer, SummaryStream};

const DEFAULT_SUMMARY_PROMPT: &str = "Summarize the following audio transcript:";
const SYSTEM_PROMPT: &str = "You are a helpful assistant that summarizes audio transcripts.";

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    stream: bool,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

/// Remote speech-to-text client.
pub struct RemoteSpeechToText {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl RemoteSpeechToText {
    pub fn new(url: &str, model: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl SpeechToText for RemoteSpeechToText {
    async fn transcribe(&self, audio_path: &Path) -> Result<String, ProviderError> {
        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|e| ProviderError::Io(e.to_string()))?;
        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let mut request = self.client.post(&self.url).multipart(form);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        Ok(parsed.text)
    }
}

/// Remote streaming summarizer.
pub struct RemoteSummarizer {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    default_prompt: String,
}

impl RemoteSummarizer {
    pub fn new(url: &str, model: &str, api_key: &str, default_prompt: &str) -> Self {
        let default_prompt = if default_prompt.is_empty() {
            DEFAULT_SUMMARY_PROMPT.to_string()
        } else {
            default_prompt.to_string()
        };
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            default_prompt,
        }
    }
}

struct SseState {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buffer: String,
    ready: VecDeque<String>,
    done: bool,
}

/// Parses one SSE `data:` payload, returning the delta content if present.
fn parse_delta(data: &str) -> Option<String> {
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty())
}

/// Splits complete lines out of `buffer`, queueing parsed deltas. Returns
/// `true` when the `[DONE]` sentinel was seen.
fn drain_lines(buffer: &mut String, ready: &mut VecDeque<String>) -> bool {
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim_end();
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            return true;
        }
        if let Some(content) = parse_delta(data) {
            ready.push_back(content);
        }
    }
    false
}

#[async_trait]
impl Summarizer for RemoteSummarizer {
    async fn summarize_stream(
        &self,
        transcript: &str,
        prompt: Option<&str>,
    ) -> Result<SummaryStream, ProviderError> {
        let prompt = match prompt {
            Some(p) if !p.is_empty() => p,
            _ => self.default_prompt.as_str(),
        };

        let request_body = ChatRequest {
            model: self.model.clone(),
            stream: true,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!("{}\n\n{}", prompt, transcript),
                },
            ],
        };

        let mut request = self.client.post(&self.url).json(&request_body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        debug!("LLM stream opened");
        let state = SseState {
            body: response
                .bytes_stream()
                .map(|result| result.map(|bytes| bytes.to_vec()))
                .boxed(),
            buffer: String::new(),
            ready: VecDeque::new(),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(chunk) = state.ready.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.done {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&bytes));
                        if drain_lines(&mut state.buffer, &mut state.ready) {
                            state.done = true;
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(ProviderError::Stream(e.to_string())), state));
                    }
                    None => {
                        state.done = true;
                    }
                }
            }
        })
        .boxed();

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delta_content() {
        let data = r#"{"choices":[{"delta":{"content":"Sum"}}]}"#;
        assert_eq!(parse_delta(data).as_deref(), Some("Sum"));

        // Role-only frames and malformed lines produce nothing.
        assert!(parse_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).is_none());
        assert!(parse_delta("not json").is_none());
    }

    #[test]
    fn drains_lines_across_partial_buffers() {
        let mut buffer = String::new();
        let mut ready = VecDeque::new();

        buffer.push_str("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\ndata: {\"cho");
        assert!(!drain_lines(&mut buffer, &mut ready));
        assert_eq!(ready.pop_front().as_deref(), Some("Hel"));
        // The split line stays buffered until its newline arrives.
        assert!(ready.is_empty());

        buffer.push_str("ices\":[{\"delta\":{\"content\":\"lo\"}}]}\ndata: [DONE]\n");
        assert!(drain_lines(&mut buffer, &mut ready));
        assert_eq!(ready.pop_front().as_deref(), Some("lo"));
    }
}
