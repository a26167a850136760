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

//! Queue message format.
//!
//! `TaskMessage` is the JSON payload carried by the `tasks` queue. STT
//! messages carry the uploaded file path; SUMMARY messages carry the
//! transcript. Queue messages are advisory work triggers only; the database
//! is the source of truth for task state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which pipeline stage a message triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskKind {
    Stt,
    Summary,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Stt => "STT",
            TaskKind::Summary => "SUMMARY",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STT" => Ok(TaskKind::Stt),
            "SUMMARY" => Ok(TaskKind::Summary),
            other => Err(format!("unknown task kind '{}'", other)),
        }
    }
}

/// Per-task provider configuration, forwarded through both stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub stt_model: String,
    #[serde(default)]
    pub summary_prompt: String,
}

/// A unit of work on the `tasks` queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub creator_id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default)]
    pub config: TaskConfig,
}

impl TaskMessage {
    /// Builds the STT message dispatched when a task is created.
    pub fn stt(task_id: Uuid, creator_id: &str, file_path: &str, config: TaskConfig) -> Self {
        Self {
            task_id,
            creator_id: creator_id.to_string(),
            kind: TaskKind::Stt,
            file_path: Some(file_path.to_string()),
            transcript: None,
            config,
        }
    }

    /// Builds the follow-on SUMMARY message carrying the finished transcript.
    pub fn summary(task_id: Uuid, creator_id: &str, transcript: &str, config: TaskConfig) -> Self {
        Self {
            task_id,
            creator_id: creator_id.to_string(),
            kind: TaskKind::Summary,
            file_path: None,
            transcript: Some(transcript.to_string()),
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_camel_case_and_uppercase_kind() {
        let msg = TaskMessage::stt(
            Uuid::nil(),
            "user-1",
            "/data/uploads/a.ogg",
            TaskConfig {
                language: "en".into(),
                stt_model: "whisper-1".into(),
                summary_prompt: String::new(),
            },
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "STT");
        assert_eq!(json["taskId"], Uuid::nil().to_string());
        assert_eq!(json["creatorId"], "user-1");
        assert_eq!(json["filePath"], "/data/uploads/a.ogg");
        assert_eq!(json["config"]["sttModel"], "whisper-1");
        assert!(json.get("transcript").is_none());
    }

    #[test]
    fn summary_message_round_trips() {
        let msg = TaskMessage::summary(Uuid::new_v4(), "u", "hello world", TaskConfig::default());
        let json = serde_json::to_string(&msg).unwrap();
        let back: TaskMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.kind, TaskKind::Summary);
    }
}
