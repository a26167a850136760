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

//! Progress events published on the event bus and forwarded to SSE clients.
//!
//! Channel conventions: `progress:{taskId}` carries [`ProgressEvent`] JSON,
//! `cancel_channel` carries [`CancelSignal`] JSON. The bus is not a system of
//! record; lost events are tolerated by the replay buffers and the terminal
//! state in the database.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel carrying cancellation signals from the control plane to workers.
pub const CANCEL_CHANNEL: &str = "cancel_channel";

/// Pattern matching every per-task progress channel.
pub const PROGRESS_PATTERN: &str = "progress:*";

/// Name of the progress channel for one task.
pub fn progress_channel(task_id: Uuid) -> String {
    format!("progress:{}", task_id)
}

/// Extracts the task id portion of a `progress:{taskId}` channel name.
pub fn task_id_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix("progress:")
}

/// Payload published on [`CANCEL_CHANNEL`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSignal {
    pub task_id: Uuid,
}

/// A progress event for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Percent in `[0, 100]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ProgressEvent {
    pub fn progress(task_id: Uuid, percent: u8, message: &str) -> Self {
        Self {
            task_id,
            kind: "progress".into(),
            status: Some("processing".into()),
            progress: Some(percent),
            message: Some(message.to_string()),
            content: None,
        }
    }

    /// Full cumulative transcript so far; clients replace their view.
    pub fn transcript_update(task_id: Uuid, content: &str) -> Self {
        Self {
            task_id,
            kind: "transcript_update".into(),
            status: None,
            progress: None,
            message: None,
            content: Some(content.to_string()),
        }
    }

    /// A single summary delta; clients append.
    pub fn summary_chunk(task_id: Uuid, content: &str) -> Self {
        Self {
            task_id,
            kind: "summary_chunk".into(),
            status: None,
            progress: None,
            message: None,
            content: Some(content.to_string()),
        }
    }

    pub fn completed(task_id: Uuid) -> Self {
        Self {
            task_id,
            kind: "completed".into(),
            status: None,
            progress: None,
            message: None,
            content: None,
        }
    }

    pub fn failed(task_id: Uuid, message: &str) -> Self {
        Self {
            task_id,
            kind: "failed".into(),
            status: Some("failed".into()),
            progress: None,
            message: Some(message.to_string()),
            content: None,
        }
    }

    /// Cancelled events carry no error text beyond "cancelled".
    pub fn cancelled(task_id: Uuid) -> Self {
        Self {
            task_id,
            kind: "cancelled".into(),
            status: Some("cancelled".into()),
            progress: None,
            message: Some("cancelled".into()),
            content: None,
        }
    }

    pub fn to_json(&self) -> String {
        // ProgressEvent contains only JSON-representable fields.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_round_trip() {
        let id = Uuid::new_v4();
        let channel = progress_channel(id);
        assert_eq!(task_id_from_channel(&channel), Some(id.to_string().as_str()));
        assert_eq!(task_id_from_channel("cancel_channel"), None);
    }

    #[test]
    fn progress_event_wire_shape() {
        let id = Uuid::new_v4();
        let json: serde_json::Value =
            serde_json::from_str(&ProgressEvent::progress(id, 30, "transcribing").to_json())
                .unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["status"], "processing");
        assert_eq!(json["progress"], 30);
        assert_eq!(json["message"], "transcribing");
        assert!(json.get("content").is_none());
    }

    #[test]
    fn cancelled_event_carries_no_detail() {
        let json: serde_json::Value =
            serde_json::from_str(&ProgressEvent::cancelled(Uuid::new_v4()).to_json()).unwrap();
        assert_eq!(json["type"], "cancelled");
        assert_eq!(json["message"], "cancelled");
    }
}
