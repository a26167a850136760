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

//! PostgreSQL task store.
//!
//! Every multi-statement operation runs inside a single transaction: if any
//! statement fails, all are rolled back. Conditional transitions are plain
//! guarded UPDATEs; a zero-row result rolls the transaction back and surfaces
//! as [`StoreError::StateConflict`].

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use async_trait::async_trait;

use crate::database::schema::{outbox_events, task_results, tasks};
use crate::database::Database;
use crate::error::StoreError;
use crate::models::{OutboxKind, Task, TaskConfig, TaskMessage, TaskResult, TaskStatus};

use super::TaskStore;

/// Error carrier for transaction closures. Diesel rolls the transaction back
/// on any `Err`, and the variants map to the public error type afterwards.
#[derive(Debug)]
enum TxnError {
    Db(diesel::result::Error),
    Conflict(TaskStatus),
    MissingTranscript,
    Serialization(String),
}

impl From<diesel::result::Error> for TxnError {
    fn from(err: diesel::result::Error) -> Self {
        TxnError::Db(err)
    }
}

fn map_txn_error(task_id: Uuid, err: TxnError) -> StoreError {
    match err {
        TxnError::Db(e) => StoreError::Database(e.to_string()),
        TxnError::Conflict(expected) => StoreError::StateConflict { task_id, expected },
        TxnError::MissingTranscript => StoreError::MissingTranscript(task_id),
        TxnError::Serialization(msg) => StoreError::Serialization(msg),
    }
}

#[derive(Queryable)]
struct TaskRow {
    id: Uuid,
    user_id: String,
    status: String,
    file_path: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            user_id: row.user_id,
            status: TaskStatus::from_str(&row.status).map_err(StoreError::Database)?,
            file_path: row.file_path,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Queryable)]
struct ResultRow {
    task_id: Uuid,
    transcript: String,
    summary: String,
    updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = tasks)]
struct NewTaskRow {
    id: Uuid,
    user_id: String,
    status: String,
    file_path: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = outbox_events)]
struct NewOutboxRow {
    id: Uuid,
    aggregate_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
}

impl NewOutboxRow {
    fn from_message(aggregate_id: Uuid, kind: OutboxKind, message: &TaskMessage) -> Result<Self, TxnError> {
        let payload =
            serde_json::to_value(message).map_err(|e| TxnError::Serialization(e.to_string()))?;
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id,
            event_type: kind.as_str().to_string(),
            payload,
            status: "pending".to_string(),
            created_at: Utc::now(),
        })
    }
}

/// Upsert for `task_results` preserving whichever column the caller left
/// empty. Expressed as raw SQL because the CASE expressions are clearer than
/// the equivalent diesel upsert tree.
const UPSERT_RESULT_SQL: &str = "\
    INSERT INTO task_results (task_id, transcript, summary, updated_at) \
    VALUES ($1, $2, $3, NOW()) \
    ON CONFLICT (task_id) DO UPDATE SET \
        transcript = CASE WHEN EXCLUDED.transcript <> '' THEN EXCLUDED.transcript ELSE task_results.transcript END, \
        summary = CASE WHEN EXCLUDED.summary <> '' THEN EXCLUDED.summary ELSE task_results.summary END, \
        updated_at = NOW()";

fn upsert_result_stmt(
    conn: &mut PgConnection,
    id: Uuid,
    transcript: &str,
    summary: &str,
) -> Result<usize, diesel::result::Error> {
    diesel::sql_query(UPSERT_RESULT_SQL)
        .bind::<diesel::sql_types::Uuid, _>(id)
        .bind::<diesel::sql_types::Text, _>(transcript)
        .bind::<diesel::sql_types::Text, _>(summary)
        .execute(conn)
}

/// Data access layer for tasks, results, and outbox inserts.
#[derive(Clone)]
pub struct PgTaskStore {
    database: Database,
}

impl PgTaskStore {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create_task_with_outbox(
        &self,
        id: Uuid,
        owner: &str,
        file_path: &str,
        message: &TaskMessage,
    ) -> Result<Task, StoreError> {
        let conn = self.database.get().await?;
        let owner = owner.to_string();
        let file_path = file_path.to_string();
        let message = message.clone();

        let row: TaskRow = conn
            .interact(move |conn| {
                conn.transaction::<_, TxnError, _>(|conn| {
                    let now = Utc::now();
                    let new_task = NewTaskRow {
                        id,
                        user_id: owner,
                        status: TaskStatus::Pending.as_str().to_string(),
                        file_path: Some(file_path),
                        created_at: now,
                        updated_at: now,
                    };
                    let row: TaskRow = diesel::insert_into(tasks::table)
                        .values(&new_task)
                        .get_result(conn)?;

                    let outbox = NewOutboxRow::from_message(id, OutboxKind::Stt, &message)?;
                    diesel::insert_into(outbox_events::table)
                        .values(&outbox)
                        .execute(conn)?;

                    Ok(row)
                })
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
            .map_err(|e| map_txn_error(id, e))?;

        Task::try_from(row)
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let conn = self.database.get().await?;

        let row: Option<TaskRow> = conn
            .interact(move |conn| tasks::table.find(id).first(conn).optional())
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
            .map_err(|e| StoreError::Database(e.to_string()))?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<TaskResult>, StoreError> {
        let conn = self.database.get().await?;

        let row: Option<ResultRow> = conn
            .interact(move |conn| task_results::table.find(id).first(conn).optional())
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.map(|r| TaskResult {
            task_id: r.task_id,
            transcript: r.transcript,
            summary: r.summary,
            updated_at: r.updated_at,
        }))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.database.get().await?;
        let error_message = error_message.map(|s| s.to_string());

        let rows = conn
            .interact(move |conn| {
                diesel::update(
                    tasks::table
                        .filter(tasks::id.eq(id))
                        .filter(tasks::status.eq(from.as_str())),
                )
                .set((
                    tasks::status.eq(to.as_str()),
                    tasks::error_message.eq(error_message),
                    tasks::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if rows == 0 {
            return Err(StoreError::StateConflict {
                task_id: id,
                expected: from,
            });
        }
        Ok(())
    }

    async fn touch_processing(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.database.get().await?;

        let rows = conn
            .interact(move |conn| {
                diesel::update(
                    tasks::table
                        .filter(tasks::id.eq(id))
                        .filter(tasks::status.eq(TaskStatus::Processing.as_str())),
                )
                .set(tasks::updated_at.eq(Utc::now()))
                .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if rows == 0 {
            return Err(StoreError::StateConflict {
                task_id: id,
                expected: TaskStatus::Processing,
            });
        }
        Ok(())
    }

    async fn upsert_result(
        &self,
        id: Uuid,
        transcript: &str,
        summary: &str,
    ) -> Result<(), StoreError> {
        let conn = self.database.get().await?;
        let transcript = transcript.to_string();
        let summary = summary.to_string();

        conn.interact(move |conn| upsert_result_stmt(conn, id, &transcript, &summary))
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    async fn complete_with_summary(&self, id: Uuid, summary: &str) -> Result<(), StoreError> {
        let conn = self.database.get().await?;
        let summary = summary.to_string();

        conn.interact(move |conn| {
            conn.transaction::<_, TxnError, _>(|conn| {
                let rows = diesel::update(
                    tasks::table
                        .filter(tasks::id.eq(id))
                        .filter(tasks::status.eq(TaskStatus::Processing.as_str())),
                )
                .set((
                    tasks::status.eq(TaskStatus::Completed.as_str()),
                    tasks::error_message.eq(None::<String>),
                    tasks::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;

                if rows == 0 {
                    return Err(TxnError::Conflict(TaskStatus::Processing));
                }

                upsert_result_stmt(conn, id, "", &summary)?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
        .map_err(|e| map_txn_error(id, e))
    }

    async fn save_transcript_and_enqueue_summary(
        &self,
        id: Uuid,
        transcript: &str,
        message: &TaskMessage,
    ) -> Result<(), StoreError> {
        let conn = self.database.get().await?;
        let transcript = transcript.to_string();
        let message = message.clone();

        conn.interact(move |conn| {
            conn.transaction::<_, TxnError, _>(|conn| {
                upsert_result_stmt(conn, id, &transcript, "")?;

                let outbox = NewOutboxRow::from_message(id, OutboxKind::Summary, &message)?;
                diesel::insert_into(outbox_events::table)
                    .values(&outbox)
                    .execute(conn)?;

                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
        .map_err(|e| map_txn_error(id, e))
    }

    async fn cancel_task(&self, id: Uuid, owner: &str) -> Result<(), StoreError> {
        let conn = self.database.get().await?;
        let owner = owner.to_string();

        let rows = conn
            .interact(move |conn| {
                diesel::update(
                    tasks::table
                        .filter(tasks::id.eq(id))
                        .filter(tasks::user_id.eq(owner))
                        .filter(tasks::status.eq_any(vec![
                            TaskStatus::Pending.as_str(),
                            TaskStatus::Processing.as_str(),
                        ])),
                )
                .set((
                    tasks::status.eq(TaskStatus::Cancelled.as_str()),
                    tasks::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if rows == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn resummarize(
        &self,
        id: Uuid,
        owner: &str,
        config: TaskConfig,
    ) -> Result<(), StoreError> {
        let conn = self.database.get().await?;
        let owner = owner.to_string();

        conn.interact(move |conn| {
            conn.transaction::<_, TxnError, _>(|conn| {
                let transcript: Option<String> = task_results::table
                    .find(id)
                    .select(task_results::transcript)
                    .first(conn)
                    .optional()?;
                let transcript = match transcript {
                    Some(t) if !t.is_empty() => t,
                    _ => return Err(TxnError::MissingTranscript),
                };

                let rows = diesel::update(
                    tasks::table
                        .filter(tasks::id.eq(id))
                        .filter(tasks::user_id.eq(&owner))
                        .filter(tasks::status.eq(TaskStatus::Completed.as_str())),
                )
                .set((
                    tasks::status.eq(TaskStatus::Processing.as_str()),
                    tasks::error_message.eq(None::<String>),
                    tasks::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;

                if rows == 0 {
                    return Err(TxnError::Conflict(TaskStatus::Completed));
                }

                let message = TaskMessage::summary(id, &owner, &transcript, config);
                let outbox = NewOutboxRow::from_message(id, OutboxKind::Summary, &message)?;
                diesel::insert_into(outbox_events::table)
                    .values(&outbox)
                    .execute(conn)?;

                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
        .map_err(|e| map_txn_error(id, e))
    }

    async fn reap_stale_processing(&self, older_than: Duration) -> Result<u64, StoreError> {
        let conn = self.database.get().await?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = conn
            .interact(move |conn| {
                diesel::update(
                    tasks::table
                        .filter(tasks::status.eq(TaskStatus::Processing.as_str()))
                        .filter(tasks::updated_at.lt(cutoff)),
                )
                .set((
                    tasks::status.eq(TaskStatus::Failed.as_str()),
                    tasks::error_message.eq("task timed out (system recovery)"),
                    tasks::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows as u64)
    }
}
