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

//! PostgreSQL outbox claiming.
//!
//! Claiming must hold an open transaction across the queue publish awaits, so
//! this store runs on a dedicated `tokio-postgres` client rather than the
//! diesel pool (whose queries execute inside blocking closures). The claim
//! uses `FOR UPDATE SKIP LOCKED`: concurrent relays never contend on the same
//! rows, and a crashed relay's locks vanish with its connection, leaving its
//! rows pending for the next pass.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{OutboxEvent, OutboxKind, OutboxStatus};

use super::{OutboxHandler, OutboxStore};

const CLAIM_SQL: &str = "\
    SELECT id, aggregate_id, event_type, payload, status, created_at, processed_at \
    FROM outbox_events \
    WHERE status = 'pending' \
    ORDER BY created_at ASC \
    LIMIT $1 \
    FOR UPDATE SKIP LOCKED";

const MARK_SENT_SQL: &str =
    "UPDATE outbox_events SET status = 'sent', processed_at = NOW() WHERE id = $1";

/// Outbox claiming store over a dedicated connection.
pub struct PgOutboxStore {
    client: Mutex<tokio_postgres::Client>,
    driver: tokio::task::JoinHandle<()>,
}

impl PgOutboxStore {
    /// Dials a dedicated connection for claim transactions.
    ///
    /// The connection driver runs in a background task; if it exits, later
    /// claims fail and the relay loop retries with a fresh store.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(database_url, tokio_postgres::NoTls)
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Outbox store connection closed: {}", e);
            }
        });

        Ok(Self {
            client: Mutex::new(client),
            driver,
        })
    }

    fn event_from_row(row: &tokio_postgres::Row) -> Result<OutboxEvent, StoreError> {
        let kind_text: String = row.get(2);
        let status_text: String = row.get(4);
        Ok(OutboxEvent {
            id: row.get::<_, Uuid>(0),
            aggregate_id: row.get::<_, Uuid>(1),
            kind: OutboxKind::from_str(&kind_text).map_err(StoreError::Database)?,
            payload: row.get::<_, serde_json::Value>(3),
            status: OutboxStatus::from_str(&status_text).map_err(StoreError::Database)?,
            created_at: row.get::<_, DateTime<Utc>>(5),
            processed_at: row.get::<_, Option<DateTime<Utc>>>(6),
        })
    }
}

impl Drop for PgOutboxStore {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_batch(
        &self,
        limit: i64,
        handler: OutboxHandler<'_>,
    ) -> Result<usize, StoreError> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = tx
            .query(CLAIM_SQL, &[&limit])
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut sent = 0usize;
        for row in &rows {
            let event = Self::event_from_row(row)?;
            let event_id = event.id;

            match handler(event).await {
                Ok(()) => {
                    tx.execute(MARK_SENT_SQL, &[&event_id])
                        .await
                        .map_err(|e| StoreError::Database(e.to_string()))?;
                    sent += 1;
                }
                Err(e) => {
                    // Row stays pending for a later pass.
                    warn!(event_id = %event_id, "Outbox publish failed, leaving row pending: {}", e);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if sent > 0 {
            debug!("Outbox relay marked {} event(s) sent", sent);
        }
        Ok(sent)
    }
}
